//! Layout detection and parsing of preamble, key source and index.

use byteorder::{ByteOrder, LittleEndian};
use std::io::{Read, Seek};
use tracing::{debug, warn};

use super::read_stream_at;
use crate::checksum::DIGEST_LEN;
use crate::crypto::{self, CryptoError, IndexKey, BLOCK_LEN, KEY_SOURCE_LEN};
use crate::error::{Error, Result};
use crate::header::{
    Generation, Header, IdOrder, Layout, Protection, COUNTS_LEN, EXTENDED_HEADER_LEN, FLAGS_LEN,
    LEGACY_HEADER_LEN,
};
use crate::id::KeyScheme;
use crate::index::{Index, OrderFit, ENTRY_LEN};
use crate::names::NameTable;
use crate::recovery::Journal;

pub(super) struct Decoded {
    pub generation:    Generation,
    pub header:        Header,
    pub key:           Option<IndexKey>,
    pub index:         Index,
    pub prefix_len:    u64,
    pub logical_len:   u64,
    pub stored_digest: Option<[u8; DIGEST_LEN]>,
}

struct Reader<'a, S> {
    stream:  &'a mut S,
    overlay: Option<&'a Journal>,
}

impl<S: Read + Seek> Reader<'_, S> {
    fn read(&mut self, pos: u64, len: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len as usize];
        read_stream_at(self.stream, self.overlay, pos, &mut buf)?;
        Ok(buf)
    }
}

/// Parse a container occupying `[0, len)` of `stream`.
///
/// `strict` rejects bytes past the declared end instead of ignoring them.
pub(super) fn decode<S: Read + Seek>(
    stream: &mut S,
    overlay: Option<&Journal>,
    len: u64,
    hint: Option<Generation>,
    strict: bool,
) -> Result<Decoded> {
    if len < LEGACY_HEADER_LEN {
        return Err(Error::format(format!("{len} bytes is too short for a MIX header")));
    }
    let mut rd = Reader { stream, overlay };
    let head = rd.read(0, len.min(EXTENDED_HEADER_LEN))?;

    let decoded = if LittleEndian::read_u16(&head[..2]) != 0 {
        decode_legacy(&mut rd, &head, len)?
    } else {
        let extended = if len >= EXTENDED_HEADER_LEN {
            decode_extended(&mut rd, &head, len)
        } else {
            Err(Error::format("too short for an Extended header"))
        };
        match extended {
            Ok(d) if d.logical_len == len => d,
            other => {
                let body = LittleEndian::read_u32(&head[2..6]) as u64;
                if LEGACY_HEADER_LEN + body == len {
                    debug!("empty legacy container");
                    decode_legacy(&mut rd, &head, len)?
                } else {
                    other?
                }
            }
        }
    };

    if decoded.logical_len < len {
        let slack = len - decoded.logical_len;
        if strict {
            return Err(Error::format(format!("{slack} bytes past the declared end")));
        }
        warn!(slack, "ignoring bytes past the declared end of the container");
    }

    let generation = pick_generation(&mut rd, &decoded, hint)?;
    Ok(Decoded { generation, ..decoded.into_decoded() })
}

/// Layout-level result before the generation is settled.
struct Parsed {
    header:        Header,
    key:           Option<IndexKey>,
    index:         Index,
    fit:           OrderFit,
    prefix_len:    u64,
    logical_len:   u64,
    stored_digest: Option<[u8; DIGEST_LEN]>,
}

impl Parsed {
    fn into_decoded(self) -> Decoded {
        let generation = match self.header.layout {
            Layout::Legacy   => Generation::TiberianDawn,
            Layout::Extended => Generation::RedAlert,
        };
        Decoded {
            generation,
            header:        self.header,
            key:           self.key,
            index:         self.index,
            prefix_len:    self.prefix_len,
            logical_len:   self.logical_len,
            stored_digest: self.stored_digest,
        }
    }
}

fn decode_legacy<S: Read + Seek>(rd: &mut Reader<'_, S>, head: &[u8], len: u64) -> Result<Parsed> {
    let header = Header::read_legacy(&head[..LEGACY_HEADER_LEN as usize])?;
    let block_len = header.count as u64 * ENTRY_LEN as u64;
    let prefix_len = LEGACY_HEADER_LEN + block_len;
    let logical_len = prefix_len + header.body_size as u64;
    if logical_len > len {
        return Err(Error::Truncated { declared: logical_len, available: len });
    }

    let index_block = rd.read(LEGACY_HEADER_LEN, block_len)?;
    let (index, fit) = Index::decode(&index_block)?;
    index.check_bounds(header.body_size)?;

    Ok(Parsed {
        header,
        key: None,
        index,
        fit,
        prefix_len,
        logical_len,
        stored_digest: None,
    })
}

fn decode_extended<S: Read + Seek>(rd: &mut Reader<'_, S>, head: &[u8], len: u64) -> Result<Parsed> {
    let protection = Header::read_flags(&head[..FLAGS_LEN as usize])?;
    if protection.is_encrypted() {
        return decode_encrypted(rd, protection, len);
    }

    let header = Header::read_extended(head)?;
    let block_len = header.count as u64 * ENTRY_LEN as u64;
    let prefix_len = EXTENDED_HEADER_LEN + block_len;
    let logical_len = end_of(&header, prefix_len);
    if logical_len > len {
        return Err(Error::Truncated { declared: logical_len, available: len });
    }

    let index_block = rd.read(EXTENDED_HEADER_LEN, block_len)?;
    let (index, fit) = Index::decode(&index_block)?;
    index.check_bounds(header.body_size)?;
    let stored_digest = read_digest(rd, &header, prefix_len)?;

    Ok(Parsed { header, key: None, index, fit, prefix_len, logical_len, stored_digest })
}

/// Parse an encrypted Extended container.
///
/// Nothing after the key source can be told apart from noise once the key
/// is wrong, so every inconsistency past that point is a key failure.
fn decode_encrypted<S: Read + Seek>(
    rd: &mut Reader<'_, S>,
    protection: Protection,
    len: u64,
) -> Result<Parsed> {
    let sealed_start = FLAGS_LEN + KEY_SOURCE_LEN as u64;
    if len < sealed_start {
        return Err(CryptoError::SourceLength((len - FLAGS_LEN) as usize).into());
    }
    let key = IndexKey::unlock(&rd.read(FLAGS_LEN, KEY_SOURCE_LEN as u64)?)?;

    if len < sealed_start + BLOCK_LEN as u64 {
        return Err(implausible("first cipher block is missing"));
    }
    let first = key.decrypt(&rd.read(sealed_start, BLOCK_LEN as u64)?)?;
    let header = Header::read_counts(&first[..COUNTS_LEN as usize], Layout::Extended, protection)?;

    let plain_len = COUNTS_LEN as usize + header.count as usize * ENTRY_LEN;
    let sealed_len = crypto::sealed_len(plain_len) as u64;
    let prefix_len = sealed_start + sealed_len;
    let logical_len = end_of(&header, prefix_len);
    if logical_len > len {
        return Err(implausible(format!("declares {logical_len} bytes, {len} available")));
    }

    let plain = key.decrypt(&rd.read(sealed_start, sealed_len)?)?;
    let (index, fit) = Index::decode(&plain[COUNTS_LEN as usize..plain_len])
        .map_err(|e| implausible(e.to_string()))?;
    index
        .check_bounds(header.body_size)
        .map_err(|e| implausible(e.to_string()))?;
    let stored_digest = read_digest(rd, &header, prefix_len)?;

    Ok(Parsed { header, key: Some(key), index, fit, prefix_len, logical_len, stored_digest })
}

fn implausible(reason: impl Into<String>) -> Error {
    Error::Key(CryptoError::Index(reason.into()))
}

/// Logical end of an Extended container whose body starts at `prefix_len`.
fn end_of(header: &Header, prefix_len: u64) -> u64 {
    let digest_len = if header.protection.has_checksum() { DIGEST_LEN as u64 } else { 0 };
    prefix_len + header.body_size as u64 + digest_len
}

fn read_digest<S: Read + Seek>(
    rd: &mut Reader<'_, S>,
    header: &Header,
    prefix_len: u64,
) -> Result<Option<[u8; DIGEST_LEN]>> {
    if !header.protection.has_checksum() {
        return Ok(None);
    }
    let raw = rd.read(prefix_len + header.body_size as u64, DIGEST_LEN as u64)?;
    let mut digest = [0u8; DIGEST_LEN];
    digest.copy_from_slice(&raw);
    Ok(Some(digest))
}

/// Settle which Extended generation a file is.
///
/// In order: a caller hint matching the layout, the game named by an
/// embedded name table, which reserved name-table ID is present, and
/// finally the order the index is sorted in.
fn pick_generation<S: Read + Seek>(
    rd: &mut Reader<'_, S>,
    parsed: &Parsed,
    hint: Option<Generation>,
) -> Result<Generation> {
    let layout = parsed.header.layout;
    if layout == Layout::Legacy {
        return Ok(Generation::TiberianDawn);
    }
    if let Some(h) = hint {
        if h.layout() == layout {
            return Ok(h);
        }
        debug!(hint = %h, "generation hint does not match the stored layout");
    }

    for scheme in [KeyScheme::Classic, KeyScheme::Crc] {
        let table_id = crate::id::hash(crate::header::NAME_TABLE_NAME, scheme);
        let Some(entry) = parsed.index.get(table_id) else {
            continue;
        };
        let bytes = rd.read(parsed.prefix_len + entry.offset as u64, entry.size as u64)?;
        if let Ok(table) = NameTable::decode(&bytes) {
            if let Some(g) = table.generation().filter(|g| g.layout() == layout) {
                return Ok(g);
            }
        }
        return Ok(match scheme {
            KeyScheme::Classic => Generation::RedAlert,
            KeyScheme::Crc     => Generation::TiberianSun,
        });
    }

    if parsed.fit.accepts(IdOrder::Unsigned) {
        Ok(Generation::TiberianSun)
    } else {
        Ok(Generation::RedAlert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn decode_bytes(bytes: Vec<u8>) -> Result<Decoded> {
        let len = bytes.len() as u64;
        decode(&mut Cursor::new(bytes), None, len, None, false)
    }

    #[test]
    fn empty_legacy_is_recognised() {
        let d = decode_bytes(vec![0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(d.generation, Generation::TiberianDawn);
        assert!(d.index.is_empty());
    }

    #[test]
    fn empty_extended_is_recognised() {
        let d = decode_bytes(vec![0; 10]).unwrap();
        assert_eq!(d.header.layout, Layout::Extended);
    }

    #[test]
    fn legacy_with_one_entry() {
        let mut bytes = vec![1, 0, 3, 0, 0, 0];
        bytes.extend_from_slice(&0x42u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(b"abc");
        let d = decode_bytes(bytes).unwrap();
        assert_eq!(d.generation, Generation::TiberianDawn);
        assert_eq!(d.index.get(0x42).unwrap().size, 3);
    }

    #[test]
    fn declared_body_past_end_is_truncated() {
        let bytes = vec![1, 0, 100, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0];
        assert!(matches!(decode_bytes(bytes), Err(Error::Truncated { .. })));
    }

    #[test]
    fn too_short_is_format_error() {
        assert!(matches!(decode_bytes(vec![1, 2, 3]), Err(Error::Format(_))));
    }

    #[test]
    fn unsigned_only_order_means_tiberian_sun() {
        let mut bytes = vec![0, 0, 0, 0, 2, 0, 0, 0, 0, 0];
        for id in [1u32, 0x8000_0000] {
            bytes.extend_from_slice(&id.to_le_bytes());
            bytes.extend_from_slice(&0u32.to_le_bytes());
            bytes.extend_from_slice(&0u32.to_le_bytes());
        }
        let d = decode_bytes(bytes).unwrap();
        assert_eq!(d.generation, Generation::TiberianSun);
    }

    #[test]
    fn slack_is_strict_when_nested() {
        let bytes = vec![0u8; 12];
        assert!(decode(&mut Cursor::new(bytes.clone()), None, 12, None, false).is_ok());
        assert!(matches!(
            decode(&mut Cursor::new(bytes), None, 12, None, true),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn checksummed_extended_reads_the_trailing_digest() {
        let mut bytes = vec![0, 0, 1, 0, 1, 0, 5, 0, 0, 0];
        bytes.extend_from_slice(&0x42u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&5u32.to_le_bytes());
        bytes.extend_from_slice(b"hello");
        bytes.extend_from_slice(&[0xAB; DIGEST_LEN]);
        let d = decode_bytes(bytes).unwrap();
        assert_eq!(d.header.protection, Protection::Checksummed);
        assert_eq!(d.prefix_len, 22);
        assert_eq!(d.logical_len, 47);
        assert_eq!(d.stored_digest, Some([0xAB; DIGEST_LEN]));
    }

    #[test]
    fn encrypted_prefix_is_decrypted_with_the_unwrapped_key() {
        let key = IndexKey::generate();
        let mut plain = vec![1, 0, 3, 0, 0, 0];
        plain.extend_from_slice(&0x42u32.to_le_bytes());
        plain.extend_from_slice(&0u32.to_le_bytes());
        plain.extend_from_slice(&3u32.to_le_bytes());

        let mut bytes = vec![0, 0, 2, 0];
        bytes.extend_from_slice(key.key_source());
        bytes.extend_from_slice(&key.encrypt(&plain).unwrap());
        bytes.extend_from_slice(b"abc");
        let d = decode_bytes(bytes).unwrap();
        assert_eq!(d.prefix_len, 4 + 80 + 24);
        assert_eq!(d.index.get(0x42).unwrap().size, 3);
        assert_eq!(d.key, Some(key));
    }

    #[test]
    fn short_key_source_is_a_key_error() {
        let mut bytes = vec![0, 0, 2, 0];
        bytes.extend_from_slice(&[0; 30]);
        assert!(matches!(
            decode_bytes(bytes),
            Err(Error::Key(CryptoError::SourceLength(30)))
        ));
    }
}
