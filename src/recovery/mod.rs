//! Rollback journal that makes a flush crash-atomic.
//!
//! Before a flush overwrites anything the last committed layout still
//! needs, it appends the original bytes of those regions past the physical
//! end of the stream:
//!
//! ```text
//! payload : repeat { offset u64 | length u64 | bytes[length] }
//! footer  : magic "MIXJRNL\0" | segments u32 | old_len u64 | payload_len u64 | blake3(payload)
//! ```
//!
//! Truncating the stream to its new logical length removes the journal and
//! is the commit point.  A stream that still ends in a valid footer was
//! interrupted mid-flush; restoring the segments and truncating to
//! `old_len` brings back the previous state byte for byte.
//!
//! Segments may reach past `old_len` into bytes the session appended.  A
//! flush that fails while the process lives restores those too, so the
//! session can retry.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use tracing::debug;

use crate::error::Result;

pub const MAGIC: &[u8; 8] = b"MIXJRNL\0";
pub const FOOTER_LEN: u64 = 8 + 4 + 8 + 8 + 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub offset: u64,
    pub bytes:  Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Journal {
    pub old_len:  u64,
    pub segments: Vec<Segment>,
}

impl Journal {
    /// Save the current bytes of `regions` below `limit`, normally the
    /// physical length of the stream.
    pub fn capture<S: Read + Seek>(
        stream: &mut S,
        old_len: u64,
        limit: u64,
        regions: &[(u64, u64)],
    ) -> Result<Self> {
        let mut segments = Vec::new();
        for &(offset, length) in regions {
            let end = (offset + length).min(limit);
            if offset >= end {
                continue;
            }
            let mut bytes = vec![0u8; (end - offset) as usize];
            stream.seek(SeekFrom::Start(offset))?;
            stream.read_exact(&mut bytes)?;
            segments.push(Segment { offset, bytes });
        }
        Ok(Self { old_len, segments })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        for seg in &self.segments {
            payload.extend_from_slice(&seg.offset.to_le_bytes());
            payload.extend_from_slice(&(seg.bytes.len() as u64).to_le_bytes());
            payload.extend_from_slice(&seg.bytes);
        }
        let digest = blake3::hash(&payload);

        let mut out = payload;
        let payload_len = out.len() as u64;
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&(self.segments.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.old_len.to_le_bytes());
        out.extend_from_slice(&payload_len.to_le_bytes());
        out.extend_from_slice(digest.as_bytes());
        out
    }

    /// Append the encoded journal at `at` (normally the physical end).
    pub fn write_at<S: Write + Seek>(&self, stream: &mut S, at: u64) -> Result<()> {
        stream.seek(SeekFrom::Start(at))?;
        stream.write_all(&self.encode())?;
        Ok(())
    }

    /// Look for a complete journal ending at `physical_len`.
    ///
    /// A torn or foreign tail yields `None`; it is then just slack.
    pub fn find<S: Read + Seek>(stream: &mut S, physical_len: u64) -> Result<Option<Self>> {
        if physical_len < FOOTER_LEN {
            return Ok(None);
        }
        let mut footer = [0u8; FOOTER_LEN as usize];
        stream.seek(SeekFrom::Start(physical_len - FOOTER_LEN))?;
        stream.read_exact(&mut footer)?;
        if &footer[..8] != MAGIC {
            return Ok(None);
        }

        let mut cur = Cursor::new(&footer[8..]);
        let count       = cur.read_u32::<LittleEndian>()?;
        let old_len     = cur.read_u64::<LittleEndian>()?;
        let payload_len = cur.read_u64::<LittleEndian>()?;
        let mut digest = [0u8; 32];
        cur.read_exact(&mut digest)?;

        let Some(start) = (physical_len - FOOTER_LEN).checked_sub(payload_len) else {
            return Ok(None);
        };
        if start < old_len {
            return Ok(None);
        }

        let mut payload = vec![0u8; payload_len as usize];
        stream.seek(SeekFrom::Start(start))?;
        stream.read_exact(&mut payload)?;
        if blake3::hash(&payload).as_bytes() != &digest {
            debug!("journal footer present but payload digest differs");
            return Ok(None);
        }

        match Self::parse_segments(&payload, count, start) {
            Some(segments) => Ok(Some(Self { old_len, segments })),
            None => Ok(None),
        }
    }

    /// Segments must end before the journal itself starts.
    fn parse_segments(payload: &[u8], count: u32, limit: u64) -> Option<Vec<Segment>> {
        let mut cur = Cursor::new(payload);
        let mut segments = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let offset = cur.read_u64::<LittleEndian>().ok()?;
            let length = cur.read_u64::<LittleEndian>().ok()?;
            if offset.checked_add(length)? > limit {
                return None;
            }
            let mut bytes = vec![0u8; usize::try_from(length).ok()?];
            cur.read_exact(&mut bytes).ok()?;
            segments.push(Segment { offset, bytes });
        }
        (cur.position() == payload.len() as u64).then_some(segments)
    }

    /// Write every saved segment back.  The caller truncates afterwards.
    pub fn restore<S: Write + Seek>(&self, stream: &mut S) -> Result<()> {
        for seg in &self.segments {
            stream.seek(SeekFrom::Start(seg.offset))?;
            stream.write_all(&seg.bytes)?;
        }
        Ok(())
    }

    /// Patch `buf`, which holds stream bytes read from `pos`, so it shows
    /// the pre-flush content.
    pub fn overlay(&self, pos: u64, buf: &mut [u8]) {
        let end = pos + buf.len() as u64;
        for seg in &self.segments {
            let seg_end = seg.offset + seg.bytes.len() as u64;
            let lo = seg.offset.max(pos);
            let hi = seg_end.min(end);
            if lo >= hi {
                continue;
            }
            let dst = (lo - pos) as usize..(hi - pos) as usize;
            let src = (lo - seg.offset) as usize..(hi - seg.offset) as usize;
            buf[dst].copy_from_slice(&seg.bytes[src]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_with_journal() -> (Cursor<Vec<u8>>, Journal) {
        let mut cur = Cursor::new(b"0123456789abcdef".to_vec());
        let journal = Journal::capture(&mut cur, 16, 16, &[(0, 4), (14, 8)]).unwrap();
        let end = cur.get_ref().len() as u64;
        journal.write_at(&mut cur, end).unwrap();
        (cur, journal)
    }

    #[test]
    fn capture_clips_to_limit() {
        let (_, journal) = stream_with_journal();
        assert_eq!(journal.segments.len(), 2);
        assert_eq!(journal.segments[1].bytes, b"ef");
    }

    #[test]
    fn find_then_restore() {
        let (mut cur, journal) = stream_with_journal();
        cur.get_mut()[..4].copy_from_slice(b"XXXX");
        let len = cur.get_ref().len() as u64;

        let found = Journal::find(&mut cur, len).unwrap().unwrap();
        assert_eq!(found, journal);
        found.restore(&mut cur).unwrap();
        cur.get_mut().truncate(found.old_len as usize);
        assert_eq!(cur.get_ref().as_slice(), b"0123456789abcdef");
    }

    #[test]
    fn overlay_patches_reads() {
        let (mut cur, journal) = stream_with_journal();
        cur.get_mut()[2..6].copy_from_slice(b"ZZZZ");
        let mut buf = cur.get_ref()[1..7].to_vec();
        journal.overlay(1, &mut buf);
        assert_eq!(&buf, b"123ZZ6" as &[u8]);
        // Only [0, 4) was journaled; bytes 4..6 stay as written.
    }

    #[test]
    fn torn_journal_is_ignored() {
        let (mut cur, _) = stream_with_journal();
        // First byte of saved data in the payload.
        cur.get_mut()[16 + 16] ^= 0xFF;
        let len = cur.get_ref().len() as u64;
        assert!(Journal::find(&mut cur, len).unwrap().is_none());
    }

    #[test]
    fn capture_reaches_past_old_len_up_to_limit() {
        let mut cur = Cursor::new(b"committedSESSION".to_vec());
        let journal = Journal::capture(&mut cur, 9, 16, &[(6, 6)]).unwrap();
        assert_eq!(journal.segments[0].bytes, b"tedSES");

        journal.write_at(&mut cur, 16).unwrap();
        cur.get_mut()[6..12].copy_from_slice(b"!!!!!!");
        let len = cur.get_ref().len() as u64;
        let found = Journal::find(&mut cur, len).unwrap().unwrap();
        assert_eq!(found.old_len, 9);
        found.restore(&mut cur).unwrap();
        assert_eq!(&cur.get_ref()[..16], b"committedSESSION");
    }

    #[test]
    fn plain_data_has_no_journal() {
        let mut cur = Cursor::new(vec![0u8; 200]);
        assert!(Journal::find(&mut cur, 200).unwrap().is_none());
    }
}
