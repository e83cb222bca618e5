//! Embedded name table ("local mix database.dat").
//!
//! MIX indices only store IDs.  Editing tools keep a list of the original
//! filenames in an ordinary entry under a reserved ID so names survive a
//! round trip:
//!
//! ```text
//! signature[32] | size u32 | type u32 (0) | version u32 (0) | game u32 | count u32
//! count × NUL-terminated Windows-1252 names (the last is the table's own name)
//! ```

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

use crate::header::{Generation, NAME_TABLE_NAME};
use crate::id;

pub const SIGNATURE: &[u8; 32] = b"XCC by Olaf van der Spek\x1a\x04\x17'\x10\x19\x80\x00";
pub const TABLE_HEADER_LEN: usize = 52;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameTable {
    pub game_id: u32,
    pub names:   Vec<String>,
}

impl NameTable {
    pub fn generation(&self) -> Option<Generation> {
        Generation::from_xcc_game_id(self.game_id)
    }

    /// Build the table bytes for `names`, appending the table's own name.
    /// Names Windows-1252 cannot represent are skipped.
    pub fn encode<'a, I>(names: I, generation: Generation) -> Vec<u8>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut encoded: Vec<Vec<u8>> = names
            .into_iter()
            .filter(|n| !n.eq_ignore_ascii_case(NAME_TABLE_NAME))
            .filter_map(id::encode_name)
            .collect();
        encoded.push(NAME_TABLE_NAME.as_bytes().to_vec());

        let body_len: usize = encoded.iter().map(|n| n.len() + 1).sum();
        let size = TABLE_HEADER_LEN + body_len;

        let mut out = Vec::with_capacity(size);
        out.extend_from_slice(SIGNATURE);
        out.extend_from_slice(&(size as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&generation.xcc_game_id().to_le_bytes());
        out.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        for name in encoded {
            out.extend_from_slice(&name);
            out.push(0);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() < TABLE_HEADER_LEN || &bytes[..32] != SIGNATURE {
            return Err("missing name table signature".into());
        }
        let mut cur = Cursor::new(&bytes[32..]);
        let size    = read(&mut cur)? as usize;
        let _kind   = read(&mut cur)?;
        let _ver    = read(&mut cur)?;
        let game_id = read(&mut cur)?;
        let count   = read(&mut cur)?;
        if size < TABLE_HEADER_LEN || size > bytes.len() {
            return Err(format!("name table declares {size} bytes, entry holds {}", bytes.len()));
        }

        let mut rest = Vec::new();
        cur.read_to_end(&mut rest).map_err(|e| e.to_string())?;
        let rest = &rest[..size - TABLE_HEADER_LEN];

        let mut names = Vec::with_capacity(count as usize);
        let mut parts = rest.split(|&b| b == 0);
        for _ in 0..count {
            match parts.next() {
                Some(raw) => names.push(id::decode_name(raw)),
                None => return Err("name table ends early".into()),
            }
        }
        Ok(Self { game_id, names })
    }
}

fn read<R: Read>(cur: &mut R) -> Result<u32, String> {
    cur.read_u32::<LittleEndian>().map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_is_75_bytes() {
        let bytes = NameTable::encode(std::iter::empty(), Generation::RedAlert);
        assert_eq!(bytes.len(), 75);
        assert_eq!(&bytes[32..36], &75u32.to_le_bytes());
        assert_eq!(&bytes[44..48], &1u32.to_le_bytes());
    }

    #[test]
    fn decode_reads_back_names() {
        let bytes = NameTable::encode(["rules.ini", "caf\u{e9}.shp"], Generation::TiberianSun);
        let table = NameTable::decode(&bytes).unwrap();
        assert_eq!(table.generation(), Some(Generation::TiberianSun));
        assert_eq!(table.names, vec!["rules.ini", "caf\u{e9}.shp", NAME_TABLE_NAME]);
    }

    #[test]
    fn own_name_is_not_duplicated() {
        let bytes = NameTable::encode([NAME_TABLE_NAME, "a.pal"], Generation::TiberianDawn);
        let table = NameTable::decode(&bytes).unwrap();
        assert_eq!(table.names.len(), 2);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(NameTable::decode(b"not a table").is_err());
        let mut bytes = NameTable::encode(["x"], Generation::RedAlert);
        bytes.truncate(60);
        assert!(NameTable::decode(&bytes).is_err());
    }
}
