//! Filename → 32-bit ID hashing.
//!
//! MIX archives never store filenames, only a 32-bit ID derived from the
//! name.  Two incompatible schemes exist and the generation decides which
//! one applies.
//!
//! # Name encoding
//! Names are encoded as Windows-1252 and ASCII letters are upper-cased
//! before hashing (non-ASCII letters keep their case, matching the
//! historical tools).  [`try_hash`] rejects characters Windows-1252 cannot
//! represent; [`hash`] substitutes `?` for them and is total.
//!
//! # Classic scheme (Tiberian Dawn, Red Alert)
//! The encoded bytes are consumed as little-endian 32-bit words, the final
//! short word zero-padded.  Starting from 0, every word is folded in with
//! `id = rotl(id, 1) + word` (wrapping).
//!
//! # CRC scheme (Tiberian Sun and later)
//! If the length is not a multiple of 4, one byte holding `len % 4` is
//! appended, then the first byte of the final partial word is repeated
//! until the length is a multiple of 4.  The ID is the IEEE CRC-32 (zlib
//! polynomial) of the padded bytes.
//!
//! Both schemes map the empty name to 0.

use crc32fast::Hasher;

/// Which hashing rules a generation uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyScheme {
    Classic,
    Crc,
}

/// Windows-1252 code points for bytes 0x80..=0x9F.  `None` marks the five
/// undefined bytes, which map to the C1 control with the same value.
const CP1252_HIGH: [Option<char>; 32] = [
    Some('\u{20AC}'), None,             Some('\u{201A}'), Some('\u{0192}'),
    Some('\u{201E}'), Some('\u{2026}'), Some('\u{2020}'), Some('\u{2021}'),
    Some('\u{02C6}'), Some('\u{2030}'), Some('\u{0160}'), Some('\u{2039}'),
    Some('\u{0152}'), None,             Some('\u{017D}'), None,
    None,             Some('\u{2018}'), Some('\u{2019}'), Some('\u{201C}'),
    Some('\u{201D}'), Some('\u{2022}'), Some('\u{2013}'), Some('\u{2014}'),
    Some('\u{02DC}'), Some('\u{2122}'), Some('\u{0161}'), Some('\u{203A}'),
    Some('\u{0153}'), None,             Some('\u{017E}'), Some('\u{0178}'),
];

fn encode_char(c: char) -> Option<u8> {
    let cp = c as u32;
    match cp {
        0x00..=0x7F | 0xA0..=0xFF => Some(cp as u8),
        0x80..=0x9F if CP1252_HIGH[(cp - 0x80) as usize].is_none() => Some(cp as u8),
        _ => CP1252_HIGH
            .iter()
            .position(|&m| m == Some(c))
            .map(|i| 0x80 + i as u8),
    }
}

/// Encode `name` as Windows-1252, failing on the first unmappable char.
pub fn encode_name(name: &str) -> Option<Vec<u8>> {
    name.chars().map(encode_char).collect()
}

/// Decode Windows-1252 bytes.  Every byte yields exactly one char.
pub fn decode_name(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| match b {
            0x80..=0x9F => CP1252_HIGH[(b - 0x80) as usize].unwrap_or(b as char),
            _           => b as char,
        })
        .collect()
}

/// Hash already-encoded name bytes.
pub fn hash_bytes(bytes: &[u8], scheme: KeyScheme) -> u32 {
    let upper: Vec<u8> = bytes.iter().map(u8::to_ascii_uppercase).collect();
    match scheme {
        KeyScheme::Classic => classic(&upper),
        KeyScheme::Crc     => crc(upper),
    }
}

/// Total hash over any string; unmappable characters hash as `?`.
pub fn hash(name: &str, scheme: KeyScheme) -> u32 {
    let bytes: Vec<u8> = name
        .chars()
        .map(|c| encode_char(c).unwrap_or(b'?'))
        .collect();
    hash_bytes(&bytes, scheme)
}

/// Strict hash; `None` if the name is not representable in Windows-1252.
pub fn try_hash(name: &str, scheme: KeyScheme) -> Option<u32> {
    encode_name(name).map(|b| hash_bytes(&b, scheme))
}

fn classic(bytes: &[u8]) -> u32 {
    bytes.chunks(4).fold(0u32, |id, chunk| {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        id.rotate_left(1).wrapping_add(u32::from_le_bytes(word))
    })
}

fn crc(mut bytes: Vec<u8>) -> u32 {
    let len  = bytes.len();
    let tail = len & 3;
    if tail != 0 {
        let whole = len - tail;
        bytes.push(tail as u8);
        let fill = bytes[whole];
        bytes.extend(std::iter::repeat(fill).take(3 - tail));
    }
    let mut hasher = Hasher::new();
    hasher.update(&bytes);
    hasher.finalize()
}
