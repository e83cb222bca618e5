//! Fixed preamble of a MIX container and the generation/protection model.
//!
//! ```text
//! Legacy             : count u16 | body_size u32
//! Extended           : reserved u16 (= 0) | flags u16 | count u16 | body_size u32
//! Extended, encrypted: reserved u16 (= 0) | flags u16 | key source | sealed(count | body_size | index)
//! ```
//!
//! All fields are little-endian.  The reserved half of the Extended flags
//! word is what tells the two layouts apart: a Legacy file starts with its
//! entry count, which is non-zero for every non-empty Legacy container.

use byteorder::{LittleEndian, ReadBytesExt};
use std::fmt;
use std::io::Read;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::id::{self, KeyScheme};

/// Flags word of an Extended preamble.
pub const FLAGS_LEN:           u64 = 4;
/// Entry count and body size, the part encryption covers.
pub const COUNTS_LEN:          u64 = 6;
pub const LEGACY_HEADER_LEN:   u64 = COUNTS_LEN;
pub const EXTENDED_HEADER_LEN: u64 = FLAGS_LEN + COUNTS_LEN;

pub const FLAG_CHECKSUM:  u16 = 0x0001;
pub const FLAG_ENCRYPTED: u16 = 0x0002;
const FLAG_MASK:          u16 = FLAG_CHECKSUM | FLAG_ENCRYPTED;

/// Name of the embedded name table entry, hashed per generation.
pub const NAME_TABLE_NAME: &str = "local mix database.dat";

// ── Layout ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layout {
    Legacy,
    Extended,
}

impl Layout {
    pub fn header_len(self) -> u64 {
        match self {
            Layout::Legacy   => LEGACY_HEADER_LEN,
            Layout::Extended => EXTENDED_HEADER_LEN,
        }
    }
}

// ── IdOrder ──────────────────────────────────────────────────────────────────

/// Comparison the game engines binary-search the index with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdOrder {
    Signed,
    Unsigned,
}

impl IdOrder {
    pub fn key(self, id: u32) -> i64 {
        match self {
            IdOrder::Signed   => id as i32 as i64,
            IdOrder::Unsigned => id as i64,
        }
    }
}

// ── Generation ───────────────────────────────────────────────────────────────

/// MIX format generations, named after the games that introduced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum Generation {
    TiberianDawn,
    RedAlert,
    TiberianSun,
}

impl Generation {
    pub const ALL: [Generation; 3] = [
        Generation::TiberianDawn,
        Generation::RedAlert,
        Generation::TiberianSun,
    ];

    pub fn layout(self) -> Layout {
        match self {
            Generation::TiberianDawn => Layout::Legacy,
            _                        => Layout::Extended,
        }
    }

    pub fn key_scheme(self) -> KeyScheme {
        match self {
            Generation::TiberianSun => KeyScheme::Crc,
            _                       => KeyScheme::Classic,
        }
    }

    pub fn id_order(self) -> IdOrder {
        match self {
            Generation::TiberianSun => IdOrder::Unsigned,
            _                       => IdOrder::Signed,
        }
    }

    /// Legacy files carry no flags word, so only `Protection::None` fits.
    pub fn supports(self, protection: Protection) -> bool {
        match self.layout() {
            Layout::Legacy   => protection == Protection::None,
            Layout::Extended => true,
        }
    }

    /// Largest entry count the index can describe.
    pub fn max_entries(self) -> usize {
        u16::MAX as usize
    }

    /// Reserved ID of the embedded name table.
    pub fn name_table_id(self) -> u32 {
        id::hash(NAME_TABLE_NAME, self.key_scheme())
    }

    /// Game ID written into the embedded name table.
    pub fn xcc_game_id(self) -> u32 {
        match self {
            Generation::TiberianDawn => 0,
            Generation::RedAlert     => 1,
            Generation::TiberianSun  => 2,
        }
    }

    pub fn from_xcc_game_id(game: u32) -> Option<Self> {
        match game {
            0              => Some(Generation::TiberianDawn),
            1              => Some(Generation::RedAlert),
            2..=6 | 15     => Some(Generation::TiberianSun),
            _              => None,
        }
    }

    pub fn short_name(self) -> &'static str {
        match self {
            Generation::TiberianDawn => "td",
            Generation::RedAlert     => "ra",
            Generation::TiberianSun  => "ts",
        }
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Generation::TiberianDawn => "Tiberian Dawn",
            Generation::RedAlert     => "Red Alert",
            Generation::TiberianSun  => "Tiberian Sun",
        };
        f.write_str(name)
    }
}

impl FromStr for Generation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "td" | "tiberiandawn" | "tiberian-dawn"         => Ok(Generation::TiberianDawn),
            "ra" | "redalert" | "red-alert"                 => Ok(Generation::RedAlert),
            "ts" | "tiberiansun" | "tiberian-sun" | "ra2"   => Ok(Generation::TiberianSun),
            other => Err(format!("unknown generation '{other}' (expected td, ra or ts)")),
        }
    }
}

// ── Protection ───────────────────────────────────────────────────────────────

/// Protection level of a container.
///
/// Only Extended generations can express anything but `None`.  Encryption
/// is obfuscation: the public key that unwraps the index key ships with
/// every reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize)]
pub enum Protection {
    #[default]
    None,
    Checksummed,
    Encrypted,
    ChecksummedEncrypted,
}

impl Protection {
    pub fn from_parts(checksum: bool, encrypted: bool) -> Self {
        match (checksum, encrypted) {
            (false, false) => Protection::None,
            (true,  false) => Protection::Checksummed,
            (false, true)  => Protection::Encrypted,
            (true,  true)  => Protection::ChecksummedEncrypted,
        }
    }

    pub fn from_flags(flags: u16) -> Option<Self> {
        if flags & !FLAG_MASK != 0 {
            return None;
        }
        Some(Self::from_parts(flags & FLAG_CHECKSUM != 0, flags & FLAG_ENCRYPTED != 0))
    }

    pub fn flags(self) -> u16 {
        let mut flags = 0;
        if self.has_checksum() { flags |= FLAG_CHECKSUM; }
        if self.is_encrypted() { flags |= FLAG_ENCRYPTED; }
        flags
    }

    pub fn has_checksum(self) -> bool {
        matches!(self, Protection::Checksummed | Protection::ChecksummedEncrypted)
    }

    pub fn is_encrypted(self) -> bool {
        matches!(self, Protection::Encrypted | Protection::ChecksummedEncrypted)
    }
}

// ── Header ───────────────────────────────────────────────────────────────────

/// Decoded preamble.  Regenerated from container state on every flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub layout:     Layout,
    pub protection: Protection,
    pub count:      u16,
    pub body_size:  u32,
}

impl Header {
    /// Length of the clear preamble of an unencrypted container.
    pub fn len(&self) -> u64 {
        self.layout.header_len()
    }

    pub fn flags_bytes(&self) -> [u8; FLAGS_LEN as usize] {
        let mut out = [0u8; FLAGS_LEN as usize];
        out[2..].copy_from_slice(&self.protection.flags().to_le_bytes());
        out
    }

    pub fn counts_bytes(&self) -> [u8; COUNTS_LEN as usize] {
        let mut out = [0u8; COUNTS_LEN as usize];
        out[..2].copy_from_slice(&self.count.to_le_bytes());
        out[2..].copy_from_slice(&self.body_size.to_le_bytes());
        out
    }

    /// Flags word (Extended only) followed by the counts.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len() as usize);
        if self.layout == Layout::Extended {
            out.extend_from_slice(&self.flags_bytes());
        }
        out.extend_from_slice(&self.counts_bytes());
        out
    }

    /// Parse a Legacy preamble.
    pub fn read_legacy<R: Read>(reader: R) -> Result<Self> {
        Self::read_counts(reader, Layout::Legacy, Protection::None)
    }

    /// Parse an Extended flags word, rejecting a non-zero reserved half and
    /// unknown flag bits.
    pub fn read_flags<R: Read>(mut reader: R) -> Result<Protection> {
        let reserved = reader.read_u16::<LittleEndian>()?;
        if reserved != 0 {
            return Err(Error::format("reserved half of the flags word is not zero"));
        }
        let flags = reader.read_u16::<LittleEndian>()?;
        Protection::from_flags(flags)
            .ok_or_else(|| Error::format(format!("unsupported flags {flags:#06x}")))
    }

    /// Parse entry count and body size.
    pub fn read_counts<R: Read>(mut reader: R, layout: Layout, protection: Protection) -> Result<Self> {
        let count     = reader.read_u16::<LittleEndian>()?;
        let body_size = reader.read_u32::<LittleEndian>()?;
        Ok(Self { layout, protection, count, body_size })
    }

    /// Parse the clear preamble of an unencrypted Extended container.
    pub fn read_extended<R: Read>(mut reader: R) -> Result<Self> {
        let protection = Self::read_flags(&mut reader)?;
        Self::read_counts(reader, Layout::Extended, protection)
    }
}
