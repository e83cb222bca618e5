//! Index entries and the index block codec.
//!
//! An index entry is 12 bytes: `id u32 | offset u32 | size u32`, all
//! little-endian, with `offset` relative to the start of the body.  The
//! block is a flat array of `count` entries written in the generation's
//! native order.
//!
//! In memory the index is a [`BTreeMap`] keyed by ID, which gives the
//! unsigned order `list()` reports and O(log n) lookups.

use byteorder::{LittleEndian, ReadBytesExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Cursor;

use crate::error::{Error, Result};
use crate::header::IdOrder;

pub const ENTRY_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct IndexEntry {
    pub id:     u32,
    pub offset: u32,
    pub size:   u32,
}

impl IndexEntry {
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.size as u64
    }
}

/// Sorted, duplicate-free set of entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Index {
    entries: BTreeMap<u32, IndexEntry>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&IndexEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut IndexEntry> {
        self.entries.get_mut(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.entries.contains_key(&id)
    }

    /// Insert a new entry.  Fails on an existing ID.
    pub fn insert(&mut self, entry: IndexEntry) -> Result<()> {
        if self.entries.contains_key(&entry.id) {
            return Err(Error::DuplicateId(entry.id));
        }
        self.entries.insert(entry.id, entry);
        Ok(())
    }

    pub fn remove(&mut self, id: u32) -> Option<IndexEntry> {
        self.entries.remove(&id)
    }

    /// Entries in ascending unsigned ID order.
    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut IndexEntry> {
        self.entries.values_mut()
    }

    /// Entries sorted by body offset (zero-length entries first).
    pub fn by_offset(&self) -> Vec<IndexEntry> {
        let mut out: Vec<IndexEntry> = self.entries.values().copied().collect();
        out.sort_by_key(|e| (e.offset, e.id));
        out
    }

    /// Entries in the order a given generation writes them.
    pub fn in_order(&self, order: IdOrder) -> Vec<IndexEntry> {
        let mut out: Vec<IndexEntry> = self.entries.values().copied().collect();
        out.sort_by_key(|e| order.key(e.id));
        out
    }

    /// Byte length of the plaintext index block.
    pub fn block_len(&self) -> usize {
        self.entries.len() * ENTRY_LEN
    }

    pub fn encode(&self, order: IdOrder) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.block_len());
        for e in self.in_order(order) {
            out.extend_from_slice(&e.id.to_le_bytes());
            out.extend_from_slice(&e.offset.to_le_bytes());
            out.extend_from_slice(&e.size.to_le_bytes());
        }
        out
    }

    /// Decode `bytes.len() / 12` entries and check the stored order.
    ///
    /// Returns the index together with the orders the stored sequence is
    /// strictly ascending under.  A sequence ascending under neither order
    /// (including any duplicate) is rejected.
    pub fn decode(bytes: &[u8]) -> Result<(Self, OrderFit)> {
        if bytes.len() % ENTRY_LEN != 0 {
            return Err(Error::format(format!(
                "index block of {} bytes is not a whole number of entries",
                bytes.len()
            )));
        }
        let mut cur = Cursor::new(bytes);
        let mut raw = Vec::with_capacity(bytes.len() / ENTRY_LEN);
        for _ in 0..bytes.len() / ENTRY_LEN {
            let id     = cur.read_u32::<LittleEndian>()?;
            let offset = cur.read_u32::<LittleEndian>()?;
            let size   = cur.read_u32::<LittleEndian>()?;
            raw.push(IndexEntry { id, offset, size });
        }

        let fit = OrderFit::of(&raw);
        if !fit.signed && !fit.unsigned {
            return Err(Error::format("index IDs are duplicated or out of order"));
        }

        let entries = raw.into_iter().map(|e| (e.id, e)).collect();
        Ok((Self { entries }, fit))
    }

    /// Every entry must lie inside `[0, body_size)` and no two non-empty
    /// entries may overlap.
    pub fn check_bounds(&self, body_size: u32) -> Result<()> {
        let mut prev_end = 0u64;
        for e in self.by_offset() {
            if e.end() > body_size as u64 {
                return Err(Error::format(format!(
                    "entry {:#010x} ends at {} past body size {}",
                    e.id,
                    e.end(),
                    body_size
                )));
            }
            if e.size == 0 {
                continue;
            }
            if (e.offset as u64) < prev_end {
                return Err(Error::format(format!("entry {:#010x} overlaps another entry", e.id)));
            }
            prev_end = e.end();
        }
        Ok(())
    }
}

/// Which ID orders a decoded index sequence satisfies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderFit {
    pub signed:   bool,
    pub unsigned: bool,
}

impl OrderFit {
    fn of(entries: &[IndexEntry]) -> Self {
        let ascending = |order: IdOrder| {
            entries
                .windows(2)
                .all(|w| order.key(w[0].id) < order.key(w[1].id))
        };
        Self {
            signed:   ascending(IdOrder::Signed),
            unsigned: ascending(IdOrder::Unsigned),
        }
    }

    pub fn accepts(&self, order: IdOrder) -> bool {
        match order {
            IdOrder::Signed   => self.signed,
            IdOrder::Unsigned => self.unsigned,
        }
    }
}
