//! Index and body mutations.
//!
//! Bytes referenced by the last flushed index are never overwritten:
//! replacing or resizing such an entry moves it to fresh space first and
//! quarantines the old range until the next flush.

use tracing::debug;

use super::Container;
use crate::backing::Backing;
use crate::crypto::IndexKey;
use crate::error::{Error, Result};
use crate::extent::MAX_BODY;
use crate::header::Protection;
use crate::index::IndexEntry;
use crate::names::NameTable;

impl<S: Backing> Container<S> {
    /// Add `bytes` under the ID `name` resolves to and remember the name.
    pub fn insert(&mut self, name: &str, bytes: &[u8]) -> Result<u32> {
        let id = self.resolve(name)?;
        self.insert_id(id, bytes)?;
        self.learn_name(name)?;
        Ok(id)
    }

    /// Add `bytes` under a raw ID.
    pub fn insert_id(&mut self, id: u32, bytes: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        if id == self.generation.name_table_id() {
            return Err(Error::Reserved(id));
        }
        self.put_new(id, bytes)
    }

    pub fn remove(&mut self, id: u32) -> Result<()> {
        self.ensure_writable()?;
        let entry = self.index.remove(id).ok_or(Error::NotFound(id))?;
        self.alloc.release(entry.offset as u64, entry.size as u64);
        self.dirty.set();
        debug!(id = format_args!("{id:#010x}"), size = entry.size, "removed entry");
        Ok(())
    }

    /// Swap an entry's content for `bytes`.
    pub fn replace(&mut self, id: u32, bytes: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        self.store(id, bytes)
    }

    /// Give an entry the ID of `new_name`.  Its bytes stay where they are.
    pub fn rename(&mut self, id: u32, new_name: &str) -> Result<u32> {
        self.ensure_writable()?;
        let new_id = self.resolve(new_name)?;
        if !self.index.contains(id) {
            return Err(Error::NotFound(id));
        }
        if new_id != id {
            if new_id == self.generation.name_table_id() {
                return Err(Error::Reserved(new_id));
            }
            if self.index.contains(new_id) {
                return Err(Error::DuplicateId(new_id));
            }
            if let Some(mut entry) = self.index.remove(id) {
                entry.id = new_id;
                self.index.insert(entry)?;
            }
            self.dirty.set();
        }
        self.learn_name(new_name)?;
        Ok(new_id)
    }

    /// Change protection.  Legacy containers only accept `None`.
    pub fn set_protection(&mut self, protection: Protection) -> Result<()> {
        self.ensure_writable()?;
        if !self.generation.supports(protection) {
            return Err(Error::UnsupportedConversion(format!(
                "{} cannot store {protection:?} containers",
                self.generation
            )));
        }
        if protection == self.protection {
            return Ok(());
        }
        if protection.is_encrypted() && self.key.is_none() {
            self.key = Some(IndexKey::generate());
        }
        self.protection = protection;
        self.dirty.set();
        Ok(())
    }

    /// Allow mutations on a container whose digest did not match.
    pub fn acknowledge_damage(&mut self) {
        self.damage_acknowledged = true;
    }

    /// Rebuild the embedded name table from every known entry name.
    pub fn write_name_table(&mut self) -> Result<()> {
        self.ensure_writable()?;
        let table_id = self.generation.name_table_id();
        let mut names: Vec<&str> = self
            .index
            .iter()
            .filter(|e| e.id != table_id)
            .filter_map(|e| self.names.get(&e.id).map(String::as_str))
            .collect();
        names.sort_unstable();
        let bytes = NameTable::encode(names, self.generation);

        if self.index.contains(table_id) {
            self.store(table_id, &bytes)?;
        } else {
            self.put_new(table_id, &bytes)?;
        }
        self.names.insert(table_id, crate::header::NAME_TABLE_NAME.to_owned());
        Ok(())
    }

    // ── Entry streams ────────────────────────────────────────────────────────

    /// Write into an entry at `pos`, growing it when the write ends past
    /// its current length.
    pub(crate) fn write_entry(&mut self, id: u32, pos: u64, buf: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        let current = self.index.get(id).ok_or(Error::NotFound(id))?.size as u64;
        let end = pos + buf.len() as u64;
        let entry = self.reshape(id, end.max(current), true)?;
        if !buf.is_empty() {
            self.write_at(self.body_start + entry.offset as u64 + pos, buf)?;
        }
        Ok(())
    }

    pub(crate) fn resize_entry_to(&mut self, id: u32, len: u64) -> Result<()> {
        self.ensure_writable()?;
        self.reshape(id, len, false)?;
        Ok(())
    }

    // ── Internals ────────────────────────────────────────────────────────────

    pub(super) fn put_new(&mut self, id: u32, bytes: &[u8]) -> Result<()> {
        if self.index.contains(id) {
            return Err(Error::DuplicateId(id));
        }
        if self.index.len() >= self.generation.max_entries() {
            return Err(Error::OutOfBounds(format!(
                "index already holds {} entries",
                self.index.len()
            )));
        }
        let size = entry_size(bytes.len() as u64)?;
        let offset = self.alloc.allocate(size as u64)?;
        if let Err(e) = self.write_at(self.body_start + offset, bytes) {
            self.alloc.release(offset, size as u64);
            return Err(e);
        }
        self.index.insert(IndexEntry { id, offset: offset as u32, size })?;
        self.dirty.set();
        debug!(id = format_args!("{id:#010x}"), offset, size, "inserted entry");
        Ok(())
    }

    /// Write `bytes` as the new content of an existing entry.
    pub(super) fn store(&mut self, id: u32, bytes: &[u8]) -> Result<()> {
        let entry = *self.index.get(id).ok_or(Error::NotFound(id))?;
        let new_len = entry_size(bytes.len() as u64)? as u64;
        let old_len = entry.size as u64;
        let off = entry.offset as u64;

        if new_len == 0 {
            self.alloc.release(off, old_len);
            self.set_entry(id, 0, 0);
            return Ok(());
        }

        let in_place = old_len > 0
            && !self.alloc.is_committed(off, old_len)
            && (new_len <= old_len || self.alloc.grow_in_place(off, old_len, new_len)?);
        if in_place {
            self.write_at(self.body_start + off, bytes)?;
            self.alloc.shrink_in_place(off, old_len, new_len);
            self.set_entry(id, off, new_len);
            return Ok(());
        }

        let to = self.alloc.allocate(new_len)?;
        if let Err(e) = self.write_at(self.body_start + to, bytes) {
            self.alloc.release(to, new_len);
            return Err(e);
        }
        self.alloc.release(off, old_len);
        self.set_entry(id, to, new_len);
        Ok(())
    }

    /// Resize an entry, keeping its leading bytes and zero-filling growth.
    /// Committed entries, or `force_move`, always move to fresh space.
    pub(super) fn reshape(&mut self, id: u32, new_len: u64, force_move: bool) -> Result<IndexEntry> {
        let entry = *self.index.get(id).ok_or(Error::NotFound(id))?;
        let new_len = entry_size(new_len)? as u64;
        let old_len = entry.size as u64;
        let off = entry.offset as u64;
        let committed = self.alloc.is_committed(off, old_len);

        if new_len == old_len && !(force_move && committed) {
            return Ok(entry);
        }
        if new_len == 0 {
            self.alloc.release(off, old_len);
            return Ok(self.set_entry(id, 0, 0));
        }

        if old_len > 0 && !committed {
            if new_len < old_len {
                self.alloc.shrink_in_place(off, old_len, new_len);
                return Ok(self.set_entry(id, off, new_len));
            }
            if self.alloc.grow_in_place(off, old_len, new_len)? {
                self.zero_fill(self.body_start + off + old_len, new_len - old_len)?;
                return Ok(self.set_entry(id, off, new_len));
            }
        }

        let to = self.alloc.allocate(new_len)?;
        let keep = old_len.min(new_len);
        let moved = self
            .copy_bytes(self.body_start + off, self.body_start + to, keep)
            .and_then(|_| self.zero_fill(self.body_start + to + keep, new_len - keep));
        if let Err(e) = moved {
            self.alloc.release(to, new_len);
            return Err(e);
        }
        self.alloc.release(off, old_len);
        debug!(id = format_args!("{id:#010x}"), from = off, to, new_len, "moved entry");
        Ok(self.set_entry(id, to, new_len))
    }

    fn set_entry(&mut self, id: u32, offset: u64, size: u64) -> IndexEntry {
        let offset = if size == 0 { 0 } else { offset };
        let mut out = IndexEntry { id, offset: offset as u32, size: size as u32 };
        if let Some(entry) = self.index.get_mut(id) {
            entry.offset = out.offset;
            entry.size = out.size;
            out = *entry;
        }
        self.dirty.set();
        out
    }
}

fn entry_size(len: u64) -> Result<u32> {
    if len > MAX_BODY {
        return Err(Error::OutOfBounds(format!("entry of {len} bytes")));
    }
    Ok(len as u32)
}
