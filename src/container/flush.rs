//! Committing a session to the stream.
//!
//! A flush works in four steps:
//!
//! 1. If the new prefix (preamble, key source, index) is larger than the one
//!    on disk, entries in the way move to free space and every offset is
//!    rebased; if it is smaller, the reclaimed bytes become free body space.
//! 2. The bytes of every region about to be overwritten are saved in a
//!    journal appended past the physical end of the stream.
//! 3. Prefix and digest are written.
//! 4. The stream is truncated to its new logical length, which drops the
//!    journal and commits.
//!
//! A failure before the commit point restores the saved regions and cuts
//! the stream back to where the journal began.  Body bytes the session
//! appended stay in place so the in-memory index keeps pointing at them.
//!
//! Nested containers skip the journal: their writes are copy-on-write
//! inside the parent, which commits them with its own flush.

use tracing::{debug, warn};

use super::{prefix_len, Committed, Container, INDEX_HEADROOM};
use crate::backing::Backing;
use crate::checksum::{self, Integrity, DIGEST_LEN};
use crate::crypto::IndexKey;
use crate::error::{Error, Result};
use crate::extent::{ExtentAllocator, MAX_BODY};
use crate::header::Header;
use crate::index::{IndexEntry, ENTRY_LEN};
use crate::recovery::Journal;

impl<S: Backing> Container<S> {
    /// Write all pending changes.  A no-op when nothing changed.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_writable()?;
        if !self.dirty.get() {
            return Ok(());
        }

        let saved = (self.index.clone(), self.alloc.clone(), self.body_start);
        if let Err(e) = self.commit() {
            (self.index, self.alloc, self.body_start) = saved;
            return Err(e);
        }
        Ok(())
    }

    /// Pack every entry toward the body start in offset order, drop free
    /// space and flush.
    ///
    /// Moves committed bytes in place, so unlike [`Container::flush`] an
    /// interruption can leave the stream damaged.
    pub fn compact(&mut self) -> Result<()> {
        self.ensure_writable()?;

        let mut cursor = 0u64;
        for e in self.index.by_offset() {
            if e.size == 0 {
                continue;
            }
            if e.offset as u64 != cursor {
                self.copy_bytes(
                    self.body_start + e.offset as u64,
                    self.body_start + cursor,
                    e.size as u64,
                )?;
                if let Some(entry) = self.index.get_mut(e.id) {
                    entry.offset = cursor as u32;
                }
            }
            cursor += e.size as u64;
        }

        let before = self.alloc.body_size();
        let mut alloc = ExtentAllocator::from_entries(
            cursor,
            self.index.iter().map(|e| (e.offset as u64, e.size as u64)),
        );
        alloc.promote_pending(std::iter::empty(), 0, false);
        alloc.set_floor(INDEX_HEADROOM * ENTRY_LEN as u64);
        self.alloc = alloc;
        debug!(before, after = cursor, "compacted body");

        self.dirty.set();
        self.flush()
    }

    fn commit(&mut self) -> Result<()> {
        let layout     = self.generation.layout();
        let protection = self.protection;
        let count      = self.index.len();
        if count > self.generation.max_entries() {
            return Err(Error::OutOfBounds(format!(
                "{count} entries exceed the index limit of {}",
                self.generation.max_entries()
            )));
        }

        let new_prefix = prefix_len(layout, protection, count);
        let old_prefix = self.body_start;
        if new_prefix > old_prefix {
            self.make_room(new_prefix - old_prefix)?;
        } else if new_prefix < old_prefix {
            self.give_back(old_prefix - new_prefix)?;
        }

        let body_size = self.alloc.body_size();
        if body_size > MAX_BODY {
            return Err(Error::OutOfBounds(format!("body of {body_size} bytes")));
        }

        let header = Header { layout, protection, count: count as u16, body_size: body_size as u32 };
        let index = self.index.encode(self.generation.id_order());
        let mut prefix = if protection.is_encrypted() {
            let key = self.key.get_or_insert_with(IndexKey::generate);
            let mut plain = header.counts_bytes().to_vec();
            plain.extend_from_slice(&index);
            let mut prefix = header.flags_bytes().to_vec();
            prefix.extend_from_slice(key.key_source());
            prefix.extend_from_slice(&key.encrypt(&plain)?);
            prefix
        } else {
            self.key = None;
            let mut prefix = header.to_bytes();
            prefix.extend_from_slice(&index);
            prefix
        };
        // Space the body took over from a larger old prefix is zeroed.
        prefix.resize(new_prefix.max(old_prefix) as usize, 0);

        let has_digest = protection.has_checksum();
        let digest_pos = new_prefix + body_size;
        let new_len = digest_pos + if has_digest { DIGEST_LEN as u64 } else { 0 };
        let digest_pos = has_digest.then_some(digest_pos);

        let digest = if self.nesting.nested {
            self.write_commit(&prefix, digest_pos, body_size, new_len)?
        } else {
            let mut regions = vec![(0, prefix.len() as u64)];
            if let Some(pos) = digest_pos {
                regions.push((pos, DIGEST_LEN as u64));
            }
            let old_len = self.committed.logical_len;
            let physical = self.stream.byte_len()?;
            let journal = Journal::capture(&mut self.stream, old_len, physical, &regions)?;
            if let Err(e) = journal
                .write_at(&mut self.stream, physical.max(new_len))
                .and_then(|_| Ok(self.stream.sync()?))
            {
                if let Err(cut) = self.stream.set_len(physical) {
                    warn!(error = %cut, "could not drop a partly written journal");
                }
                return Err(e);
            }

            match self.write_commit(&prefix, digest_pos, body_size, new_len) {
                Ok(digest) => digest,
                Err(e) => {
                    self.roll_back(&journal, physical);
                    return Err(e);
                }
            }
        };

        self.committed = Committed {
            body_start: self.body_start,
            body_size,
            digest_pos,
            stored_digest: digest,
            logical_len: new_len,
            identity: [0; 32],
        };
        self.alloc.promote_pending(
            self.index.iter().map(|e| (e.offset as u64, e.size as u64)),
            if has_digest { DIGEST_LEN as u64 } else { 0 },
            has_digest,
        );
        self.committed.identity = self.identity();
        self.integrity = if has_digest { Integrity::Verified } else { Integrity::Unchecked };
        self.computed_digest = digest;
        self.overlay = None;
        self.dirty.clear();

        debug!(
            generation = %self.generation,
            entries = count,
            body_size,
            logical_len = new_len,
            "flushed container"
        );
        Ok(())
    }

    fn write_commit(
        &mut self,
        prefix: &[u8],
        digest_pos: Option<u64>,
        body_size: u64,
        new_len: u64,
    ) -> Result<Option<[u8; DIGEST_LEN]>> {
        self.write_at(0, prefix)?;
        let digest = match digest_pos {
            Some(pos) => {
                let start = self.body_start;
                let digest = checksum::compute_with(start, body_size, |p, buf| self.read_at(p, buf))?;
                self.write_at(pos, &digest)?;
                Some(digest)
            }
            None => None,
        };
        self.stream.sync()?;
        self.stream.set_len(new_len)?;
        self.stream.sync()?;
        Ok(digest)
    }

    /// Undo a failed commit.  `physical` is the stream length before the
    /// journal was appended.
    fn roll_back(&mut self, journal: &Journal, physical: u64) {
        let result = journal.restore(&mut self.stream).and_then(|_| {
            self.stream.set_len(physical)?;
            self.stream.sync()?;
            Ok(())
        });
        if let Err(e) = result {
            warn!(error = %e, "flush failed and rollback failed; the journal will be replayed on next open");
        }
    }

    /// Free the first `d` body bytes so the prefix can grow into them.
    fn make_room(&mut self, d: u64) -> Result<()> {
        self.alloc.carve_front(d);

        let movers: Vec<IndexEntry> = self
            .index
            .by_offset()
            .into_iter()
            .filter(|e| e.size > 0 && (e.offset as u64) < d)
            .collect();
        for e in movers {
            let to = self.alloc.allocate(e.size as u64)?;
            self.copy_bytes(
                self.body_start + e.offset as u64,
                self.body_start + to,
                e.size as u64,
            )?;
            let tail = d.max(e.offset as u64);
            if e.end() > tail {
                self.alloc.release(tail, e.end() - tail);
            }
            if let Some(entry) = self.index.get_mut(e.id) {
                entry.offset = to as u32;
            }
            debug!(id = format_args!("{:#010x}", e.id), from = e.offset, to, "relocated entry for index growth");
        }

        self.alloc.shift(-(d as i64));
        for e in self.index.iter_mut() {
            e.offset = if e.size == 0 { 0 } else { e.offset - d as u32 };
        }
        self.body_start += d;
        Ok(())
    }

    /// Hand `g` bytes of a shrinking prefix to the body as free space.
    fn give_back(&mut self, g: u64) -> Result<()> {
        if self.alloc.body_size() + g > MAX_BODY {
            return Err(Error::OutOfBounds(format!(
                "body of {} bytes after the index shrinks",
                self.alloc.body_size() + g
            )));
        }
        self.alloc.shift(g as i64);
        self.alloc.free_front(g);
        for e in self.index.iter_mut() {
            if e.size > 0 {
                e.offset += g as u32;
            }
        }
        self.body_start -= g;
        Ok(())
    }
}
