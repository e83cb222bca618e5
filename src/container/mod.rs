//! The container engine: an open MIX file with in-place editing.
//!
//! A [`Container`] owns its backing stream for the whole session.  Reads
//! go straight to the stream; mutations update the in-memory index and
//! extent allocator and write entry bytes only into space the last flushed
//! state does not depend on.  [`Container::flush`] rewrites the preamble,
//! key source, index and digest under a rollback journal, so an
//! interrupted flush or an abandoned session never damages the committed
//! state.
//!
//! Dropping a container with unflushed changes does not write anything.
//! Call [`Container::close`] to flush and release the stream, or
//! [`Container::discard`] to release it unchanged.

mod convert;
mod decode;
mod flush;
mod mutate;

pub use convert::ConversionWarning;

use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use tracing::warn;

use crate::backing::Backing;
use crate::checksum::{self, Integrity, DIGEST_LEN};
use crate::crypto::{self, IndexKey, KEY_SOURCE_LEN};
use crate::error::{Error, Result};
use crate::extent::ExtentAllocator;
use crate::header::{Generation, Layout, Protection, COUNTS_LEN, FLAGS_LEN};
use crate::id;
use crate::index::{Index, IndexEntry, ENTRY_LEN};
use crate::names::NameTable;
use crate::recovery::Journal;

/// Room for this many new index entries is kept free at the body start
/// when choosing where to put data.
const INDEX_HEADROOM: u64 = 32;

const COPY_CHUNK: usize = 2 << 20;

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub mode:               Mode,
    /// Preferred generation when the bytes alone are ambiguous.
    pub generation:         Option<Generation>,
    /// Allow mutations even if the stored digest does not match.
    pub acknowledge_damage: bool,
    /// Deepest nesting level [`Container::open_nested`] will descend to.
    pub max_depth:          usize,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            mode:               Mode::ReadOnly,
            generation:         None,
            acknowledge_damage: false,
            max_depth:          8,
        }
    }
}

impl OpenOptions {
    pub fn read_only() -> Self {
        Self::default()
    }

    pub fn read_write() -> Self {
        Self { mode: Mode::ReadWrite, ..Self::default() }
    }

    pub fn generation(mut self, generation: Generation) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn acknowledge_damage(mut self, yes: bool) -> Self {
        self.acknowledge_damage = yes;
        self
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }
}

// ── EntryInfo ────────────────────────────────────────────────────────────────

/// One row of [`Container::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    pub id:     u32,
    pub name:   Option<String>,
    pub offset: u32,
    pub length: u32,
}

// ── Internal state ───────────────────────────────────────────────────────────

/// What the stream holds as of the last successful flush (or open).
#[derive(Debug, Clone, Default)]
struct Committed {
    body_start:    u64,
    body_size:     u64,
    digest_pos:    Option<u64>,
    stored_digest: Option<[u8; DIGEST_LEN]>,
    logical_len:   u64,
    identity:      [u8; 32],
}

/// Where this container sits in a chain of nested containers.
#[derive(Debug, Clone)]
struct Nesting {
    depth:     usize,
    max_depth: usize,
    /// Identities of every enclosing container.
    lineage:   Vec<[u8; 32]>,
    /// Nested containers neither journal nor tolerate trailing bytes.
    nested:    bool,
}

impl Nesting {
    fn top(max_depth: usize) -> Self {
        Self { depth: 0, max_depth, lineage: Vec::new(), nested: false }
    }
}

/// Unflushed-changes marker that complains when dropped while set.
#[derive(Debug, Default)]
struct DirtyFlag(bool);

impl DirtyFlag {
    fn set(&mut self) {
        self.0 = true;
    }

    fn clear(&mut self) {
        self.0 = false;
    }

    fn get(&self) -> bool {
        self.0
    }
}

impl Drop for DirtyFlag {
    fn drop(&mut self) {
        if self.0 {
            warn!("container dropped with unflushed changes; the stream keeps its last flushed state");
        }
    }
}

// ── Container ────────────────────────────────────────────────────────────────

pub struct Container<S: Backing> {
    stream:     S,
    mode:       Mode,
    generation: Generation,
    protection: Protection,
    index:      Index,
    alloc:      ExtentAllocator,
    /// Absolute offset of body byte 0 for this session.
    body_start: u64,
    key:        Option<IndexKey>,
    names:      HashMap<u32, String>,
    integrity:  Integrity,
    computed_digest:     Option<[u8; DIGEST_LEN]>,
    damage_acknowledged: bool,
    committed:  Committed,
    overlay:    Option<Journal>,
    nesting:    Nesting,
    dirty:      DirtyFlag,
}

impl<S: Backing> Container<S> {
    // ── Constructors ─────────────────────────────────────────────────────────

    /// Parse an existing container.
    pub fn open(stream: S, options: OpenOptions) -> Result<Self> {
        let nesting = Nesting::top(options.max_depth);
        Self::open_inner(stream, &options, nesting)
    }

    /// Truncate `stream` and commit an empty container to it.
    pub fn create(mut stream: S, generation: Generation, protection: Protection) -> Result<Self> {
        if !generation.supports(protection) {
            return Err(Error::UnsupportedConversion(format!(
                "{generation} cannot store {protection:?} containers"
            )));
        }
        stream.set_len(0)?;

        let body_start = prefix_len(generation.layout(), protection, 0);
        let mut container = Self {
            stream,
            mode: Mode::ReadWrite,
            generation,
            protection,
            index: Index::new(),
            alloc: ExtentAllocator::default(),
            body_start,
            key: protection.is_encrypted().then(IndexKey::generate),
            names: HashMap::new(),
            integrity: Integrity::Unchecked,
            computed_digest: None,
            damage_acknowledged: false,
            committed: Committed::default(),
            overlay: None,
            nesting: Nesting::top(OpenOptions::default().max_depth),
            dirty: DirtyFlag::default(),
        };
        container.alloc.set_floor(INDEX_HEADROOM * ENTRY_LEN as u64);
        container.dirty.set();
        container.flush()?;
        Ok(container)
    }

    /// Open a container living inside an entry of another one.
    pub(crate) fn open_child(
        stream: S,
        options: &OpenOptions,
        depth: usize,
        lineage: Vec<[u8; 32]>,
    ) -> Result<Self> {
        let nesting = Nesting { depth, max_depth: options.max_depth, lineage, nested: true };
        Self::open_inner(stream, options, nesting)
    }

    fn open_inner(mut stream: S, options: &OpenOptions, nesting: Nesting) -> Result<Self> {
        let mut len = stream.byte_len()?;
        let mut overlay = None;

        if !nesting.nested {
            if let Some(journal) = Journal::find(&mut stream, len)? {
                match options.mode {
                    Mode::ReadWrite => {
                        warn!(old_len = journal.old_len, "rolling back an interrupted flush");
                        journal.restore(&mut stream)?;
                        stream.set_len(journal.old_len)?;
                        stream.sync()?;
                    }
                    Mode::ReadOnly => {
                        warn!(old_len = journal.old_len, "interrupted flush found; reading the previous state");
                        overlay = Some(journal.clone());
                    }
                }
                len = journal.old_len;
            }
        }

        let d = decode::decode(&mut stream, overlay.as_ref(), len, options.generation, nesting.nested)?;

        let mut alloc = ExtentAllocator::from_entries(
            d.header.body_size as u64,
            d.index.iter().map(|e| (e.offset as u64, e.size as u64)),
        );
        alloc.set_floor(INDEX_HEADROOM * ENTRY_LEN as u64);
        if d.header.protection.has_checksum() {
            alloc.set_guard(DIGEST_LEN as u64);
            alloc.seal();
        }

        let body_start = d.prefix_len;
        let digest_pos = d
            .header
            .protection
            .has_checksum()
            .then(|| body_start + d.header.body_size as u64);

        let mut container = Self {
            stream,
            mode: options.mode,
            generation: d.generation,
            protection: d.header.protection,
            index: d.index,
            alloc,
            body_start,
            key: d.key,
            names: HashMap::new(),
            integrity: Integrity::Unchecked,
            computed_digest: None,
            damage_acknowledged: options.acknowledge_damage,
            committed: Committed {
                body_start,
                body_size: d.header.body_size as u64,
                digest_pos,
                stored_digest: d.stored_digest,
                logical_len: d.logical_len,
                identity: [0; 32],
            },
            overlay,
            nesting,
            dirty: DirtyFlag::default(),
        };
        container.committed.identity = container.identity();
        container.load_names();
        if container.protection.has_checksum() {
            container.verify()?;
        }
        Ok(container)
    }

    // ── Metadata ─────────────────────────────────────────────────────────────

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn protection(&self) -> Protection {
        self.protection
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn integrity(&self) -> Integrity {
        self.integrity
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn body_size(&self) -> u64 {
        self.alloc.body_size()
    }

    /// Free and not-yet-reclaimable bytes inside the body.
    pub fn free_space(&self) -> u64 {
        self.alloc.free_bytes() + self.alloc.pending_bytes()
    }

    /// Bytes a flush would spend on preamble, key source, index and digest.
    pub fn overhead(&self) -> u64 {
        let digest = if self.protection.has_checksum() { DIGEST_LEN as u64 } else { 0 };
        prefix_len(self.generation.layout(), self.protection, self.index.len()) + digest
    }

    /// Nesting depth; 0 for a top-level container.
    pub fn depth(&self) -> usize {
        self.nesting.depth
    }

    pub fn max_depth(&self) -> usize {
        self.nesting.max_depth
    }

    /// Check the allocator's tiling invariant against the current index.
    pub fn check_layout(&self) -> std::result::Result<(), String> {
        self.alloc
            .check_tiling(self.index.iter().map(|e| (e.offset as u64, e.size as u64)))
    }

    // ── Names ────────────────────────────────────────────────────────────────

    /// Map a name to the ID this container's generation would store it
    /// under.  `0x…` names are taken as literal hexadecimal IDs.
    pub fn resolve(&self, name: &str) -> Result<u32> {
        resolve_name(name, self.generation)
    }

    pub fn name_of(&self, id: u32) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }

    /// Remember `name` as the display name of its ID.
    pub fn learn_name(&mut self, name: &str) -> Result<u32> {
        let id = self.resolve(name)?;
        if !is_hex_name(name) {
            self.names.insert(id, name.to_owned());
        }
        Ok(id)
    }

    fn load_names(&mut self) {
        let table_id = self.generation.name_table_id();
        let Some(table) = self.read_name_table(table_id) else {
            return;
        };
        let scheme = self.generation.key_scheme();
        for name in table.names {
            self.names.insert(id::hash(&name, scheme), name);
        }
    }

    fn read_name_table(&mut self, id: u32) -> Option<NameTable> {
        if !self.index.contains(id) {
            return None;
        }
        let bytes = match self.extract(id) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "cannot read the name table");
                return None;
            }
        };
        match NameTable::decode(&bytes) {
            Ok(table) => Some(table),
            Err(reason) => {
                warn!(%reason, "ignoring malformed name table");
                None
            }
        }
    }

    // ── Read ─────────────────────────────────────────────────────────────────

    /// Every entry, ascending by unsigned ID.
    pub fn list(&self) -> Vec<EntryInfo> {
        self.index.iter().map(|e| self.info(e)).collect()
    }

    pub fn stat(&self, id: u32) -> Result<EntryInfo> {
        self.index.get(id).map(|e| self.info(e)).ok_or(Error::NotFound(id))
    }

    pub fn contains(&self, id: u32) -> bool {
        self.index.contains(id)
    }

    pub fn extract(&mut self, id: u32) -> Result<Vec<u8>> {
        let entry = *self.index.get(id).ok_or(Error::NotFound(id))?;
        let mut buf = vec![0u8; entry.size as usize];
        self.read_at(self.body_start + entry.offset as u64, &mut buf)?;
        Ok(buf)
    }

    /// Read part of an entry.  Returns the number of bytes copied, which
    /// is short only at the end of the entry.
    pub fn read_entry(&mut self, id: u32, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let entry = *self.index.get(id).ok_or(Error::NotFound(id))?;
        let size = entry.size as u64;
        if pos >= size {
            return Ok(0);
        }
        let n = (size - pos).min(buf.len() as u64) as usize;
        self.read_at(self.body_start + entry.offset as u64 + pos, &mut buf[..n])?;
        Ok(n)
    }

    /// Recompute the digest of the committed state and compare it with the
    /// stored one.
    pub fn verify(&mut self) -> Result<Integrity> {
        let (Some(stored), Some(_)) = (self.committed.stored_digest, self.committed.digest_pos) else {
            self.integrity = Integrity::Unchecked;
            return Ok(Integrity::Unchecked);
        };
        let (start, length) = (self.committed.body_start, self.committed.body_size);
        let computed = checksum::compute_with(start, length, |pos, buf| self.read_at(pos, buf))?;

        self.integrity = checksum::compare(&stored, &computed);
        self.computed_digest = Some(computed);
        if self.integrity == Integrity::Mismatch {
            warn!(
                stored = %hex::encode(stored),
                computed = %hex::encode(computed),
                "stored digest does not match container contents"
            );
        }
        Ok(self.integrity)
    }

    // ── Session end ──────────────────────────────────────────────────────────

    /// Flush pending changes and hand the stream back.
    pub fn close(mut self) -> Result<S> {
        if self.mode == Mode::ReadWrite {
            self.flush()?;
        }
        Ok(self.into_stream())
    }

    /// Hand the stream back without writing pending changes.
    pub fn discard(self) -> S {
        self.into_stream()
    }

    fn into_stream(self) -> S {
        let Container { stream, mut dirty, .. } = self;
        dirty.clear();
        stream
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn info(&self, e: &IndexEntry) -> EntryInfo {
        EntryInfo {
            id:     e.id,
            name:   self.names.get(&e.id).cloned(),
            offset: e.offset,
            length: e.size,
        }
    }

    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        read_stream_at(&mut self.stream, self.overlay.as_ref(), pos, buf)
    }

    fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        self.stream.seek(SeekFrom::Start(pos))?;
        self.stream.write_all(buf)?;
        Ok(())
    }

    fn zero_fill(&mut self, pos: u64, len: u64) -> Result<()> {
        let zeros = vec![0u8; (len as usize).min(COPY_CHUNK)];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(zeros.len() as u64) as usize;
            self.write_at(pos + done, &zeros[..n])?;
            done += n as u64;
        }
        Ok(())
    }

    /// Copy `len` bytes from `from` to `to` in chunks.  Safe for disjoint
    /// ranges and for overlapping ones with `to < from`.
    fn copy_bytes(&mut self, from: u64, to: u64, len: u64) -> Result<()> {
        let mut buf = vec![0u8; (len as usize).min(COPY_CHUNK)];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(buf.len() as u64) as usize;
            self.read_at(from + done, &mut buf[..n])?;
            self.write_at(to + done, &buf[..n])?;
            done += n as u64;
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.mode == Mode::ReadOnly {
            return Err(Error::ReadOnly);
        }
        if self.integrity == Integrity::Mismatch && !self.damage_acknowledged {
            return Err(Error::ChecksumMismatch {
                stored:   self.committed.stored_digest.map(hex::encode).unwrap_or_default(),
                computed: self.computed_digest.map(hex::encode).unwrap_or_default(),
            });
        }
        Ok(())
    }

    pub(crate) fn lineage(&self) -> &[[u8; 32]] {
        &self.nesting.lineage
    }

    pub(crate) fn committed_identity(&self) -> [u8; 32] {
        self.committed.identity
    }

    /// True when an enclosing container has this container's structure.
    pub(crate) fn is_ancestor_of_itself(&self) -> bool {
        self.nesting.lineage.contains(&self.committed.identity)
    }

    /// Fingerprint of the structural state: layout, protection, body size
    /// and every entry.
    pub(crate) fn identity(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[self.generation.layout() as u8]);
        hasher.update(&self.protection.flags().to_le_bytes());
        hasher.update(&self.alloc.body_size().to_le_bytes());
        for e in self.index.iter() {
            hasher.update(&e.id.to_le_bytes());
            hasher.update(&e.offset.to_le_bytes());
            hasher.update(&e.size.to_le_bytes());
        }
        *hasher.finalize().as_bytes()
    }
}

// ── Free helpers ─────────────────────────────────────────────────────────────

/// Bytes in front of the body for a given shape.
pub(crate) fn prefix_len(layout: Layout, protection: Protection, count: usize) -> u64 {
    let index = count * ENTRY_LEN;
    if layout == Layout::Extended && protection.is_encrypted() {
        let sealed = crypto::sealed_len(COUNTS_LEN as usize + index);
        FLAGS_LEN + (KEY_SOURCE_LEN + sealed) as u64
    } else {
        layout.header_len() + index as u64
    }
}

fn read_stream_at<S: Read + Seek>(
    stream: &mut S,
    overlay: Option<&Journal>,
    pos: u64,
    buf: &mut [u8],
) -> Result<()> {
    stream.seek(SeekFrom::Start(pos))?;
    stream.read_exact(buf)?;
    if let Some(journal) = overlay {
        journal.overlay(pos, buf);
    }
    Ok(())
}

fn is_hex_name(name: &str) -> bool {
    name.len() > 2 && (name.starts_with("0x") || name.starts_with("0X"))
}

/// Name → ID for `generation`.  See [`Container::resolve`].
pub fn resolve_name(name: &str, generation: Generation) -> Result<u32> {
    if name.is_empty() {
        return Err(Error::InvalidName { name: String::new(), reason: "name is empty" });
    }
    if is_hex_name(name) {
        return match u32::from_str_radix(&name[2..], 16) {
            Ok(0) => Err(Error::InvalidName { name: name.to_owned(), reason: "ID 0 is not valid" }),
            Ok(id) => Ok(id),
            Err(_) => Err(Error::InvalidName {
                name:   name.to_owned(),
                reason: "not a 32-bit hexadecimal ID",
            }),
        };
    }
    id::try_hash(name, generation.key_scheme()).ok_or_else(|| Error::InvalidName {
        name:   name.to_owned(),
        reason: "not representable in Windows-1252",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_names_resolve_literally() {
        assert_eq!(resolve_name("0x1234", Generation::RedAlert).unwrap(), 0x1234);
        assert_eq!(resolve_name("0XdeadBEEF", Generation::TiberianSun).unwrap(), 0xDEAD_BEEF);
        assert!(matches!(resolve_name("0x0", Generation::RedAlert), Err(Error::InvalidName { .. })));
        assert!(matches!(resolve_name("0x1FFFFFFFF", Generation::RedAlert), Err(Error::InvalidName { .. })));
    }

    #[test]
    fn names_hash_per_generation() {
        assert_eq!(resolve_name("rules.ini", Generation::RedAlert).unwrap(), 0xB1C3_B238);
        assert_eq!(resolve_name("rules.ini", Generation::TiberianSun).unwrap(), 0xF025_A96C);
        assert!(resolve_name("", Generation::RedAlert).is_err());
        assert!(resolve_name("\u{4E2D}.shp", Generation::RedAlert).is_err());
    }

    #[test]
    fn prefix_sizes() {
        assert_eq!(prefix_len(Layout::Legacy, Protection::None, 2), 6 + 24);
        assert_eq!(prefix_len(Layout::Extended, Protection::Checksummed, 1), 10 + 12);
        assert_eq!(prefix_len(Layout::Extended, Protection::Encrypted, 0), 4 + 80 + 8);
        assert_eq!(prefix_len(Layout::Extended, Protection::ChecksummedEncrypted, 1), 4 + 80 + 24);
        assert_eq!(prefix_len(Layout::Extended, Protection::Encrypted, 2), 4 + 80 + 32);
    }
}
