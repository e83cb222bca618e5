//! Containers stored as entries of other containers.
//!
//! [`Container::open_nested`] opens an entry in place: the child reads and
//! writes through an [`EntryStream`] that borrows the parent, so no bytes
//! are copied out.  Growing or shrinking the child resizes the parent's
//! entry through the parent's allocator, and the parent treats every write
//! as copy-on-write against its own committed state.  A child flush leaves
//! the parent dirty; flush outward to persist.
//!
//! Depth is bounded by [`OpenOptions::max_depth`](crate::OpenOptions).  A
//! child whose structure is identical to an enclosing container's current
//! or last-flushed structure is refused as a cycle.

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::backing::Backing;
use crate::container::{Container, OpenOptions};
use crate::error::{into_io, Error, Result};

/// Byte-level access to entries, as needed by an [`EntryStream`].
pub trait EntryHost {
    fn entry_len(&self, id: u32) -> Result<u64>;

    /// Copy up to `buf.len()` bytes from `pos` within the entry.
    fn read_entry_at(&mut self, id: u32, pos: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write at `pos`, growing the entry if the write ends past it.
    fn write_entry_at(&mut self, id: u32, pos: u64, buf: &[u8]) -> Result<()>;

    /// Truncate or zero-extend the entry.
    fn resize_entry(&mut self, id: u32, len: u64) -> Result<()>;
}

impl<S: Backing> EntryHost for Container<S> {
    fn entry_len(&self, id: u32) -> Result<u64> {
        Ok(self.stat(id)?.length as u64)
    }

    fn read_entry_at(&mut self, id: u32, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.read_entry(id, pos, buf)
    }

    fn write_entry_at(&mut self, id: u32, pos: u64, buf: &[u8]) -> Result<()> {
        self.write_entry(id, pos, buf)
    }

    fn resize_entry(&mut self, id: u32, len: u64) -> Result<()> {
        self.resize_entry_to(id, len)
    }
}

/// One entry of a parent container viewed as a seekable stream.
pub struct EntryStream<'p> {
    host: &'p mut dyn EntryHost,
    id:   u32,
    pos:  u64,
}

impl<'p> EntryStream<'p> {
    pub fn new(host: &'p mut dyn EntryHost, id: u32) -> Self {
        Self { host, id, pos: 0 }
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Read for EntryStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.host.read_entry_at(self.id, self.pos, buf).map_err(into_io)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for EntryStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.host.write_entry_at(self.id, self.pos, buf).map_err(into_io)?;
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for EntryStream<'_> {
    fn seek(&mut self, to: SeekFrom) -> io::Result<u64> {
        let len = self.host.entry_len(self.id).map_err(into_io)?;
        let target = match to {
            SeekFrom::Start(p)   => Some(p),
            SeekFrom::End(d)     => len.checked_add_signed(d),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
        };
        match target {
            Some(p) => {
                self.pos = p;
                Ok(p)
            }
            None => Err(io::Error::new(io::ErrorKind::InvalidInput, "seek before start of entry")),
        }
    }
}

impl Backing for EntryStream<'_> {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.host.resize_entry(self.id, len).map_err(into_io)
    }
}

impl<S: Backing> Container<S> {
    /// Open entry `id` as a container, sharing this container's mode.
    pub fn open_nested(&mut self, id: u32) -> Result<Container<EntryStream<'_>>> {
        if !self.contains(id) {
            return Err(Error::NotFound(id));
        }
        let (depth, max_depth) = (self.depth() + 1, self.max_depth());
        if depth > max_depth {
            return Err(Error::Recursion(format!(
                "entry {id:#010x} would nest {depth} levels deep (limit {max_depth})"
            )));
        }

        let mut lineage = self.lineage().to_vec();
        lineage.push(self.identity());
        lineage.push(self.committed_identity());

        let options = OpenOptions {
            mode: self.mode(),
            max_depth,
            ..OpenOptions::default()
        };
        let stream = EntryStream::new(self, id);
        let child = Container::open_child(stream, &options, depth, lineage).map_err(|e| {
            if e.is_structural() {
                Error::NotAContainer(id)
            } else {
                e
            }
        })?;

        if child.is_ancestor_of_itself() {
            return Err(Error::Recursion(format!(
                "entry {id:#010x} holds a copy of an enclosing container"
            )));
        }
        Ok(child)
    }

}
