//! High-level [`Archive`] API over MIX files on disk.
//!
//! ```no_run
//! use mixlib::archive::{Archive, PackOptions};
//! use mixlib::Generation;
//!
//! // Write
//! let mut ar = Archive::create("out.mix", PackOptions::new(Generation::RedAlert))?;
//! ar.add_file("readme.txt", b"Hello, world!")?;
//! ar.finalize()?;
//!
//! // Read
//! let mut ar = Archive::open("out.mix")?;
//! let data = ar.read_file("readme.txt")?;
//! assert_eq!(data, b"Hello, world!");
//! # Ok::<(), mixlib::Error>(())
//! ```

use std::fs::{self, File, OpenOptions as FsOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::container::{Container, EntryInfo, OpenOptions};
use crate::error::{Error, Result};
use crate::header::{Generation, Protection};

// ── PackOptions ───────────────────────────────────────────────────────────────

/// Configuration for [`Archive::create`].
#[derive(Debug, Clone, Copy)]
pub struct PackOptions {
    pub generation: Generation,
    pub protection: Protection,
    /// Embed a name table on finalize so names survive a reopen.
    pub name_table: bool,
}

impl PackOptions {
    pub fn new(generation: Generation) -> Self {
        Self { generation, protection: Protection::None, name_table: true }
    }

    pub fn protection(mut self, protection: Protection) -> Self {
        self.protection = protection;
        self
    }
}

impl Default for PackOptions {
    fn default() -> Self {
        Self::new(Generation::RedAlert)
    }
}

// ── Archive ───────────────────────────────────────────────────────────────────

pub struct Archive {
    path:       PathBuf,
    container:  Container<File>,
    name_table: bool,
}

impl Archive {
    // ── Constructors ─────────────────────────────────────────────────────────

    /// Open read-only.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, OpenOptions::read_only())
    }

    pub fn open_with<P: AsRef<Path>>(path: P, options: OpenOptions) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let writable = options.mode == crate::container::Mode::ReadWrite;
        let file = FsOptions::new().read(true).write(writable).open(&path)?;
        let container = Container::open(file, options)?;
        Ok(Self { path, container, name_table: false })
    }

    pub fn create<P: AsRef<Path>>(path: P, opts: PackOptions) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let file = FsOptions::new().read(true).write(true).create(true).truncate(true).open(&path)?;
        let container = Container::create(file, opts.generation, opts.protection)?;
        Ok(Self { path, container, name_table: opts.name_table })
    }

    // ── Write ─────────────────────────────────────────────────────────────────

    pub fn add_file(&mut self, name: &str, data: &[u8]) -> Result<u32> {
        self.container.insert(name, data)
    }

    /// Add a file from disk under its own file name.
    pub fn add_path<P: AsRef<Path>>(&mut self, source: P) -> Result<u32> {
        let source = source.as_ref();
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidName {
                name:   source.display().to_string(),
                reason: "path has no usable file name",
            })?;
        let data = fs::read(source)?;
        self.add_file(name, &data)
    }

    pub fn remove_file(&mut self, name: &str) -> Result<()> {
        let id = self.container.resolve(name)?;
        self.container.remove(id)
    }

    /// Write the name table if requested, flush and close the file.
    pub fn finalize(mut self) -> Result<()> {
        if self.name_table {
            self.container.write_name_table()?;
        }
        let file = self.container.close()?;
        debug!(path = %self.path.display(), "archive finalized");
        drop(file);
        Ok(())
    }

    // ── Read ──────────────────────────────────────────────────────────────────

    pub fn list(&self) -> Vec<EntryInfo> {
        self.container.list()
    }

    pub fn stat(&self, name: &str) -> Option<EntryInfo> {
        let id = self.container.resolve(name).ok()?;
        self.container.stat(id).ok()
    }

    pub fn read_file(&mut self, name: &str) -> Result<Vec<u8>> {
        let id = self.container.resolve(name)?;
        self.container.extract(id)
    }

    /// Extract every entry into `dest`, creating it if necessary.  Entries
    /// without a known name are written as `0xXXXXXXXX`.
    pub fn extract_all<P: AsRef<Path>>(&mut self, dest: P) -> Result<usize> {
        let dest = dest.as_ref();
        fs::create_dir_all(dest)?;
        let entries = self.container.list();
        for info in &entries {
            let data = self.container.extract(info.id)?;
            fs::write(dest.join(output_name(info)), data)?;
        }
        Ok(entries.len())
    }

    // ── Metadata ─────────────────────────────────────────────────────────────

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn container(&mut self) -> &mut Container<File> {
        &mut self.container
    }
}

/// File name to extract an entry to.  Names that could escape the
/// destination directory fall back to the hex ID.
pub fn output_name(info: &EntryInfo) -> String {
    match info.name.as_deref() {
        Some(name) if is_plain_file_name(name) => name.to_owned(),
        _ => format!("{:#010x}", info.id),
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', ':', '\0'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn pack_and_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.mix");

        let mut ar = Archive::create(&path, PackOptions::new(Generation::TiberianSun)).unwrap();
        ar.add_file("hello.txt", b"hello").unwrap();
        ar.add_file("world.txt", b"world").unwrap();
        ar.finalize().unwrap();

        let mut ar = Archive::open(&path).unwrap();
        assert_eq!(ar.read_file("hello.txt").unwrap(), b"hello");
        assert_eq!(ar.stat("world.txt").unwrap().length, 5);
        assert_eq!(ar.stat("world.txt").unwrap().name.as_deref(), Some("world.txt"));
        assert!(ar.stat("missing.txt").is_none());
    }

    #[test]
    fn extract_all_uses_hex_for_unnamed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("anon.mix");

        let mut ar = Archive::create(&path, PackOptions::new(Generation::RedAlert)).unwrap();
        ar.container().insert_id(0xABCD, b"anon").unwrap();
        ar.add_file("named.bin", b"named").unwrap();
        ar.finalize().unwrap();

        let out = dir.path().join("out");
        let mut ar = Archive::open(&path).unwrap();
        // the name table counts as an entry too
        assert_eq!(ar.extract_all(&out).unwrap(), 3);
        assert_eq!(fs::read(out.join("0x0000abcd")).unwrap(), b"anon");
        assert_eq!(fs::read(out.join("named.bin")).unwrap(), b"named");
    }

    #[test]
    fn unsafe_names_fall_back_to_ids() {
        let info = EntryInfo { id: 7, name: Some("../evil".into()), offset: 0, length: 0 };
        assert_eq!(output_name(&info), "0x00000007");
    }

    #[test]
    fn read_only_archive_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ro.mix");
        Archive::create(&path, PackOptions::default()).unwrap().finalize().unwrap();

        let mut ar = Archive::open(&path).unwrap();
        assert!(matches!(ar.add_file("x", b"y"), Err(Error::ReadOnly)));
    }
}
