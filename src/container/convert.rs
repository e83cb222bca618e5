//! Format conversion between generations.
//!
//! Entry bytes never move here.  Only the preamble, index and flags change,
//! and the next flush settles the prefix size (relocating entries only if a
//! larger prefix needs their space).

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use tracing::{info, warn};

use super::{resolve_name, Container};
use crate::backing::Backing;
use crate::error::{Error, Result};
use crate::header::{Generation, Protection};
use crate::index::{Index, IndexEntry};

/// Something a conversion could not carry over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConversionWarning {
    DroppedChecksum { target: Generation },
    DroppedEncryption { target: Generation },
}

impl fmt::Display for ConversionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversionWarning::DroppedChecksum { target } => {
                write!(f, "{target} containers have no checksum; the digest was dropped")
            }
            ConversionWarning::DroppedEncryption { target } => {
                write!(f, "{target} containers cannot be encrypted; the index is now stored in the clear")
            }
        }
    }
}

impl<S: Backing> Container<S> {
    /// Rebuild this container for `target`.
    ///
    /// Across key schemes every ID is recomputed from its display name, so
    /// each entry needs a known name.  Protection the target cannot store
    /// is dropped and reported.
    pub fn convert(&mut self, target: Generation) -> Result<Vec<ConversionWarning>> {
        self.ensure_writable()?;
        let source = self.generation;
        if target == source {
            return Ok(Vec::new());
        }

        let mut warnings = Vec::new();
        let protection = if target.supports(self.protection) {
            self.protection
        } else {
            if self.protection.has_checksum() {
                warnings.push(ConversionWarning::DroppedChecksum { target });
            }
            if self.protection.is_encrypted() {
                warnings.push(ConversionWarning::DroppedEncryption { target });
            }
            Protection::None
        };

        let (index, names) = if target.key_scheme() == source.key_scheme() {
            (self.index.clone(), self.names.clone())
        } else {
            self.rekey(target)?
        };

        let had_table = self.index.contains(source.name_table_id());
        self.generation = target;
        self.index = index;
        self.names = names;
        if protection != self.protection {
            self.protection = protection;
            if !protection.is_encrypted() {
                self.key = None;
            }
        }
        self.dirty.set();
        if had_table {
            self.write_name_table()?;
        }

        for w in &warnings {
            warn!(warning = %w, "conversion drops protection");
        }
        info!(from = %source, to = %target, entries = self.index.len(), "converted container");
        Ok(warnings)
    }

    /// New index and name map with every ID rehashed for `target`.
    fn rekey(&self, target: Generation) -> Result<(Index, HashMap<u32, String>)> {
        let old_table = self.generation.name_table_id();
        let new_table = target.name_table_id();
        let mut index = Index::new();
        let mut names = HashMap::new();

        for e in self.index.iter() {
            let id = if e.id == old_table {
                new_table
            } else {
                let name = self.names.get(&e.id).ok_or_else(|| {
                    Error::UnsupportedConversion(format!(
                        "entry {:#010x} has no known name to rehash",
                        e.id
                    ))
                })?;
                let id = resolve_name(name, target)
                    .map_err(|err| Error::UnsupportedConversion(err.to_string()))?;
                if id == new_table {
                    return Err(Error::UnsupportedConversion(format!(
                        "{name:?} hashes to the {target} name-table ID"
                    )));
                }
                names.insert(id, name.clone());
                id
            };
            index
                .insert(IndexEntry { id, ..*e })
                .map_err(|_| Error::UnsupportedConversion(format!("two entries hash to {id:#010x} under {target}")))?;
        }
        if let Some(name) = self.names.get(&old_table) {
            names.insert(new_table, name.clone());
        }
        Ok((index, names))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::OpenOptions;
    use std::io::Cursor;

    #[test]
    fn ra_to_ts_rehashes_names() {
        let mut c = Container::create(Cursor::new(Vec::new()), Generation::RedAlert, Protection::Checksummed).unwrap();
        let ra = c.insert("rules.ini", b"[General]").unwrap();
        assert_eq!(ra, 0xB1C3_B238);

        let warnings = c.convert(Generation::TiberianSun).unwrap();
        assert!(warnings.is_empty());
        let ts = c.resolve("rules.ini").unwrap();
        assert_eq!(ts, 0xF025_A96C);
        assert!(!c.contains(ra));
        assert_eq!(c.extract(ts).unwrap(), b"[General]");

        let bytes = c.close().unwrap().into_inner();
        let mut back = Container::open(Cursor::new(bytes), OpenOptions::read_only()).unwrap();
        assert_eq!(back.generation(), Generation::TiberianSun);
        assert_eq!(back.extract(ts).unwrap(), b"[General]");
    }

    #[test]
    fn to_td_drops_protection() {
        let mut c = Container::create(Cursor::new(Vec::new()), Generation::RedAlert, Protection::ChecksummedEncrypted).unwrap();
        c.insert("a.shp", b"shape").unwrap();
        let warnings = c.convert(Generation::TiberianDawn).unwrap();
        assert_eq!(
            warnings,
            vec![
                ConversionWarning::DroppedChecksum { target: Generation::TiberianDawn },
                ConversionWarning::DroppedEncryption { target: Generation::TiberianDawn },
            ]
        );
        assert_eq!(c.protection(), Protection::None);

        let bytes = c.close().unwrap().into_inner();
        let mut back = Container::open(Cursor::new(bytes), OpenOptions::read_only()).unwrap();
        assert_eq!(back.generation(), Generation::TiberianDawn);
        let id = back.resolve("a.shp").unwrap();
        assert_eq!(back.extract(id).unwrap(), b"shape");
    }

    #[test]
    fn unnamed_entries_block_rekeying() {
        let mut c = Container::create(Cursor::new(Vec::new()), Generation::RedAlert, Protection::None).unwrap();
        c.insert_id(0x1234, b"anonymous").unwrap();
        assert!(matches!(c.convert(Generation::TiberianSun), Err(Error::UnsupportedConversion(_))));
        assert_eq!(c.generation(), Generation::RedAlert);
        assert!(c.contains(0x1234));
    }

    #[test]
    fn name_table_follows_the_generation() {
        let mut c = Container::create(Cursor::new(Vec::new()), Generation::RedAlert, Protection::None).unwrap();
        c.insert("conquer.mix", b"x").unwrap();
        c.write_name_table().unwrap();
        c.convert(Generation::TiberianSun).unwrap();
        assert!(c.contains(Generation::TiberianSun.name_table_id()));
        assert!(!c.contains(Generation::RedAlert.name_table_id()));

        let bytes = c.close().unwrap().into_inner();
        let back = Container::open(Cursor::new(bytes), OpenOptions::read_only()).unwrap();
        assert_eq!(back.generation(), Generation::TiberianSun);
        let id = back.resolve("conquer.mix").unwrap();
        assert_eq!(back.name_of(id), Some("conquer.mix"));
    }
}
