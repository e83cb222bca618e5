//! Error taxonomy shared by every layer of the engine.
//!
//! Every failure is reported as a typed [`Error`] variant; nothing is
//! swallowed.  Free-space fragmentation is the only condition the engine
//! recovers from on its own and it never surfaces here.

use std::io;
use thiserror::Error;

use crate::crypto::CryptoError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Unrecognised or malformed preamble/index.
    #[error("Malformed container: {0}")]
    Format(String),

    /// Declared sizes exceed the bytes actually available.
    #[error("Truncated container: declared {declared} bytes, {available} available")]
    Truncated { declared: u64, available: u64 },

    /// Stored integrity digest does not match the recomputed value.
    #[error("Checksum mismatch: stored {stored}, computed {computed}")]
    ChecksumMismatch { stored: String, computed: String },

    /// The key source is damaged or unlocks to an implausible index.
    #[error("Undecodable key source: {0}")]
    Key(#[from] CryptoError),

    #[error("Entry {0:#010x} already exists")]
    DuplicateId(u32),

    #[error("Entry {0:#010x} not found")]
    NotFound(u32),

    /// Offset/length arithmetic exceeds what the generation can address.
    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    /// Nesting depth or cycle guard tripped.
    #[error("Nested container rejected: {0}")]
    Recursion(String),

    #[error("Unsupported conversion: {0}")]
    UnsupportedConversion(String),

    #[error("Entry {0:#010x} is not a MIX container")]
    NotAContainer(u32),

    #[error("Container is read-only")]
    ReadOnly,

    /// The ID is reserved for the embedded name table.
    #[error("ID {0:#010x} is reserved for the name table")]
    Reserved(u32),

    #[error("Invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    /// True for failures that mean "these bytes are not a container at all",
    /// as opposed to "a container, but damaged or unusable".
    pub fn is_structural(&self) -> bool {
        matches!(self, Error::Format(_) | Error::Truncated { .. })
    }
}

/// Bridge for code paths that must hand engine errors to `std::io` callers.
pub(crate) fn into_io(e: Error) -> io::Error {
    match e {
        Error::Io(inner) => inner,
        other            => io::Error::new(io::ErrorKind::Other, other),
    }
}
