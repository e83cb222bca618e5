//! Integrity digest for checksummed containers.
//!
//! The digest is SHA-1 over every body byte, free space included, and
//! sits in the 20 bytes right after the body.  Because free space is
//! covered, a checksummed container's holes are part of its committed
//! state; the extent allocator keeps them sealed.

use sha1::{Digest, Sha1};

use crate::error::Result;

pub const DIGEST_LEN: usize = 20;

const CHUNK: u64 = 1 << 20;

/// Result of comparing a stored digest with a recomputed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Integrity {
    /// No digest is stored, or it has not been checked.
    Unchecked,
    Verified,
    Mismatch,
}

/// Digest over `length` bytes from absolute offset `start`, fetched
/// through `read(pos, buf)`.
pub fn compute_with<F>(start: u64, length: u64, mut read: F) -> Result<[u8; DIGEST_LEN]>
where
    F: FnMut(u64, &mut [u8]) -> Result<()>,
{
    let mut hasher = Sha1::new();
    let mut buf = Vec::new();
    let mut done = 0;
    while done < length {
        let n = (length - done).min(CHUNK) as usize;
        buf.resize(n, 0);
        read(start + done, &mut buf[..n])?;
        hasher.update(&buf[..n]);
        done += n as u64;
    }

    let mut digest = [0u8; DIGEST_LEN];
    digest.copy_from_slice(&hasher.finalize());
    Ok(digest)
}

pub fn compare(stored: &[u8; DIGEST_LEN], computed: &[u8; DIGEST_LEN]) -> Integrity {
    if stored == computed {
        Integrity::Verified
    } else {
        Integrity::Mismatch
    }
}
