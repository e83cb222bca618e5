//! Index encryption for Extended containers.
//!
//! An encrypted container keeps only its flags word in the clear.  An
//! 80-byte key source follows, then the Blowfish-encrypted rest of the
//! prefix:
//!
//! ```text
//! flags u32 | key source (80) | Blowfish-ECB( count u16 | body_size u32 | index | pad )
//! ```
//!
//! The key source is two 40-byte little-endian integers.  Each one is
//! raised to the public exponent modulo the published Westwood modulus and
//! the low 39 bytes of every result are concatenated; the first 56 bytes
//! are the Blowfish key.  Blowfish reads each 8-byte block as two
//! little-endian words.
//!
//! Every reader carries the public key, so this is obfuscation and not
//! confidentiality.  Readers only ever run the public operation, so a key
//! source of random bytes below the modulus is as good as one made with
//! the private key; that is how new keys are minted.

use blowfish::cipher::generic_array::GenericArray;
use blowfish::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use blowfish::BlowfishLE;
use num_bigint::BigUint;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use thiserror::Error;

pub const KEY_SOURCE_LEN: usize = 80;
pub const KEY_LEN:        usize = 56;
pub const BLOCK_LEN:      usize = 8;

/// Modulus of the public key every Westwood reader embeds, big-endian.
const MODULUS: [u8; 40] = [
    0x51, 0xbc, 0xda, 0x08, 0x6d, 0x39, 0xfc, 0xe4,
    0x56, 0x51, 0x60, 0xd6, 0x51, 0x71, 0x3f, 0xa2,
    0xe8, 0xaa, 0x54, 0xfa, 0x66, 0x82, 0xb0, 0x4a,
    0xab, 0xdd, 0x0e, 0x6a, 0xf8, 0xb0, 0xc1, 0xe6,
    0xd1, 0xfb, 0x4f, 0x3d, 0xaa, 0x43, 0x7f, 0x15,
];
const EXPONENT: u32 = 0x10001;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("key source is {0} bytes, expected {KEY_SOURCE_LEN}")]
    SourceLength(usize),
    #[error("key source block {0} is not below the public modulus")]
    SourceRange(usize),
    #[error("Blowfish key rejected")]
    KeyLength,
    #[error("{0} encrypted bytes is not a whole number of {BLOCK_LEN}-byte blocks")]
    Alignment(usize),
    #[error("decrypted index is implausible: {0}")]
    Index(String),
}

/// Blowfish key of one container, with the key source it came from.
#[derive(Clone, PartialEq, Eq)]
pub struct IndexKey {
    source: [u8; KEY_SOURCE_LEN],
    key:    [u8; KEY_LEN],
}

impl fmt::Debug for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IndexKey(..)")
    }
}

impl IndexKey {
    /// Mint a key from a random key source.
    pub fn generate() -> Self {
        let (_, out_len) = public_key();
        loop {
            let mut source = [0u8; KEY_SOURCE_LEN];
            OsRng.fill_bytes(&mut source);
            // A zero top byte keeps every block below the modulus.
            for block in source.chunks_exact_mut(out_len + 1) {
                block[out_len] = 0;
            }
            if let Ok(key) = Self::unlock(&source) {
                return key;
            }
        }
    }

    /// Derive the Blowfish key from a stored key source.
    pub fn unlock(source: &[u8]) -> Result<Self, CryptoError> {
        let source: [u8; KEY_SOURCE_LEN] = source
            .try_into()
            .map_err(|_| CryptoError::SourceLength(source.len()))?;

        let (modulus, out_len) = public_key();
        let exponent = BigUint::from(EXPONENT);
        let mut plain = Vec::with_capacity(KEY_SOURCE_LEN);
        for (i, block) in source.chunks_exact(out_len + 1).enumerate() {
            let m = BigUint::from_bytes_le(block);
            if m >= modulus {
                return Err(CryptoError::SourceRange(i));
            }
            let mut out = m.modpow(&exponent, &modulus).to_bytes_le();
            out.resize(out_len, 0);
            plain.extend_from_slice(&out);
        }
        if plain.len() < KEY_LEN {
            return Err(CryptoError::KeyLength);
        }

        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&plain[..KEY_LEN]);
        Ok(Self { source, key })
    }

    pub fn key_source(&self) -> &[u8; KEY_SOURCE_LEN] {
        &self.source
    }

    /// Encrypt `plain`, zero-padded to a whole number of blocks.
    pub fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = self.cipher()?;
        let mut out = plain.to_vec();
        out.resize(sealed_len(plain.len()), 0);
        for block in out.chunks_exact_mut(BLOCK_LEN) {
            cipher.encrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(out)
    }

    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() % BLOCK_LEN != 0 {
            return Err(CryptoError::Alignment(sealed.len()));
        }
        let cipher = self.cipher()?;
        let mut out = sealed.to_vec();
        for block in out.chunks_exact_mut(BLOCK_LEN) {
            cipher.decrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(out)
    }

    fn cipher(&self) -> Result<BlowfishLE, CryptoError> {
        BlowfishLE::new_from_slice(&self.key).map_err(|_| CryptoError::KeyLength)
    }
}

/// Stored size of `plain_len` bytes once encrypted.
pub fn sealed_len(plain_len: usize) -> usize {
    plain_len.div_ceil(BLOCK_LEN) * BLOCK_LEN
}

/// Modulus and the number of key bytes each source block yields.
fn public_key() -> (BigUint, usize) {
    let modulus = BigUint::from_bytes_be(&MODULUS);
    let out_len = ((modulus.bits() - 2) / 8) as usize;
    (modulus, out_len)
}
