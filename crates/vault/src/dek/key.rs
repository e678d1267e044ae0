//! In-memory data key material.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use common::SensitivityLevel;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::KEY_LEN;

/// The key material has an unexpected length.
#[derive(Debug, Error)]
#[error("data key has invalid length: expected {KEY_LEN} bytes, got {0}")]
pub struct InvalidKeyLength(pub usize);

/// Fixed-size key buffer that holds exactly [`KEY_LEN`] bytes.
///
/// Overwritten with zeroes when dropped. Neither `Clone` nor `Serialize`.
pub struct KeyBytes(Box<[u8; KEY_LEN]>);

impl Zeroize for KeyBytes {
    fn zeroize(&mut self) {
        self.0.as_mut_slice().zeroize();
    }
}

impl Drop for KeyBytes {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl ZeroizeOnDrop for KeyBytes {}

impl KeyBytes {
    /// Copy `bytes` into a new zeroizing buffer.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidKeyLength`] if `bytes` is not [`KEY_LEN`] long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, InvalidKeyLength> {
        if bytes.len() != KEY_LEN {
            return Err(InvalidKeyLength(bytes.len()));
        }
        let mut buf = Box::new([0u8; KEY_LEN]);
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }

    pub(crate) fn expose(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for KeyBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material, not even in debug builds.
        f.write_str("KeyBytes([REDACTED])")
    }
}

/// A data key: plaintext material plus the wrapped form that travels with
/// every ciphertext it produces.
///
/// Shared as `Arc<DataKey>` between the cache and in-flight operations; the
/// plaintext is zeroized when the last holder drops it.
pub struct DataKey {
    key_id: String,
    plaintext: KeyBytes,
    wrapped: Bytes,
    kms_key_id: String,
    level: SensitivityLevel,
    encryptions: AtomicU64,
}

impl DataKey {
    pub fn new(
        key_id: String,
        plaintext: KeyBytes,
        wrapped: Bytes,
        kms_key_id: String,
        level: SensitivityLevel,
    ) -> Self {
        Self {
            key_id,
            plaintext,
            wrapped,
            kms_key_id,
            level,
            encryptions: AtomicU64::new(0),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn wrapped_key(&self) -> &Bytes {
        &self.wrapped
    }

    pub fn kms_key_id(&self) -> &str {
        &self.kms_key_id
    }

    pub fn level(&self) -> SensitivityLevel {
        self.level
    }

    pub(crate) fn plaintext(&self) -> &[u8; KEY_LEN] {
        self.plaintext.expose()
    }

    /// Encryptions reserved against this key so far.
    pub fn encryptions(&self) -> u64 {
        self.encryptions.load(Ordering::SeqCst)
    }

    /// Reserve one encryption (one random nonce) against the key's budget.
    /// Returns `false` once `limit` encryptions have been reserved.
    pub(crate) fn try_reserve(&self, limit: u64) -> bool {
        self.encryptions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok()
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey")
            .field("key_id", &self.key_id)
            .field("kms_key_id", &self.kms_key_id)
            .field("level", &self.level)
            .field("plaintext", &self.plaintext)
            .finish_non_exhaustive()
    }
}
