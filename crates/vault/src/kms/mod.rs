//! The external Key Management Service seam.
//!
//! The core never sees a master key. It asks the KMS to generate data keys
//! (returned both in plaintext and wrapped form) and to unwrap previously
//! wrapped keys. The [`EncryptionContext`] is passed on every call so the KMS
//! itself refuses to unwrap a key presented under the wrong context.
//!
//! Implementations:
//! - [`crate::aws::AwsKms`] for AWS KMS.
//! - [`local::LocalKms`], an in-process implementation for development and tests.

pub mod local;

pub use local::LocalKms;

use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use common::{EncryptionContext, FieldError};
use thiserror::Error;
use zeroize::Zeroizing;

/// Errors surfaced by a [`KeyManagementService`].
#[derive(Debug, Error)]
pub enum KmsError {
    /// The service could not be reached or failed internally.
    #[error("KMS unavailable: {0}")]
    Unavailable(String),

    /// The service throttled the request.
    #[error("KMS throttled the request: {0}")]
    Throttled(String),

    /// The caller is not permitted to use the key, or the key is disabled.
    #[error("KMS access denied: {0}")]
    AccessDenied(String),

    /// The key id does not exist.
    #[error("KMS key not found: {0}")]
    NotFound(String),

    /// The wrapped key is corrupt or was bound to a different encryption context.
    #[error("KMS rejected the ciphertext: {0}")]
    InvalidCiphertext(String),

    /// The service answered with a response the core cannot use.
    #[error("invalid KMS response: {0}")]
    InvalidResponse(String),
}

impl From<KmsError> for FieldError {
    fn from(e: KmsError) -> Self {
        match e {
            KmsError::InvalidCiphertext(msg) => FieldError::IntegrityViolation(format!(
                "wrapped key rejected for this context: {msg}"
            )),
            other => FieldError::KeyUnavailable(other.to_string()),
        }
    }
}

/// A freshly generated data key.
pub struct GeneratedDataKey {
    /// Plaintext key bytes; zeroized when dropped.
    pub plaintext: Zeroizing<Vec<u8>>,
    /// The KMS-wrapped form, safe to persist.
    pub wrapped: Bytes,
    /// The KMS key that wrapped it.
    pub kms_key_id: String,
}

impl std::fmt::Debug for GeneratedDataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedDataKey")
            .field("plaintext", &"[REDACTED]")
            .field("wrapped_len", &self.wrapped.len())
            .field("kms_key_id", &self.kms_key_id)
            .finish()
    }
}

/// Metadata for a KMS key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMetadata {
    pub key_id: String,
    pub enabled: bool,
    pub created_at: Option<SystemTime>,
    /// When the key material was last rotated, if the service reports it.
    pub last_rotated_at: Option<SystemTime>,
}

impl KeyMetadata {
    /// The instant the current key material became active.
    pub fn active_since(&self) -> Option<SystemTime> {
        self.last_rotated_at.or(self.created_at)
    }
}

/// External key management operations consumed by the key provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyManagementService: Send + Sync {
    /// Generate a new 256-bit data key under `key_id`, bound to `context`.
    async fn generate_data_key(
        &self,
        key_id: &str,
        context: &EncryptionContext,
    ) -> Result<GeneratedDataKey, KmsError>;

    /// Unwrap a previously wrapped data key. Fails with
    /// [`KmsError::InvalidCiphertext`] when `context` differs from the one
    /// the key was generated under.
    async fn unwrap(
        &self,
        wrapped: &[u8],
        context: &EncryptionContext,
    ) -> Result<Zeroizing<Vec<u8>>, KmsError>;

    /// Describe a KMS key.
    async fn describe_key(&self, key_id: &str) -> Result<KeyMetadata, KmsError>;

    /// Rotate the key material behind `key_id`. Prior versions stay available
    /// for unwrap; only new data keys use the new material.
    async fn rotate_key(&self, key_id: &str) -> Result<KeyMetadata, KmsError>;
}
