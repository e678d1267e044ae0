//! [`LocalKms`]: an in-process [`KeyManagementService`].
//!
//! Master keys live in memory only, so anything wrapped by one process cannot
//! be unwrapped after a restart. Suitable for development and tests; never
//! for production data.
//!
//! # Wrapped key format
//!
//! ```text
//! [u16 BE key-id length][key id][u32 BE version][12-byte nonce][data key ciphertext + tag]
//! ```
//!
//! The data key is sealed with AES-256-GCM under the master key version, with
//! the context AAD bound, so unwrapping under another context fails.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use aes_gcm::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use common::EncryptionContext;
use parking_lot::RwLock;
use zeroize::Zeroizing;

use super::{GeneratedDataKey, KeyManagementService, KeyMetadata, KmsError};
use crate::crypto::{KEY_LEN, NONCE_LEN};

struct MasterKeyVersion {
    material: Zeroizing<[u8; KEY_LEN]>,
    created_at: SystemTime,
}

impl MasterKeyVersion {
    fn generate() -> Self {
        let mut material = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut *material);
        Self {
            material,
            created_at: SystemTime::now(),
        }
    }

    fn cipher(&self) -> Result<Aes256Gcm, KmsError> {
        Aes256Gcm::new_from_slice(&self.material[..])
            .map_err(|_| KmsError::InvalidResponse("master key has invalid length".into()))
    }
}

/// In-memory KMS with versioned master keys, call counters, optional latency,
/// and an availability switch for failure testing.
pub struct LocalKms {
    keys: RwLock<HashMap<String, Vec<MasterKeyVersion>>>,
    latency: Option<Duration>,
    available: AtomicBool,
    generate_calls: AtomicUsize,
    unwrap_calls: AtomicUsize,
}

impl LocalKms {
    /// Create a KMS with no keys.
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            latency: None,
            available: AtomicBool::new(true),
            generate_calls: AtomicUsize::new(0),
            unwrap_calls: AtomicUsize::new(0),
        }
    }

    /// Create a KMS holding one master key named `key_id`.
    pub fn with_key(key_id: &str) -> Self {
        let kms = Self::new();
        kms.create_key(key_id);
        kms
    }

    /// Delay every call by `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Create (or replace) a master key.
    pub fn create_key(&self, key_id: &str) {
        self.keys
            .write()
            .insert(key_id.to_owned(), vec![MasterKeyVersion::generate()]);
    }

    /// Toggle availability; while unavailable every call fails with
    /// [`KmsError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of `generate_data_key` calls received.
    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    /// Number of `unwrap` calls received.
    pub fn unwrap_calls(&self) -> usize {
        self.unwrap_calls.load(Ordering::SeqCst)
    }

    /// Number of versions of `key_id`, or 0 if unknown.
    pub fn key_versions(&self, key_id: &str) -> usize {
        self.keys.read().get(key_id).map_or(0, Vec::len)
    }

    async fn enter(&self) -> Result<(), KmsError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(KmsError::Unavailable("local KMS switched off".into()));
        }
        Ok(())
    }

    fn metadata(key_id: &str, versions: &[MasterKeyVersion]) -> KeyMetadata {
        KeyMetadata {
            key_id: key_id.to_owned(),
            enabled: true,
            created_at: versions.first().map(|v| v.created_at),
            last_rotated_at: if versions.len() > 1 {
                versions.last().map(|v| v.created_at)
            } else {
                None
            },
        }
    }
}

impl Default for LocalKms {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyManagementService for LocalKms {
    async fn generate_data_key(
        &self,
        key_id: &str,
        context: &EncryptionContext,
    ) -> Result<GeneratedDataKey, KmsError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;

        let mut plaintext = Zeroizing::new(vec![0u8; KEY_LEN]);
        OsRng.fill_bytes(plaintext.as_mut_slice());

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let keys = self.keys.read();
        let versions = keys
            .get(key_id)
            .ok_or_else(|| KmsError::NotFound(key_id.to_owned()))?;
        let version = versions.len() - 1;
        let sealed = versions[version]
            .cipher()?
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext.as_slice(),
                    aad: &context.aad(),
                },
            )
            .map_err(|_| KmsError::InvalidResponse("failed to wrap data key".into()))?;

        let id_len = u16::try_from(key_id.len())
            .map_err(|_| KmsError::InvalidResponse("key id too long".into()))?;
        let version = u32::try_from(version)
            .map_err(|_| KmsError::InvalidResponse("too many key versions".into()))?;
        let mut wrapped = BytesMut::with_capacity(2 + key_id.len() + 4 + NONCE_LEN + sealed.len());
        wrapped.put_u16(id_len);
        wrapped.put_slice(key_id.as_bytes());
        wrapped.put_u32(version);
        wrapped.put_slice(&nonce);
        wrapped.put_slice(&sealed);

        Ok(GeneratedDataKey {
            plaintext,
            wrapped: wrapped.freeze(),
            kms_key_id: key_id.to_owned(),
        })
    }

    async fn unwrap(
        &self,
        wrapped: &[u8],
        context: &EncryptionContext,
    ) -> Result<Zeroizing<Vec<u8>>, KmsError> {
        self.unwrap_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;

        let parsed = parse_wrapped(wrapped)?;
        let keys = self.keys.read();
        let version = keys
            .get(parsed.key_id)
            .and_then(|versions| versions.get(parsed.version as usize))
            .ok_or_else(|| KmsError::InvalidCiphertext("unknown key or key version".into()))?;

        version
            .cipher()?
            .decrypt(
                Nonce::from_slice(parsed.nonce),
                Payload {
                    msg: parsed.sealed,
                    aad: &context.aad(),
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| KmsError::InvalidCiphertext("encryption context mismatch".into()))
    }

    async fn describe_key(&self, key_id: &str) -> Result<KeyMetadata, KmsError> {
        self.enter().await?;
        let keys = self.keys.read();
        let versions = keys
            .get(key_id)
            .ok_or_else(|| KmsError::NotFound(key_id.to_owned()))?;
        Ok(Self::metadata(key_id, versions))
    }

    async fn rotate_key(&self, key_id: &str) -> Result<KeyMetadata, KmsError> {
        self.enter().await?;
        let mut keys = self.keys.write();
        let versions = keys
            .get_mut(key_id)
            .ok_or_else(|| KmsError::NotFound(key_id.to_owned()))?;
        versions.push(MasterKeyVersion::generate());
        Ok(Self::metadata(key_id, versions))
    }
}

struct ParsedWrapped<'a> {
    key_id: &'a str,
    version: u32,
    nonce: &'a [u8],
    sealed: &'a [u8],
}

fn parse_wrapped(wrapped: &[u8]) -> Result<ParsedWrapped<'_>, KmsError> {
    let malformed = || KmsError::InvalidCiphertext("malformed wrapped key".into());

    let (len, rest) = split(wrapped, 2).ok_or_else(malformed)?;
    let id_len = u16::from_be_bytes([len[0], len[1]]) as usize;
    let (id, rest) = split(rest, id_len).ok_or_else(malformed)?;
    let key_id = std::str::from_utf8(id).map_err(|_| malformed())?;
    let (version, rest) = split(rest, 4).ok_or_else(malformed)?;
    let version = u32::from_be_bytes([version[0], version[1], version[2], version[3]]);
    let (nonce, sealed) = split(rest, NONCE_LEN).ok_or_else(malformed)?;
    if sealed.is_empty() {
        return Err(malformed());
    }

    Ok(ParsedWrapped {
        key_id,
        version,
        nonce,
        sealed,
    })
}

fn split(buf: &[u8], at: usize) -> Option<(&[u8], &[u8])> {
    (buf.len() >= at).then(|| buf.split_at(at))
}
