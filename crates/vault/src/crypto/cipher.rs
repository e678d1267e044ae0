//! AES-256-GCM encryption and decryption of individual string fields.
//!
//! Every call draws a fresh 96-bit nonce from the OS CSPRNG. GCM nonce reuse
//! under one key breaks both confidentiality and authentication, so each data
//! key carries an encryption budget enforced by the key provider.

use std::sync::Arc;

use aes_gcm::{
    aead::{rand_core::RngCore, AeadInPlace, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce, Tag,
};
use async_trait::async_trait;
use common::{EncryptedValue, EncryptionContext, FieldError, SensitivityLevel};
use thiserror::Error;
use tracing::{debug, error};
use zeroize::Zeroizing;

use super::{KEY_LEN, NONCE_LEN, TAG_LEN};
use crate::dek::KeyProvider;
use crate::gate::FieldDecryptor;

/// Errors produced by the AEAD primitives.
#[derive(Debug, Error)]
pub enum CipherError {
    /// Authentication failed: wrong key, wrong AAD, or tampered data.
    #[error("aead authentication failed")]
    AeadFailure,

    /// The plaintext exceeds what AES-GCM can seal under one nonce.
    #[error("plaintext too long to seal")]
    TooLong,
}

/// Output of [`seal`].
pub struct Sealed {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

/// Encrypt `plaintext` under `key` with a fresh random nonce, authenticating
/// `aad`. The tag is returned detached.
///
/// # Errors
///
/// Returns [`CipherError::TooLong`] if the plaintext exceeds the GCM limit.
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8], aad: &[u8]) -> Result<Sealed, CipherError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let mut ciphertext = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), aad, &mut ciphertext)
        .map_err(|_| CipherError::TooLong)?;

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(&tag);
    Ok(Sealed {
        nonce,
        ciphertext,
        tag: tag_bytes,
    })
}

/// Decrypt and authenticate. The returned buffer is zeroized on drop.
///
/// # Errors
///
/// Returns [`CipherError::AeadFailure`] if authentication fails.
pub fn open(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    tag: &[u8; TAG_LEN],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CipherError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut buf = Zeroizing::new(ciphertext.to_vec());
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(nonce),
            aad,
            buf.as_mut_slice(),
            Tag::from_slice(tag),
        )
        .map_err(|_| CipherError::AeadFailure)?;
    Ok(buf)
}

/// Encrypts and decrypts single field values under KMS-backed data keys.
#[derive(Debug, Clone)]
pub struct FieldCipher {
    keys: Arc<KeyProvider>,
}

impl FieldCipher {
    pub fn new(keys: Arc<KeyProvider>) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &Arc<KeyProvider> {
        &self.keys
    }

    /// Encrypt `plaintext` for `context` under the data key for `level`.
    ///
    /// # Errors
    ///
    /// [`FieldError::KeyUnavailable`] if no data key can be obtained.
    pub async fn encrypt(
        &self,
        plaintext: &str,
        level: SensitivityLevel,
        context: &EncryptionContext,
    ) -> Result<EncryptedValue, FieldError> {
        let key = self.keys.get_or_create_data_key(level, context).await?;
        let sealed = seal(key.plaintext(), plaintext.as_bytes(), &context.aad())
            .map_err(|e| FieldError::IntegrityViolation(e.to_string()))?;
        Ok(EncryptedValue::new(
            sealed.ciphertext,
            sealed.nonce,
            sealed.tag,
            key.key_id(),
            key.wrapped_key().clone(),
        ))
    }

    /// Decrypt `value` for `context`. Uses the cached data key when `value`
    /// was produced by it, otherwise unwraps the stored key through the KMS.
    ///
    /// # Errors
    ///
    /// - [`FieldError::IntegrityViolation`] on tag mismatch, a context other
    ///   than the one used at encryption, or non-UTF-8 plaintext.
    /// - [`FieldError::KeyUnavailable`] if the KMS cannot unwrap the key.
    pub async fn decrypt(
        &self,
        value: &EncryptedValue,
        context: &EncryptionContext,
    ) -> Result<String, FieldError> {
        let result = self.open_value(value, context).await;
        if let Err(FieldError::IntegrityViolation(reason)) = &result {
            error!(
                key_id = %value.key_id(),
                entity_type = %context.entity_type(),
                entity_id = %context.entity_id(),
                caller_id = %context.caller_id(),
                reason = %reason,
                "field failed integrity check"
            );
        }
        result
    }

    async fn open_value(
        &self,
        value: &EncryptedValue,
        context: &EncryptionContext,
    ) -> Result<String, FieldError> {
        let aad = context.aad();
        let opened = match self.keys.cached(context, value.key_id()) {
            Some(key) => open(key.plaintext(), value.nonce(), value.ciphertext(), value.auth_tag(), &aad),
            None => {
                debug!(key_id = value.key_id(), "data key not cached; unwrapping");
                let key = self.keys.unwrap(value.wrapped_key(), context).await?;
                open(key.expose(), value.nonce(), value.ciphertext(), value.auth_tag(), &aad)
            }
        }
        .map_err(|e| FieldError::IntegrityViolation(e.to_string()))?;

        std::str::from_utf8(&opened)
            .map(str::to_owned)
            .map_err(|_| FieldError::IntegrityViolation("decrypted value is not valid UTF-8".into()))
    }
}

#[async_trait]
impl FieldDecryptor for FieldCipher {
    async fn decrypt(
        &self,
        value: &EncryptedValue,
        context: &EncryptionContext,
    ) -> Result<String, FieldError> {
        FieldCipher::decrypt(self, value, context).await
    }
}
