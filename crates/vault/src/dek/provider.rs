//! [`KeyProvider`]: hands out data keys for encryption and unwraps stored ones
//! for decryption.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use common::{EncryptionContext, FieldError, SensitivityLevel};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cache::{CacheKey, CachedKey, KeyCache};
use super::key::{DataKey, KeyBytes};
use crate::kms::{KeyManagementService, KeyMetadata, KmsError};

/// Default bound on every KMS call.
pub const DEFAULT_KMS_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of encryptions (random nonces) allowed per data key.
pub const DEFAULT_MAX_ENCRYPTIONS: u64 = 1 << 32;

/// The active KMS key id for each sensitivity level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmsKeyIds {
    default: String,
    overrides: HashMap<SensitivityLevel, String>,
}

impl KmsKeyIds {
    /// Use `default` for every level.
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            default: default.into(),
            overrides: HashMap::new(),
        }
    }

    /// Serve `level` from its own KMS key.
    pub fn with_override(mut self, level: SensitivityLevel, key_id: impl Into<String>) -> Self {
        self.overrides.insert(level, key_id.into());
        self
    }

    pub fn for_level(&self, level: SensitivityLevel) -> &str {
        self.overrides
            .get(&level)
            .map_or(self.default.as_str(), String::as_str)
    }

    /// Encrypted levels served by `kms_key_id`.
    pub fn levels_using(&self, kms_key_id: &str) -> Vec<SensitivityLevel> {
        SensitivityLevel::ENCRYPTED
            .into_iter()
            .filter(|level| self.for_level(*level) == kms_key_id)
            .collect()
    }
}

/// Obtains data keys from the KMS and caches them per `(level, context)`.
pub struct KeyProvider {
    kms: Arc<dyn KeyManagementService>,
    cache: KeyCache,
    key_ids: KmsKeyIds,
    kms_timeout: Duration,
    max_encryptions: u64,
}

impl KeyProvider {
    pub fn new(kms: Arc<dyn KeyManagementService>, key_ids: KmsKeyIds) -> Self {
        Self {
            kms,
            cache: KeyCache::default(),
            key_ids,
            kms_timeout: DEFAULT_KMS_TIMEOUT,
            max_encryptions: DEFAULT_MAX_ENCRYPTIONS,
        }
    }

    pub fn with_cache(mut self, cache: KeyCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_kms_timeout(mut self, timeout: Duration) -> Self {
        self.kms_timeout = timeout;
        self
    }

    pub fn with_max_encryptions(mut self, max: u64) -> Self {
        self.max_encryptions = max;
        self
    }

    pub fn cache(&self) -> &KeyCache {
        &self.cache
    }

    pub fn key_ids(&self) -> &KmsKeyIds {
        &self.key_ids
    }

    /// Return a live data key for `(level, context)`, generating one through
    /// the KMS on a miss, on expiry, or once the cached key has used up its
    /// encryption budget. Each successful call reserves one encryption.
    ///
    /// Concurrent callers for the same slot wait for the first caller's KMS
    /// call instead of issuing their own. If that call fails, the callers
    /// queued behind it get the same error. Waiting for the slot is bounded
    /// by the KMS timeout.
    ///
    /// # Errors
    ///
    /// [`FieldError::KeyUnavailable`] if the KMS fails, throttles, or times out.
    pub async fn get_or_create_data_key(
        &self,
        level: SensitivityLevel,
        context: &EncryptionContext,
    ) -> Result<Arc<DataKey>, FieldError> {
        let slot = self.cache.slot(CacheKey::new(level, context));
        let failures_seen = slot.failures();
        let mut entry = tokio::time::timeout(self.kms_timeout, slot.lock())
            .await
            .map_err(|_| {
                FieldError::KeyUnavailable(format!(
                    "timed out after {:?} waiting for an in-flight data key request",
                    self.kms_timeout
                ))
            })?;

        let now = Instant::now();
        if let Some(cached) = entry.as_mut() {
            if !cached.is_expired(now, self.cache.ttl())
                && cached.key.try_reserve(self.max_encryptions)
            {
                cached.touch(now);
                return Ok(cached.key.clone());
            }
            debug!(level = %level, key_id = cached.key.key_id(), "retiring cached data key");
        }
        if let Some(e) = slot.failure_since(failures_seen) {
            debug!(level = %level, error = %e, "sharing failed data key request");
            return Err(e);
        }
        // Drop the retired key before the KMS call so it is not kept alive.
        *entry = None;

        let key = match self.generate(level, context).await {
            Ok(key) => Arc::new(key),
            Err(e) => {
                slot.record_failure(e.clone());
                return Err(e);
            }
        };
        if !key.try_reserve(self.max_encryptions) {
            return Err(FieldError::KeyUnavailable(
                "data key encryption budget is zero".into(),
            ));
        }
        *entry = Some(CachedKey::new(key.clone(), Instant::now()));
        Ok(key)
    }

    /// Unwrap a stored data key through the KMS, binding `context`.
    ///
    /// # Errors
    ///
    /// - [`FieldError::IntegrityViolation`] if the KMS refuses the wrapped key
    ///   for this context.
    /// - [`FieldError::KeyUnavailable`] on any other KMS failure.
    pub async fn unwrap(
        &self,
        wrapped: &[u8],
        context: &EncryptionContext,
    ) -> Result<KeyBytes, FieldError> {
        let plaintext = self
            .call_kms("decrypt", self.kms.unwrap(wrapped, context))
            .await?;
        KeyBytes::from_slice(&plaintext).map_err(|e| FieldError::IntegrityViolation(e.to_string()))
    }

    /// Decrypt-path cache lookup: the cached key with id `key_id` for
    /// `context` at any encrypted level. Never waits on an in-flight slot.
    pub fn cached(&self, context: &EncryptionContext, key_id: &str) -> Option<Arc<DataKey>> {
        SensitivityLevel::ENCRYPTED
            .into_iter()
            .find_map(|level| self.cache.peek(&CacheKey::new(level, context), key_id))
    }

    pub(crate) async fn describe_kms_key(&self, kms_key_id: &str) -> Result<KeyMetadata, KmsError> {
        self.call_kms("describe_key", self.kms.describe_key(kms_key_id))
            .await
    }

    pub(crate) async fn rotate_kms_key(&self, kms_key_id: &str) -> Result<KeyMetadata, KmsError> {
        self.call_kms("rotate_key", self.kms.rotate_key(kms_key_id))
            .await
    }

    async fn generate(
        &self,
        level: SensitivityLevel,
        context: &EncryptionContext,
    ) -> Result<DataKey, FieldError> {
        let kms_key_id = self.key_ids.for_level(level);
        let generated = self
            .call_kms(
                "generate_data_key",
                self.kms.generate_data_key(kms_key_id, context),
            )
            .await?;
        let plaintext = KeyBytes::from_slice(&generated.plaintext)
            .map_err(|e| FieldError::KeyUnavailable(format!("KMS returned a bad data key: {e}")))?;

        let key_id = format!("dek-{}", Uuid::new_v4());
        info!(
            level = %level,
            key_id = %key_id,
            kms_key_id = %generated.kms_key_id,
            "generated data key"
        );
        Ok(DataKey::new(
            key_id,
            plaintext,
            generated.wrapped,
            generated.kms_key_id,
            level,
        ))
    }

    /// Run one KMS call under the configured timeout.
    async fn call_kms<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, KmsError>>,
    ) -> Result<T, KmsError> {
        match tokio::time::timeout(self.kms_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(operation, error = %e, "KMS call failed");
                Err(e)
            }
            Err(_) => {
                warn!(operation, timeout_ms = self.kms_timeout.as_millis() as u64, "KMS call timed out");
                Err(KmsError::Unavailable(format!(
                    "{operation} timed out after {:?}",
                    self.kms_timeout
                )))
            }
        }
    }
}

impl std::fmt::Debug for KeyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyProvider")
            .field("cache", &self.cache)
            .field("key_ids", &self.key_ids)
            .field("kms_timeout", &self.kms_timeout)
            .field("max_encryptions", &self.max_encryptions)
            .finish_non_exhaustive()
    }
}
