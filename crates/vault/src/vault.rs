//! [`FieldVault`]: the record-level write pipeline.
//!
//! Classifies each field with the [`SensitivityRegistry`], leaves `Public`
//! values in plaintext and encrypts the rest concurrently. Fields are
//! isolated: one field's failure never aborts its siblings.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::protocol::{ProtectedRecord, StoredField};
use common::{EncryptedValue, EncryptionContext, FieldError, SensitivityLevel};
use tokio::task::JoinSet;
use tracing::{debug, error, instrument, warn};

use crate::audit::{AuditEvent, AuditSink, Operation, Outcome};
use crate::crypto::FieldCipher;
use crate::gate::{AccessVerifier, DecryptGate};
use crate::registry::SensitivityRegistry;

/// Bounded exponential backoff for retryable field failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. `1` disables retries.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, counting from 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Result of protecting one record.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    /// Every field that was stored, plaintext or encrypted.
    pub record: ProtectedRecord,
    /// Fields that could not be encrypted. They are absent from `record`.
    pub failures: BTreeMap<String, FieldError>,
    /// Fields encrypted under the default level because no policy exists.
    pub warnings: Vec<FieldError>,
}

impl WriteOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct FieldVault {
    registry: Arc<SensitivityRegistry>,
    cipher: Arc<FieldCipher>,
    audit: Arc<dyn AuditSink>,
    retry: RetryPolicy,
}

impl FieldVault {
    pub fn new(
        registry: Arc<SensitivityRegistry>,
        cipher: Arc<FieldCipher>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            registry,
            cipher,
            audit,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry(&self) -> &Arc<SensitivityRegistry> {
        &self.registry
    }

    pub fn cipher(&self) -> &Arc<FieldCipher> {
        &self.cipher
    }

    /// A [`DecryptGate`] that reads through this vault's cipher and registry.
    pub fn gate(&self, verifier: Arc<dyn AccessVerifier>) -> DecryptGate {
        DecryptGate::new(
            self.cipher.clone(),
            verifier,
            self.registry.clone(),
            self.audit.clone(),
        )
    }

    /// Protect the fields of one record. The record type is the context's
    /// entity type.
    #[instrument(skip_all, fields(record_type = context.entity_type(), field_count = fields.len()))]
    pub async fn protect(
        &self,
        context: &EncryptionContext,
        fields: BTreeMap<String, String>,
    ) -> WriteOutcome {
        let record_type = context.entity_type();
        let mut record = ProtectedRecord::new(record_type, context.entity_id());
        let mut failures = BTreeMap::new();
        let mut warnings = Vec::new();
        let mut pending = BTreeSet::new();
        let mut tasks = JoinSet::new();

        for (name, plaintext) in fields {
            let level = match self.registry.lookup(record_type, &name) {
                Some(level) => level,
                None => {
                    let level = self.registry.classify(record_type, &name);
                    let warning = FieldError::MisconfiguredField {
                        record_type: record_type.to_owned(),
                        field_name: name.clone(),
                        applied: level,
                    };
                    warn!(field = %name, applied = %level, "field has no sensitivity policy");
                    warnings.push(warning);
                    level
                }
            };

            if !level.requires_encryption() {
                record.fields.insert(name, StoredField::Plain(plaintext));
                continue;
            }

            pending.insert(name.clone());
            let cipher = self.cipher.clone();
            let context = context.clone();
            let retry = self.retry;
            tasks.spawn(async move {
                let started = Instant::now();
                let result = encrypt_with_retry(&cipher, &plaintext, level, &context, retry).await;
                (name, result, started.elapsed())
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (name, result, latency) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "field encrypt task failed");
                    continue;
                }
            };
            pending.remove(&name);
            match result {
                Ok(value) => {
                    self.audit.record(AuditEvent::field(
                        Operation::Encrypt,
                        context,
                        &name,
                        Outcome::Success,
                        latency,
                    ));
                    record.fields.insert(name, StoredField::Encrypted(value));
                }
                Err(e) => {
                    warn!(field = %name, error = %e, "field encryption failed");
                    self.audit.record(
                        AuditEvent::field(Operation::Encrypt, context, &name, Outcome::from(&e), latency)
                            .with_error(&e),
                    );
                    failures.insert(name, e);
                }
            }
        }

        for name in pending {
            self.audit.record(
                AuditEvent::field(Operation::Encrypt, context, &name, Outcome::Failed, Duration::ZERO)
                    .with_detail("encryption task did not complete"),
            );
            failures.insert(
                name,
                FieldError::KeyUnavailable("encryption task did not complete".into()),
            );
        }

        WriteOutcome {
            record,
            failures,
            warnings,
        }
    }
}

async fn encrypt_with_retry(
    cipher: &FieldCipher,
    plaintext: &str,
    level: SensitivityLevel,
    context: &EncryptionContext,
    retry: RetryPolicy,
) -> Result<EncryptedValue, FieldError> {
    let mut attempt = 1;
    loop {
        match cipher.encrypt(plaintext, level, context).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                let delay = retry.backoff(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying field encryption");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::dek::{KeyProvider, KmsKeyIds};
    use crate::kms::{GeneratedDataKey, KmsError, LocalKms, MockKeyManagementService};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use zeroize::Zeroizing;

    fn ctx() -> EncryptionContext {
        EncryptionContext::new("User", "42", "svc-a").unwrap()
    }

    fn vault(kms: Arc<dyn crate::kms::KeyManagementService>) -> (FieldVault, Arc<MemoryAuditSink>) {
        let audit = Arc::new(MemoryAuditSink::new());
        let keys = Arc::new(KeyProvider::new(kms, KmsKeyIds::new("master")));
        let vault = FieldVault::new(
            Arc::new(SensitivityRegistry::with_defaults()),
            Arc::new(FieldCipher::new(keys)),
            audit.clone(),
        );
        (vault, audit)
    }

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let p = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(350));
        assert_eq!(p.backoff(64), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn public_fields_stay_plain() {
        let (vault, audit) = vault(Arc::new(LocalKms::with_key("master")));
        let out = vault
            .protect(&ctx(), fields(&[("display_name", "Alice"), ("ssn", "123-45-6789")]))
            .await;
        assert!(out.is_complete());
        assert_eq!(
            out.record.fields.get("display_name"),
            Some(&StoredField::Plain("Alice".into()))
        );
        assert!(out.record.encrypted("ssn").is_some());
        // Only the encrypted field is audited.
        assert_eq!(audit.len(), 1);
    }

    #[tokio::test]
    async fn unmapped_fields_are_encrypted_with_warning() {
        let (vault, _) = vault(Arc::new(LocalKms::with_key("master")));
        let out = vault.protect(&ctx(), fields(&[("nickname", "Al")])).await;
        assert!(out.record.encrypted("nickname").is_some());
        assert_eq!(out.warnings.len(), 1);
        assert!(matches!(
            &out.warnings[0],
            FieldError::MisconfiguredField { applied: SensitivityLevel::Internal, .. }
        ));
    }

    #[tokio::test]
    async fn failures_are_isolated_per_field() {
        let kms = Arc::new(LocalKms::with_key("master"));
        kms.set_available(false);
        let (vault, audit) = vault(kms);
        let vault = vault.with_retry(RetryPolicy::none());
        let out = vault
            .protect(&ctx(), fields(&[("display_name", "Alice"), ("ssn", "123-45-6789")]))
            .await;
        assert!(!out.is_complete());
        assert!(out.failures["ssn"].is_retryable());
        assert!(out.record.fields.contains_key("display_name"));
        assert!(!out.record.fields.contains_key("ssn"));
        assert_eq!(audit.events()[0].outcome, Outcome::KeyUnavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_kms_failure_is_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut kms = MockKeyManagementService::new();
        kms.expect_generate_data_key().returning(move |key_id, _| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(KmsError::Throttled("rate exceeded".into()));
            }
            Ok(GeneratedDataKey {
                plaintext: Zeroizing::new(vec![9u8; 32]),
                wrapped: Bytes::from_static(b"wrapped"),
                kms_key_id: key_id.to_owned(),
            })
        });
        let (vault, _) = vault(Arc::new(kms));

        let out = vault.protect(&ctx(), fields(&[("ssn", "123-45-6789")])).await;
        assert!(out.is_complete());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn integrity_errors_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut kms = MockKeyManagementService::new();
        kms.expect_generate_data_key().returning(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            Err(KmsError::InvalidCiphertext("bad".into()))
        });
        let (vault, _) = vault(Arc::new(kms));
        let out = vault.protect(&ctx(), fields(&[("ssn", "x")])).await;
        assert!(matches!(out.failures["ssn"], FieldError::IntegrityViolation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
