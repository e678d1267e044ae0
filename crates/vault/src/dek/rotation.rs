//! [`KeyRotator`]: scheduled and on-demand rotation of the KMS keys behind
//! each sensitivity level.
//!
//! Rotation never re-encrypts stored data. The KMS keeps prior key versions
//! for unwrap, so every existing ciphertext stays readable; dropping the
//! scope's cached data keys makes new writes use the new key material.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use arc_swap::ArcSwap;
use common::SensitivityLevel;
use thiserror::Error;
use tracing::{info, warn};

use super::provider::KeyProvider;
use crate::audit::{AuditEvent, AuditSink, Outcome};
use crate::kms::KmsError;

#[derive(Debug, Error)]
pub enum RotationError {
    /// Public values are never encrypted, so there is nothing to rotate.
    #[error("{0} values are not encrypted and have no key to rotate")]
    NotEncrypted(SensitivityLevel),

    #[error(transparent)]
    Kms(#[from] KmsError),
}

/// Outcome of one successful rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationResult {
    pub scope: SensitivityLevel,
    pub kms_key_id: String,
    /// Cached data keys dropped across every level served by the KMS key.
    pub invalidated_keys: usize,
    pub rotated_at: SystemTime,
}

/// Rotates KMS keys and tracks when each one was last rotated.
pub struct KeyRotator {
    keys: Arc<KeyProvider>,
    audit: Arc<dyn AuditSink>,
    /// KMS key id to the time its current material became active.
    last_rotated: ArcSwap<HashMap<String, SystemTime>>,
}

impl KeyRotator {
    pub fn new(keys: Arc<KeyProvider>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            keys,
            audit,
            last_rotated: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Seed rotation times from the KMS so schedules survive restarts.
    /// Keys that cannot be described are skipped with a warning and are not
    /// considered due until rotated once.
    pub async fn load_baseline(&self) {
        let mut seen = Vec::new();
        for level in SensitivityLevel::ENCRYPTED {
            let kms_key_id = self.keys.key_ids().for_level(level).to_owned();
            if seen.contains(&kms_key_id) {
                continue;
            }
            match self.keys.describe_kms_key(&kms_key_id).await {
                Ok(meta) => {
                    if let Some(since) = meta.active_since() {
                        self.set_rotated(&kms_key_id, since);
                    }
                    info!(kms_key_id = %kms_key_id, enabled = meta.enabled, "loaded key rotation baseline");
                }
                Err(e) => {
                    warn!(kms_key_id = %kms_key_id, error = %e, "could not describe KMS key; rotation baseline unknown");
                }
            }
            seen.push(kms_key_id);
        }
    }

    /// When the KMS key serving `level` last got new material, if known.
    pub fn last_rotated(&self, level: SensitivityLevel) -> Option<SystemTime> {
        self.last_rotated
            .load()
            .get(self.keys.key_ids().for_level(level))
            .copied()
    }

    /// Levels whose KMS key has outlived the level's rotation interval.
    ///
    /// Levels sharing a KMS key are reported once, under the most sensitive
    /// of them, since rotating it rotates them all.
    pub fn due_scopes(&self, now: SystemTime) -> Vec<SensitivityLevel> {
        let mut claimed = Vec::new();
        let mut due = Vec::new();
        for level in SensitivityLevel::ENCRYPTED.into_iter().rev() {
            let kms_key_id = self.keys.key_ids().for_level(level);
            if claimed.contains(&kms_key_id) {
                continue;
            }
            let (Some(interval), Some(since)) = (level.rotation_interval(), self.last_rotated(level))
            else {
                continue;
            };
            if now.duration_since(since).is_ok_and(|age| age >= interval) {
                claimed.push(kms_key_id);
                due.push(level);
            }
        }
        due
    }

    /// Rotate the KMS key serving `scope` and drop the cached data keys of
    /// every level that shares it.
    ///
    /// # Errors
    ///
    /// [`RotationError::NotEncrypted`] for `Public`, otherwise the KMS failure.
    /// On failure the cache is left untouched.
    pub async fn rotate(&self, scope: SensitivityLevel) -> Result<RotationResult, RotationError> {
        if !scope.requires_encryption() {
            return Err(RotationError::NotEncrypted(scope));
        }
        let started = Instant::now();
        let kms_key_id = self.keys.key_ids().for_level(scope).to_owned();

        if let Err(e) = self.keys.rotate_kms_key(&kms_key_id).await {
            self.audit.record(
                AuditEvent::rotation(scope, Outcome::Failed, started.elapsed())
                    .with_detail(e.to_string()),
            );
            return Err(e.into());
        }

        let mut invalidated_keys = 0;
        for level in self.keys.key_ids().levels_using(&kms_key_id) {
            invalidated_keys += self.keys.cache().invalidate_level(level).await;
        }
        let rotated_at = SystemTime::now();
        self.set_rotated(&kms_key_id, rotated_at);

        info!(scope = %scope, kms_key_id = %kms_key_id, invalidated_keys, "rotated KMS key");
        self.audit
            .record(AuditEvent::rotation(scope, Outcome::Success, started.elapsed()));

        Ok(RotationResult {
            scope,
            kms_key_id,
            invalidated_keys,
            rotated_at,
        })
    }

    fn set_rotated(&self, kms_key_id: &str, at: SystemTime) {
        self.last_rotated.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(kms_key_id.to_owned(), at);
            next
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{MemoryAuditSink, Operation};
    use crate::dek::provider::KmsKeyIds;
    use crate::kms::{KeyMetadata, LocalKms, MockKeyManagementService};
    use common::EncryptionContext;
    use std::time::Duration;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn ctx() -> EncryptionContext {
        EncryptionContext::new("User", "42", "svc-a").unwrap()
    }

    fn rotator(kms: Arc<dyn crate::kms::KeyManagementService>, ids: KmsKeyIds) -> (KeyRotator, Arc<MemoryAuditSink>) {
        let audit = Arc::new(MemoryAuditSink::new());
        let keys = Arc::new(KeyProvider::new(kms, ids));
        (KeyRotator::new(keys, audit.clone()), audit)
    }

    #[tokio::test]
    async fn rotate_invalidates_and_audits() {
        let kms = Arc::new(LocalKms::with_key("master"));
        let (rotator, audit) = rotator(kms.clone(), KmsKeyIds::new("master"));
        let before = rotator
            .keys
            .get_or_create_data_key(SensitivityLevel::Critical, &ctx())
            .await
            .unwrap();

        let result = rotator.rotate(SensitivityLevel::Critical).await.unwrap();
        assert_eq!(result.kms_key_id, "master");
        assert_eq!(result.invalidated_keys, 1);
        assert_eq!(kms.key_versions("master"), 2);
        assert!(rotator.last_rotated(SensitivityLevel::Critical).is_some());

        let after = rotator
            .keys
            .get_or_create_data_key(SensitivityLevel::Critical, &ctx())
            .await
            .unwrap();
        assert_ne!(before.key_id(), after.key_id());

        let events = audit.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operation, Operation::Rotate);
        assert_eq!(events[0].outcome, Outcome::Success);
    }

    #[tokio::test]
    async fn public_scope_is_rejected() {
        let kms = Arc::new(LocalKms::with_key("master"));
        let (rotator, _) = rotator(kms, KmsKeyIds::new("master"));
        assert!(matches!(
            rotator.rotate(SensitivityLevel::Public).await,
            Err(RotationError::NotEncrypted(_))
        ));
    }

    #[tokio::test]
    async fn failed_rotation_keeps_cache() {
        let kms = Arc::new(LocalKms::with_key("master"));
        let (rotator, audit) = rotator(kms.clone(), KmsKeyIds::new("master"));
        rotator
            .keys
            .get_or_create_data_key(SensitivityLevel::Internal, &ctx())
            .await
            .unwrap();
        kms.set_available(false);

        assert!(rotator.rotate(SensitivityLevel::Internal).await.is_err());
        assert_eq!(rotator.keys.cache().len(), 1);
        assert_eq!(audit.events()[0].outcome, Outcome::Failed);
    }

    #[tokio::test]
    async fn due_scopes_follow_level_intervals() {
        let created = SystemTime::UNIX_EPOCH + 1000 * DAY;
        let mut kms = MockKeyManagementService::new();
        kms.expect_describe_key().returning(move |key_id| {
            Ok(KeyMetadata {
                key_id: key_id.to_owned(),
                enabled: true,
                created_at: Some(created),
                last_rotated_at: None,
            })
        });
        let ids = KmsKeyIds::new("shared").with_override(SensitivityLevel::Critical, "crit");
        let (rotator, _) = rotator(Arc::new(kms), ids);
        rotator.load_baseline().await;

        assert!(rotator.due_scopes(created + 30 * DAY).is_empty());
        assert_eq!(
            rotator.due_scopes(created + 91 * DAY),
            vec![SensitivityLevel::Critical]
        );
        // Internal and Sensitive share a key; Sensitive's interval governs.
        assert_eq!(
            rotator.due_scopes(created + 181 * DAY),
            vec![SensitivityLevel::Critical, SensitivityLevel::Sensitive]
        );
    }

    #[tokio::test]
    async fn unknown_baseline_is_never_due() {
        let mut kms = MockKeyManagementService::new();
        kms.expect_describe_key()
            .returning(|_| Err(KmsError::AccessDenied("no describe".into())));
        let (rotator, _) = rotator(Arc::new(kms), KmsKeyIds::new("master"));
        rotator.load_baseline().await;
        assert!(rotator.due_scopes(SystemTime::now() + 1000 * DAY).is_empty());
    }
}
