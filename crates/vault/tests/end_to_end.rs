//! Write-then-read flows through the public API with the in-process KMS.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fieldvault::audit::{MemoryAuditSink, NoopAuditSink, Operation, Outcome};
use fieldvault::common::protocol::{FieldStatus, GateState};
use fieldvault::common::{EncryptionContext, FieldError, Privilege, SensitivityLevel};
use fieldvault::crypto::FieldCipher;
use fieldvault::dek::{KeyCache, KeyProvider, KeyRotator, KmsKeyIds};
use fieldvault::gate::{AccessClaims, HmacAssertionVerifier, ReadRequest};
use fieldvault::kms::LocalKms;
use fieldvault::registry::SensitivityRegistry;
use fieldvault::FieldVault;

struct Harness {
    kms: Arc<LocalKms>,
    keys: Arc<KeyProvider>,
    vault: FieldVault,
    verifier: Arc<HmacAssertionVerifier>,
    audit: Arc<MemoryAuditSink>,
}

fn harness() -> Harness {
    let kms = Arc::new(LocalKms::with_key("master"));
    let keys = Arc::new(KeyProvider::new(kms.clone(), KmsKeyIds::new("master")));
    let audit = Arc::new(MemoryAuditSink::new());
    let vault = FieldVault::new(
        Arc::new(SensitivityRegistry::with_defaults()),
        Arc::new(FieldCipher::new(keys.clone())),
        audit.clone(),
    );
    let verifier = Arc::new(HmacAssertionVerifier::new(vec![0x5Au8; 32]).unwrap());
    Harness {
        kms,
        keys,
        vault,
        verifier,
        audit,
    }
}

fn ctx(entity_id: &str) -> EncryptionContext {
    EncryptionContext::new("User", entity_id, "svc-a").unwrap()
}

fn claims_for(entity_id: &str) -> AccessClaims {
    AccessClaims {
        subject: "svc-a".into(),
        entity_type: "User".into(),
        entity_id: entity_id.into(),
        fields: None,
        privilege: Privilege::Privileged,
        expires_at: AccessClaims::expiry_in(Duration::from_secs(300)),
    }
}

fn one_field(name: &str, value: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(name.to_owned(), value.to_owned())])
}

#[tokio::test]
async fn date_of_birth_scenario() {
    let h = harness();
    let written = h
        .vault
        .protect(&ctx("42"), one_field("date_of_birth", "1990-01-01"))
        .await;
    assert!(written.is_complete());
    let record = written.record;
    let stored = record.encrypted("date_of_birth").unwrap().clone();
    let blob_before = stored.to_blob().unwrap();
    let gate = h.vault.gate(h.verifier.clone());

    // Raw read: the untouched blob.
    let raw = gate.read(&record, &ReadRequest::raw("svc-a")).await.unwrap();
    assert_eq!(raw.state, GateState::RawRequested);
    let field = raw.field("date_of_birth").unwrap();
    assert_eq!(field.status, FieldStatus::Sealed);
    assert_eq!(field.sealed.as_ref().unwrap().to_blob().unwrap(), blob_before);

    // Reveal with an assertion for entity 42.
    let assertion = h.verifier.issue(&claims_for("42")).unwrap();
    let revealed = gate
        .read(&record, &ReadRequest::reveal("svc-a", assertion))
        .await
        .unwrap();
    assert_eq!(revealed.state, GateState::AuthenticatedRevealRequested);
    assert_eq!(
        revealed.field("date_of_birth").unwrap().value.as_deref(),
        Some("1990-01-01")
    );

    // Reveal with an assertion for entity 99.
    let unwraps_before = h.kms.unwrap_calls();
    let decrypts_before = h
        .audit
        .events()
        .iter()
        .filter(|e| e.operation == Operation::Decrypt)
        .count();
    let wrong = h.verifier.issue(&claims_for("99")).unwrap();
    let err = gate
        .read(&record, &ReadRequest::reveal("svc-a", wrong))
        .await
        .unwrap_err();
    assert!(matches!(err, FieldError::AuthorizationDenied(_)));

    assert_eq!(record.encrypted("date_of_birth").unwrap().to_blob().unwrap(), blob_before);
    assert_eq!(h.kms.unwrap_calls(), unwraps_before);
    let events = h.audit.events();
    assert_eq!(
        events.iter().filter(|e| e.operation == Operation::Decrypt).count(),
        decrypts_before
    );
    let denial = events.last().unwrap();
    assert_eq!(denial.operation, Operation::Authorize);
    assert_eq!(denial.outcome, Outcome::Denied);
}

#[tokio::test]
async fn stored_blob_survives_persistence_and_cache_loss() {
    let h = harness();
    let written = h
        .vault
        .protect(&ctx("42"), one_field("ssn", "123-45-6789"))
        .await;
    let blob = written.record.encrypted("ssn").unwrap().to_blob().unwrap();
    assert!(blob.contains("\"algorithm\":\"AES-256-GCM\""));

    // Simulate a restart of the cache: the wrapped key alone must suffice.
    h.keys.cache().clear().await;
    let parsed = fieldvault::common::EncryptedValue::from_blob(&blob).unwrap();
    let plaintext = h.vault.cipher().decrypt(&parsed, &ctx("42")).await.unwrap();
    assert_eq!(plaintext, "123-45-6789");
    assert_eq!(h.kms.unwrap_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_first_requests_share_one_kms_call() {
    let kms = Arc::new(LocalKms::with_key("master").with_latency(Duration::from_millis(100)));
    let keys = Arc::new(KeyProvider::new(kms.clone(), KmsKeyIds::new("master")));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let keys = keys.clone();
        handles.push(tokio::spawn(async move {
            keys.get_or_create_data_key(SensitivityLevel::Critical, &ctx("42"))
                .await
                .map(|k| k.key_id().to_owned())
        }));
    }
    let mut ids = Vec::new();
    for h in handles {
        ids.push(h.await.unwrap().unwrap());
    }

    assert_eq!(kms.generate_calls(), 1);
    assert!(ids.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test(start_paused = true)]
async fn different_slots_do_not_wait_on_each_other() {
    let kms = Arc::new(LocalKms::with_key("master").with_latency(Duration::from_millis(100)));
    let keys = Arc::new(KeyProvider::new(kms.clone(), KmsKeyIds::new("master")));

    let started = tokio::time::Instant::now();
    let mut handles = Vec::new();
    for i in 0..10 {
        let keys = keys.clone();
        handles.push(tokio::spawn(async move {
            keys.get_or_create_data_key(SensitivityLevel::Critical, &ctx(&i.to_string()))
                .await
                .map(|_| ())
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    assert_eq!(kms.generate_calls(), 10);
    assert!(started.elapsed() < Duration::from_millis(200));
}

#[tokio::test]
async fn rotation_keeps_old_ciphertext_readable() {
    let h = harness();
    let rotator = KeyRotator::new(h.keys.clone(), h.audit.clone());

    let old = h
        .vault
        .protect(&ctx("42"), one_field("address", "12 Main St"))
        .await
        .record;
    let result = rotator.rotate(SensitivityLevel::Sensitive).await.unwrap();
    assert_eq!(result.invalidated_keys, 1);
    assert_eq!(h.kms.key_versions("master"), 2);

    let new = h
        .vault
        .protect(&ctx("42"), one_field("address", "34 Side St"))
        .await
        .record;
    let old_value = old.encrypted("address").unwrap();
    let new_value = new.encrypted("address").unwrap();
    assert_ne!(old_value.key_id(), new_value.key_id());
    assert_ne!(old_value.wrapped_key(), new_value.wrapped_key());

    let cipher = h.vault.cipher();
    assert_eq!(cipher.decrypt(old_value, &ctx("42")).await.unwrap(), "12 Main St");
    assert_eq!(cipher.decrypt(new_value, &ctx("42")).await.unwrap(), "34 Side St");
}

#[tokio::test(start_paused = true)]
async fn idle_keys_expire_and_are_regenerated() {
    let kms = Arc::new(LocalKms::with_key("master"));
    let cache = KeyCache::new(Duration::from_secs(60));
    let keys = KeyProvider::new(kms.clone(), KmsKeyIds::new("master")).with_cache(cache.clone());

    let first = keys
        .get_or_create_data_key(SensitivityLevel::Internal, &ctx("42"))
        .await
        .unwrap();
    let weak = Arc::downgrade(&first);
    let first_id = first.key_id().to_owned();
    drop(first);

    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(cache.evict_expired(), 1);
    assert!(weak.upgrade().is_none());

    let second = keys
        .get_or_create_data_key(SensitivityLevel::Internal, &ctx("42"))
        .await
        .unwrap();
    assert_ne!(second.key_id(), first_id);
    assert_eq!(kms.generate_calls(), 2);
}

#[tokio::test]
async fn yaml_registry_drives_classification() {
    let (registry, warnings) = SensitivityRegistry::from_yaml_str(
        "records:\n  Patient:\n    mrn: critical\n    ward: public\n    notes: ~\n",
    )
    .unwrap();
    assert_eq!(warnings.len(), 1);

    let kms = Arc::new(LocalKms::with_key("master"));
    let keys = Arc::new(KeyProvider::new(kms, KmsKeyIds::new("master")));
    let vault = FieldVault::new(
        Arc::new(registry),
        Arc::new(FieldCipher::new(keys)),
        Arc::new(NoopAuditSink),
    );
    let context = EncryptionContext::new("Patient", "7", "svc-a").unwrap();
    let out = vault
        .protect(
            &context,
            BTreeMap::from([
                ("mrn".to_owned(), "MRN-1".to_owned()),
                ("ward".to_owned(), "B".to_owned()),
                ("notes".to_owned(), "stable".to_owned()),
            ]),
        )
        .await;

    assert!(out.record.encrypted("mrn").is_some());
    assert!(out.record.encrypted("notes").is_some());
    assert!(out.record.encrypted("ward").is_none());
    // `notes` has no level, so the write reports it too.
    assert_eq!(out.warnings.len(), 1);
}
