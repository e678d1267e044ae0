//! [`DecryptGate`]: the only path from a stored record to plaintext.
//!
//! Each read is decided once, up front:
//!
//! - **Raw** (no reveal requested): every encrypted field is returned as its
//!   [`EncryptedValue`] with status `Sealed`. No cryptographic work happens.
//! - **Reveal**: the caller's [`AccessAssertion`] is verified *before* any
//!   key is touched. A missing or invalid assertion, or one issued for another
//!   entity or caller, fails the whole read with
//!   [`FieldError::AuthorizationDenied`] and a critical audit event. Otherwise
//!   each field inside the assertion's scope and privilege is decrypted;
//!   fields outside it stay sealed with status `Denied`.
//!
//! A field that fails to decrypt stays sealed and carries its failure status.
//! It is never replaced by an empty value.

pub mod assertion;

pub use assertion::{
    AccessAssertion, AccessClaims, AccessVerifier, AssertionError, HmacAssertionVerifier,
};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::protocol::{FieldStatus, FieldView, GateState, ProtectedRecord, RecordView, StoredField};
use common::{EncryptedValue, EncryptionContext, FieldError, Severity};
use tokio::task::JoinSet;
use tracing::{error, instrument, warn};

use crate::audit::{AuditEvent, AuditSink, Operation, Outcome};
use crate::registry::SensitivityRegistry;

/// Decrypts a single stored value. Implemented by [`crate::crypto::FieldCipher`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FieldDecryptor: Send + Sync {
    async fn decrypt(
        &self,
        value: &EncryptedValue,
        context: &EncryptionContext,
    ) -> Result<String, FieldError>;
}

/// One read of a [`ProtectedRecord`].
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub caller_id: String,
    pub reveal: bool,
    pub assertion: Option<AccessAssertion>,
}

impl ReadRequest {
    /// A read that returns ciphertext only.
    pub fn raw(caller_id: impl Into<String>) -> Self {
        Self {
            caller_id: caller_id.into(),
            reveal: false,
            assertion: None,
        }
    }

    /// A read that asks for plaintext, backed by `assertion`.
    pub fn reveal(caller_id: impl Into<String>, assertion: AccessAssertion) -> Self {
        Self {
            caller_id: caller_id.into(),
            reveal: true,
            assertion: Some(assertion),
        }
    }
}

pub struct DecryptGate {
    decryptor: Arc<dyn FieldDecryptor>,
    verifier: Arc<dyn AccessVerifier>,
    registry: Arc<SensitivityRegistry>,
    audit: Arc<dyn AuditSink>,
}

impl DecryptGate {
    pub fn new(
        decryptor: Arc<dyn FieldDecryptor>,
        verifier: Arc<dyn AccessVerifier>,
        registry: Arc<SensitivityRegistry>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            decryptor,
            verifier,
            registry,
            audit,
        }
    }

    /// Read `record` on behalf of `request.caller_id`.
    ///
    /// # Errors
    ///
    /// [`FieldError::AuthorizationDenied`] if a reveal was requested without a
    /// valid matching assertion. Per-field failures are reported through
    /// [`FieldView::status`], not as errors.
    #[instrument(skip_all, fields(record_type = %record.record_type, reveal = request.reveal))]
    pub async fn read(
        &self,
        record: &ProtectedRecord,
        request: &ReadRequest,
    ) -> Result<RecordView, FieldError> {
        if !request.reveal {
            return Ok(raw_view(record));
        }

        let started = Instant::now();
        let context = match EncryptionContext::new(
            record.record_type.as_str(),
            record.entity_id.as_str(),
            request.caller_id.as_str(),
        ) {
            Ok(context) => context,
            Err(e) => {
                let e = FieldError::AuthorizationDenied(format!("invalid read context: {e}"));
                warn!(error = %e, "reveal denied");
                self.audit.record(
                    AuditEvent::for_request(
                        Operation::Authorize,
                        &record.record_type,
                        &record.entity_id,
                        &request.caller_id,
                        Outcome::Denied,
                        started.elapsed(),
                    )
                    .with_error(&e),
                );
                return Err(e);
            }
        };

        let claims = match self.authorize(&context, request).await {
            Ok(claims) => claims,
            Err(e) => {
                warn!(error = %e, "reveal denied");
                self.audit.record(
                    AuditEvent::for_context(Operation::Authorize, &context, Outcome::Denied, started.elapsed())
                        .with_error(&e),
                );
                return Err(e);
            }
        };

        let fields = self.reveal_fields(record, &context, &claims).await;
        Ok(RecordView {
            record_type: record.record_type.clone(),
            entity_id: record.entity_id.clone(),
            state: GateState::AuthenticatedRevealRequested,
            fields,
        })
    }

    async fn authorize(
        &self,
        context: &EncryptionContext,
        request: &ReadRequest,
    ) -> Result<AccessClaims, FieldError> {
        let assertion = request
            .assertion
            .as_ref()
            .ok_or_else(|| FieldError::AuthorizationDenied("no access assertion presented".into()))?;
        let claims = self
            .verifier
            .verify(assertion)
            .await
            .map_err(|e| FieldError::AuthorizationDenied(e.to_string()))?;

        if claims.entity_type != context.entity_type() || claims.entity_id != context.entity_id() {
            return Err(FieldError::AuthorizationDenied(
                "assertion was issued for another entity".into(),
            ));
        }
        if claims.subject != context.caller_id() {
            return Err(FieldError::AuthorizationDenied(
                "assertion was issued to another caller".into(),
            ));
        }
        Ok(claims)
    }

    async fn reveal_fields(
        &self,
        record: &ProtectedRecord,
        context: &EncryptionContext,
        claims: &AccessClaims,
    ) -> BTreeMap<String, FieldView> {
        let mut views = BTreeMap::new();
        let mut pending = BTreeSet::new();
        let mut tasks = JoinSet::new();

        for (name, stored) in &record.fields {
            let value = match stored {
                StoredField::Plain(v) => {
                    views.insert(name.clone(), FieldView::plain(v.clone()));
                    continue;
                }
                StoredField::Encrypted(v) => v,
            };

            let level = self.registry.classify(&record.record_type, name);
            if !claims.covers(name) || !claims.privilege.permits(level) {
                views.insert(name.clone(), FieldView::withheld(FieldStatus::Denied, value.clone()));
                self.audit.record(AuditEvent {
                    severity: Severity::Warning,
                    ..AuditEvent::field(Operation::Decrypt, context, name, Outcome::Denied, Duration::ZERO)
                        .with_detail(format!("outside assertion scope or below {level} privilege"))
                });
                continue;
            }

            pending.insert(name.clone());
            let decryptor = self.decryptor.clone();
            let context = context.clone();
            let name = name.clone();
            let value = value.clone();
            tasks.spawn(async move {
                let started = Instant::now();
                let result = decryptor.decrypt(&value, &context).await;
                (name, value, result, started.elapsed())
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (name, value, result, latency) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "field decrypt task failed");
                    continue;
                }
            };
            pending.remove(&name);
            let view = match result {
                Ok(plaintext) => {
                    self.audit.record(AuditEvent::field(
                        Operation::Decrypt,
                        context,
                        &name,
                        Outcome::Success,
                        latency,
                    ));
                    FieldView::revealed(plaintext)
                }
                Err(e) => {
                    warn!(field = %name, error = %e, "field decrypt failed");
                    self.audit.record(
                        AuditEvent::field(Operation::Decrypt, context, &name, Outcome::from(&e), latency)
                            .with_error(&e),
                    );
                    FieldView::withheld(e.status(), value)
                }
            };
            views.insert(name, view);
        }

        // A task that died without reporting leaves its field sealed.
        for name in pending {
            if let Some(value) = record.encrypted(&name) {
                self.audit.record(
                    AuditEvent::field(Operation::Decrypt, context, &name, Outcome::Failed, Duration::ZERO)
                        .with_detail("decrypt task did not complete"),
                );
                views.insert(name, FieldView::withheld(FieldStatus::Failed, value.clone()));
            }
        }
        views
    }
}

fn raw_view(record: &ProtectedRecord) -> RecordView {
    let fields = record
        .fields
        .iter()
        .map(|(name, stored)| {
            let view = match stored {
                StoredField::Plain(v) => FieldView::plain(v.clone()),
                StoredField::Encrypted(v) => FieldView::sealed(v.clone()),
            };
            (name.clone(), view)
        })
        .collect();
    RecordView {
        record_type: record.record_type.clone(),
        entity_id: record.entity_id.clone(),
        state: GateState::RawRequested,
        fields,
    }
}
