//! Audit events for every field encrypt, decrypt attempt, gate decision and
//! key rotation.
//!
//! # Audit invariants
//!
//! - Events carry identifiers only: record type, entity id, field name,
//!   caller id. Never plaintext values or key material.
//! - [`AuditSink::record`] is synchronous and must not block; sinks that do
//!   I/O hand events off to a background task (see [`ChannelAuditSink`]).
//! - Metric labels never include entity or caller ids.

pub mod sinks;

pub use sinks::{
    forward_task, ChannelAuditSink, FanoutAuditSink, MemoryAuditSink, MetricsAuditSink,
    TracingAuditSink,
};

use std::time::{Duration, SystemTime};

use common::{EncryptionContext, FieldError, SensitivityLevel, Severity};

/// What was being done when the event was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Encrypt,
    Decrypt,
    /// The gate's check of a reveal request's access assertion.
    Authorize,
    Rotate,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Encrypt => "encrypt",
            Operation::Decrypt => "decrypt",
            Operation::Authorize => "authorize",
            Operation::Rotate => "rotate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    Denied,
    KeyUnavailable,
    IntegrityViolation,
    Misconfigured,
    Failed,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Denied => "denied",
            Outcome::KeyUnavailable => "key_unavailable",
            Outcome::IntegrityViolation => "integrity_violation",
            Outcome::Misconfigured => "misconfigured",
            Outcome::Failed => "failed",
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            Outcome::Success => Severity::Info,
            Outcome::Denied | Outcome::IntegrityViolation => Severity::Critical,
            Outcome::KeyUnavailable | Outcome::Misconfigured | Outcome::Failed => {
                Severity::Warning
            }
        }
    }
}

impl From<&FieldError> for Outcome {
    fn from(e: &FieldError) -> Self {
        match e {
            FieldError::KeyUnavailable(_) => Outcome::KeyUnavailable,
            FieldError::IntegrityViolation(_) => Outcome::IntegrityViolation,
            FieldError::AuthorizationDenied(_) => Outcome::Denied,
            FieldError::MisconfiguredField { .. } => Outcome::Misconfigured,
        }
    }
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub operation: Operation,
    pub outcome: Outcome,
    pub severity: Severity,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub caller_id: Option<String>,
    pub field_name: Option<String>,
    /// Rotation scope, for [`Operation::Rotate`].
    pub scope: Option<SensitivityLevel>,
    pub latency: Duration,
    pub timestamp: SystemTime,
    /// Short non-sensitive reason for a failure.
    pub detail: Option<String>,
}

impl AuditEvent {
    fn base(operation: Operation, outcome: Outcome, latency: Duration) -> Self {
        Self {
            operation,
            outcome,
            severity: outcome.severity(),
            entity_type: None,
            entity_id: None,
            caller_id: None,
            field_name: None,
            scope: None,
            latency,
            timestamp: SystemTime::now(),
            detail: None,
        }
    }

    /// A per-field encrypt or decrypt event.
    pub fn field(
        operation: Operation,
        context: &EncryptionContext,
        field_name: &str,
        outcome: Outcome,
        latency: Duration,
    ) -> Self {
        Self {
            field_name: Some(field_name.to_owned()),
            ..Self::for_context(operation, context, outcome, latency)
        }
    }

    /// A record-level event, such as a gate decision.
    pub fn for_context(
        operation: Operation,
        context: &EncryptionContext,
        outcome: Outcome,
        latency: Duration,
    ) -> Self {
        Self::for_request(
            operation,
            context.entity_type(),
            context.entity_id(),
            context.caller_id(),
            outcome,
            latency,
        )
    }

    /// A record-level event from raw identifiers, for requests whose
    /// context could not be built.
    pub fn for_request(
        operation: Operation,
        entity_type: &str,
        entity_id: &str,
        caller_id: &str,
        outcome: Outcome,
        latency: Duration,
    ) -> Self {
        Self {
            entity_type: Some(entity_type.to_owned()),
            entity_id: Some(entity_id.to_owned()),
            caller_id: Some(caller_id.to_owned()),
            ..Self::base(operation, outcome, latency)
        }
    }

    pub fn rotation(scope: SensitivityLevel, outcome: Outcome, latency: Duration) -> Self {
        Self {
            scope: Some(scope),
            ..Self::base(Operation::Rotate, outcome, latency)
        }
    }

    /// Attach a failure reason; an error's own severity replaces the
    /// outcome-derived one.
    pub fn with_error(mut self, error: &FieldError) -> Self {
        self.severity = error.severity();
        self.detail = Some(error.to_string());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Destination for audit events.
#[cfg_attr(test, mockall::automock)]
pub trait AuditSink: Send + Sync {
    /// Record one event. Must return promptly.
    fn record(&self, event: AuditEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn record(&self, _event: AuditEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> EncryptionContext {
        EncryptionContext::new("User", "42", "svc-a").unwrap()
    }

    #[test]
    fn field_event_carries_identifiers() {
        let e = AuditEvent::field(
            Operation::Decrypt,
            &ctx(),
            "ssn",
            Outcome::Success,
            Duration::from_millis(3),
        );
        assert_eq!(e.entity_type.as_deref(), Some("User"));
        assert_eq!(e.entity_id.as_deref(), Some("42"));
        assert_eq!(e.caller_id.as_deref(), Some("svc-a"));
        assert_eq!(e.field_name.as_deref(), Some("ssn"));
        assert_eq!(e.severity, Severity::Info);
    }

    #[test]
    fn security_outcomes_are_critical() {
        assert_eq!(Outcome::Denied.severity(), Severity::Critical);
        assert_eq!(Outcome::IntegrityViolation.severity(), Severity::Critical);
        assert_eq!(Outcome::KeyUnavailable.severity(), Severity::Warning);
    }

    #[test]
    fn outcome_from_field_error() {
        let e = FieldError::IntegrityViolation("tag".into());
        assert_eq!(Outcome::from(&e), Outcome::IntegrityViolation);
        let e = FieldError::AuthorizationDenied("expired".into());
        assert_eq!(Outcome::from(&e), Outcome::Denied);
    }

    #[test]
    fn rotation_event_has_no_entity() {
        let e = AuditEvent::rotation(SensitivityLevel::Critical, Outcome::Success, Duration::ZERO);
        assert_eq!(e.operation, Operation::Rotate);
        assert_eq!(e.scope, Some(SensitivityLevel::Critical));
        assert!(e.entity_id.is_none());
    }
}
