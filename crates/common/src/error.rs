//! Field-level error taxonomy shared across crates.

use thiserror::Error;

use crate::protocol::FieldStatus;
use crate::sensitivity::SensitivityLevel;

/// Error reported for a single field.
///
/// Failures are isolated per field; none of these variants aborts the
/// surrounding record operation.
/// - [`FieldError::KeyUnavailable`] → retryable
/// - [`FieldError::IntegrityViolation`] → security event, never retryable
/// - [`FieldError::AuthorizationDenied`] → no cryptographic work was attempted
/// - [`FieldError::MisconfiguredField`] → warning only
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    /// The KMS was unreachable, throttled, timed out, or denied the call.
    #[error("key unavailable: {0}")]
    KeyUnavailable(String),

    /// Authentication failed on decrypt: wrong key, wrong context, or tampered data.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    /// The decrypt gate rejected the caller's access assertion.
    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    /// The registry has no policy for this field and a default level was applied.
    #[error("misconfigured field {record_type}.{field_name}: no sensitivity policy, defaulted to {applied}")]
    MisconfiguredField {
        record_type: String,
        field_name: String,
        applied: SensitivityLevel,
    },
}

/// Severity attached to audit events and log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl FieldError {
    /// Returns `true` if retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FieldError::KeyUnavailable(_))
    }

    /// Severity used when escalating this error to the audit sink.
    pub fn severity(&self) -> Severity {
        match self {
            FieldError::IntegrityViolation(_) | FieldError::AuthorizationDenied(_) => {
                Severity::Critical
            }
            FieldError::KeyUnavailable(_) | FieldError::MisconfiguredField { .. } => {
                Severity::Warning
            }
        }
    }

    /// The per-field status flag surfaced to callers for this error.
    pub fn status(&self) -> FieldStatus {
        match self {
            FieldError::KeyUnavailable(_) => FieldStatus::KeyUnavailable,
            FieldError::IntegrityViolation(_) => FieldStatus::IntegrityViolation,
            FieldError::AuthorizationDenied(_) => FieldStatus::Denied,
            FieldError::MisconfiguredField { .. } => FieldStatus::Misconfigured,
        }
    }
}
