//! Record-level request and result types exchanged with the surrounding
//! service layer.
//!
//! These types are serialised as JSON by whatever transport hosts the core;
//! the core itself ships no transport.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::envelope::EncryptedValue;

// ---------------------------------------------------------------------------
// Write path
// ---------------------------------------------------------------------------

/// A single stored field: plaintext for `Public` fields, otherwise encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StoredField {
    Plain(String),
    Encrypted(EncryptedValue),
}

/// The persisted form of one record's fields after the write pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedRecord {
    pub record_type: String,
    pub entity_id: String,
    pub fields: BTreeMap<String, StoredField>,
}

impl ProtectedRecord {
    pub fn new(record_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            entity_id: entity_id.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Returns the encrypted value stored under `field`, if any.
    pub fn encrypted(&self, field: &str) -> Option<&EncryptedValue> {
        match self.fields.get(field) {
            Some(StoredField::Encrypted(v)) => Some(v),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Read path
// ---------------------------------------------------------------------------

/// Per-field status flag returned alongside every field of a read.
///
/// A field that could not be revealed is never replaced by an empty value;
/// it stays sealed and carries one of the failure statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldStatus {
    /// Public field stored in plaintext.
    Plain,
    /// Encrypted field returned as ciphertext (raw read).
    Sealed,
    /// Encrypted field decrypted for an authorised caller.
    Revealed,
    /// Outside the assertion's scope or privilege.
    Denied,
    /// The data key could not be obtained.
    KeyUnavailable,
    /// Authentication failed; the stored value is corrupt or misplaced.
    IntegrityViolation,
    /// No sensitivity policy was registered for the field.
    Misconfigured,
    /// The decrypt stopped before reporting a result.
    Failed,
}

/// Which path the decrypt gate took for a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    RawRequested,
    AuthenticatedRevealRequested,
}

/// One field of a record read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldView {
    pub status: FieldStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sealed: Option<EncryptedValue>,
}

impl FieldView {
    pub fn plain(value: impl Into<String>) -> Self {
        Self {
            status: FieldStatus::Plain,
            value: Some(value.into()),
            sealed: None,
        }
    }

    pub fn sealed(value: EncryptedValue) -> Self {
        Self::withheld(FieldStatus::Sealed, value)
    }

    pub fn revealed(value: String) -> Self {
        Self {
            status: FieldStatus::Revealed,
            value: Some(value),
            sealed: None,
        }
    }

    /// A field left in ciphertext form with a non-success status.
    pub fn withheld(status: FieldStatus, value: EncryptedValue) -> Self {
        Self {
            status,
            value: None,
            sealed: Some(value),
        }
    }
}

/// The result of a gated read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordView {
    pub record_type: String,
    pub entity_id: String,
    pub state: GateState,
    pub fields: BTreeMap<String, FieldView>,
}

impl RecordView {
    pub fn field(&self, name: &str) -> Option<&FieldView> {
        self.fields.get(name)
    }
}
