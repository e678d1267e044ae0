//! [`SensitivityRegistry`]: static mapping from `(record type, field name)` to
//! [`SensitivityLevel`].
//!
//! The registry is data, not code: it is built once at startup (from the
//! built-in defaults or a YAML document, see [`loader`]) and shared read-only.
//! Fields it does not know are encrypted as `Internal`.

pub mod loader;

pub use loader::RegistryError;

use std::collections::{HashMap, HashSet};

use common::{FieldError, SensitivityLevel};

/// Level applied to fields with no registered policy.
pub const DEFAULT_LEVEL: SensitivityLevel = SensitivityLevel::Internal;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SensitivityRegistry {
    records: HashMap<String, HashMap<String, SensitivityLevel>>,
    /// Fields declared by a record without a level.
    unclassified: HashSet<(String, String)>,
}

impl SensitivityRegistry {
    /// An empty registry: every field classifies as [`DEFAULT_LEVEL`].
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in table for the `User` record.
    pub fn with_defaults() -> Self {
        Self::new()
            .with_field("User", "ssn", SensitivityLevel::Critical)
            .with_field("User", "date_of_birth", SensitivityLevel::Critical)
            .with_field("User", "passport_number", SensitivityLevel::Critical)
            .with_field("User", "address", SensitivityLevel::Sensitive)
            .with_field("User", "document_url", SensitivityLevel::Sensitive)
            .with_field("User", "email", SensitivityLevel::Internal)
            .with_field("User", "phone", SensitivityLevel::Internal)
            .with_field("User", "display_name", SensitivityLevel::Public)
    }

    pub fn with_field(
        mut self,
        record_type: impl Into<String>,
        field_name: impl Into<String>,
        level: SensitivityLevel,
    ) -> Self {
        self.insert(record_type.into(), field_name.into(), level);
        self
    }

    pub(crate) fn insert(&mut self, record_type: String, field_name: String, level: SensitivityLevel) {
        self.unclassified
            .remove(&(record_type.clone(), field_name.clone()));
        self.records
            .entry(record_type)
            .or_default()
            .insert(field_name, level);
    }

    pub(crate) fn declare_unclassified(&mut self, record_type: String, field_name: String) {
        self.unclassified.insert((record_type, field_name));
    }

    /// The registered level, if any.
    pub fn lookup(&self, record_type: &str, field_name: &str) -> Option<SensitivityLevel> {
        self.records.get(record_type)?.get(field_name).copied()
    }

    /// The level for a field. Total: unknown fields get [`DEFAULT_LEVEL`].
    pub fn classify(&self, record_type: &str, field_name: &str) -> SensitivityLevel {
        self.lookup(record_type, field_name).unwrap_or(DEFAULT_LEVEL)
    }

    /// Warnings for every field declared without a level.
    pub fn misconfigured(&self) -> Vec<FieldError> {
        let mut fields: Vec<_> = self.unclassified.iter().collect();
        fields.sort();
        fields
            .into_iter()
            .map(|(record_type, field_name)| FieldError::MisconfiguredField {
                record_type: record_type.clone(),
                field_name: field_name.clone(),
                applied: DEFAULT_LEVEL,
            })
            .collect()
    }

    /// Number of classified fields across every record type.
    pub fn len(&self) -> usize {
        self.records.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
