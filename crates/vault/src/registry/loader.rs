//! YAML loading for [`SensitivityRegistry`].
//!
//! ```yaml
//! records:
//!   User:
//!     ssn: critical
//!     address: sensitive
//!     display_name: public
//!     nickname: ~        # declared, not yet classified
//! ```
//!
//! A field with a null level is encrypted as `Internal` and reported as a
//! [`FieldError::MisconfiguredField`] warning.

use std::collections::BTreeMap;
use std::path::Path;

use common::{FieldError, SensitivityLevel};
use serde::Deserialize;
use thiserror::Error;

use super::SensitivityRegistry;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read registry file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse registry YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid level for {record_type}.{field_name}: {message}")]
    InvalidLevel {
        record_type: String,
        field_name: String,
        message: String,
    },
}

#[derive(Debug, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    records: BTreeMap<String, BTreeMap<String, Option<String>>>,
}

impl SensitivityRegistry {
    /// Parse a registry document. Returns the registry and a warning for every
    /// declared-but-unclassified field.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] on malformed YAML or an unknown level name.
    pub fn from_yaml_str(yaml: &str) -> Result<(Self, Vec<FieldError>), RegistryError> {
        let doc: RegistryDocument = serde_yaml::from_str(yaml)?;
        let mut registry = Self::new();

        for (record_type, fields) in doc.records {
            for (field_name, level) in fields {
                match level {
                    Some(level) => {
                        let level: SensitivityLevel =
                            level.parse().map_err(|message| RegistryError::InvalidLevel {
                                record_type: record_type.clone(),
                                field_name: field_name.clone(),
                                message,
                            })?;
                        registry.insert(record_type.clone(), field_name, level);
                    }
                    None => registry.declare_unclassified(record_type.clone(), field_name),
                }
            }
        }

        let warnings = registry.misconfigured();
        Ok((registry, warnings))
    }

    /// Read and parse a registry file.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Io`] if the file cannot be read, otherwise as
    /// [`Self::from_yaml_str`].
    pub fn from_path(path: impl AsRef<Path>) -> Result<(Self, Vec<FieldError>), RegistryError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
records:
  User:
    ssn: critical
    address: Sensitive
    display_name: public
    nickname: ~
  Order:
    card_last4: internal
"#;

    #[test]
    fn parses_levels_and_warnings() {
        let (r, warnings) = SensitivityRegistry::from_yaml_str(DOC).unwrap();
        assert_eq!(r.lookup("User", "ssn"), Some(SensitivityLevel::Critical));
        assert_eq!(r.lookup("User", "address"), Some(SensitivityLevel::Sensitive));
        assert_eq!(r.lookup("User", "display_name"), Some(SensitivityLevel::Public));
        assert_eq!(r.lookup("Order", "card_last4"), Some(SensitivityLevel::Internal));
        assert_eq!(r.lookup("User", "nickname"), None);
        assert_eq!(r.classify("User", "nickname"), SensitivityLevel::Internal);
        assert_eq!(r.len(), 4);

        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].to_string().contains("User.nickname"));
    }

    #[test]
    fn rejects_unknown_level() {
        let err = SensitivityRegistry::from_yaml_str("records:\n  User:\n    ssn: secret\n").unwrap_err();
        assert!(matches!(err, RegistryError::InvalidLevel { ref field_name, .. } if field_name == "ssn"));
    }

    #[test]
    fn rejects_malformed_yaml() {
        assert!(matches!(
            SensitivityRegistry::from_yaml_str("records: [1, 2"),
            Err(RegistryError::Yaml(_))
        ));
    }

    #[test]
    fn empty_document_is_empty_registry() {
        let (r, warnings) = SensitivityRegistry::from_yaml_str("{}").unwrap();
        assert!(r.is_empty());
        assert!(warnings.is_empty());
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(matches!(
            SensitivityRegistry::from_path("/nonexistent/registry.yaml"),
            Err(RegistryError::Io { .. })
        ));
    }
}
