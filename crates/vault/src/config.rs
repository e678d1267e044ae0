//! Configuration loading and validation for the `fieldvault` daemon.
//!
//! All values are read from environment variables at startup. The process
//! exits with a clear error message if a required variable is missing or
//! invalid.

use std::time::Duration;

use anyhow::{Context, Result};
use common::SensitivityLevel;
use serde::Deserialize;

use crate::dek::KmsKeyIds;
use crate::vault::RetryPolicy;

/// Which [`crate::kms::KeyManagementService`] backs the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KmsBackend {
    Aws,
    /// In-process keys; data does not survive a restart.
    Local,
}

/// Validated daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_kms_backend")]
    pub kms_backend: KmsBackend,

    /// KMS key serving every level without an override. **Required.**
    #[serde(default)]
    pub kms_key_id: String,

    pub kms_key_id_internal: Option<String>,
    pub kms_key_id_sensitive: Option<String>,
    pub kms_key_id_critical: Option<String>,

    /// Overrides the KMS endpoint.
    pub aws_endpoint_url: Option<String>,

    #[serde(default = "default_kms_timeout_ms")]
    pub kms_timeout_ms: u64,

    /// Sliding lifetime of a cached data key.
    #[serde(default = "default_key_cache_ttl")]
    pub key_cache_ttl_secs: u64,

    /// Encryptions allowed per data key before it is replaced.
    #[serde(default = "default_key_max_encryptions")]
    pub key_max_encryptions: u64,

    #[serde(default = "default_cache_sweep_interval")]
    pub cache_sweep_interval_secs: u64,

    #[serde(default = "default_rotation_check_interval")]
    pub rotation_check_interval_secs: u64,

    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_initial_backoff_ms")]
    pub retry_initial_backoff_ms: u64,

    /// YAML sensitivity registry. The built-in table is used when unset.
    pub registry_path: Option<String>,

    #[serde(default = "default_audit_channel_capacity")]
    pub audit_channel_capacity: usize,

    /// OTLP collector endpoint. Logs go to stdout only when unset.
    pub otel_exporter_otlp_endpoint: Option<String>,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_kms_backend() -> KmsBackend {
    KmsBackend::Aws
}
fn default_kms_timeout_ms() -> u64 {
    5000
}
fn default_key_cache_ttl() -> u64 {
    4 * 60 * 60
}
fn default_key_max_encryptions() -> u64 {
    1 << 32
}
fn default_cache_sweep_interval() -> u64 {
    60
}
fn default_rotation_check_interval() -> u64 {
    3600
}
fn default_retry_max_attempts() -> u32 {
    3
}
fn default_retry_initial_backoff_ms() -> u64 {
    50
}
fn default_audit_channel_capacity() -> usize {
    1024
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any required variable is absent or cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default().try_parsing(true))
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        if self.kms_backend == KmsBackend::Aws {
            ensure_non_empty(&self.kms_key_id, "KMS_KEY_ID")?;
        }
        for (value, name) in [
            (&self.kms_key_id_internal, "KMS_KEY_ID_INTERNAL"),
            (&self.kms_key_id_sensitive, "KMS_KEY_ID_SENSITIVE"),
            (&self.kms_key_id_critical, "KMS_KEY_ID_CRITICAL"),
            (&self.aws_endpoint_url, "AWS_ENDPOINT_URL"),
            (&self.registry_path, "REGISTRY_PATH"),
            (&self.otel_exporter_otlp_endpoint, "OTEL_EXPORTER_OTLP_ENDPOINT"),
        ] {
            if let Some(value) = value {
                ensure_non_empty(value, name)?;
            }
        }

        if self.kms_timeout_ms == 0 {
            anyhow::bail!("KMS_TIMEOUT_MS must be > 0");
        }
        if self.key_cache_ttl_secs == 0 {
            anyhow::bail!("KEY_CACHE_TTL_SECS must be > 0");
        }
        if self.key_max_encryptions == 0 || self.key_max_encryptions > default_key_max_encryptions() {
            anyhow::bail!("KEY_MAX_ENCRYPTIONS must be between 1 and 2^32");
        }
        if self.cache_sweep_interval_secs == 0 {
            anyhow::bail!("CACHE_SWEEP_INTERVAL_SECS must be > 0");
        }
        if self.rotation_check_interval_secs == 0 {
            anyhow::bail!("ROTATION_CHECK_INTERVAL_SECS must be > 0");
        }
        if self.retry_max_attempts == 0 {
            anyhow::bail!("RETRY_MAX_ATTEMPTS must be > 0");
        }
        if self.audit_channel_capacity == 0 {
            anyhow::bail!("AUDIT_CHANNEL_CAPACITY must be > 0");
        }
        Ok(())
    }

    /// The KMS key for each level. The local backend names its key
    /// `local-master` when `KMS_KEY_ID` is unset.
    pub fn kms_key_ids(&self) -> KmsKeyIds {
        let default = if self.kms_key_id.trim().is_empty() {
            "local-master"
        } else {
            self.kms_key_id.as_str()
        };
        let mut ids = KmsKeyIds::new(default);
        for (level, id) in [
            (SensitivityLevel::Internal, &self.kms_key_id_internal),
            (SensitivityLevel::Sensitive, &self.kms_key_id_sensitive),
            (SensitivityLevel::Critical, &self.kms_key_id_critical),
        ] {
            if let Some(id) = id {
                ids = ids.with_override(level, id.as_str());
            }
        }
        ids
    }

    pub fn kms_timeout(&self) -> Duration {
        Duration::from_millis(self.kms_timeout_ms)
    }

    pub fn key_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.key_cache_ttl_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
            ..RetryPolicy::default()
        }
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            kms_backend: KmsBackend::Aws,
            kms_key_id: "alias/pii".into(),
            kms_key_id_internal: None,
            kms_key_id_sensitive: None,
            kms_key_id_critical: None,
            aws_endpoint_url: None,
            kms_timeout_ms: default_kms_timeout_ms(),
            key_cache_ttl_secs: default_key_cache_ttl(),
            key_max_encryptions: default_key_max_encryptions(),
            cache_sweep_interval_secs: default_cache_sweep_interval(),
            rotation_check_interval_secs: default_rotation_check_interval(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_initial_backoff_ms: default_retry_initial_backoff_ms(),
            registry_path: None,
            audit_channel_capacity: default_audit_channel_capacity(),
            otel_exporter_otlp_endpoint: None,
            log_level: default_log_level(),
        }
    }

    #[test]
    fn defaults_are_correct() {
        assert_eq!(default_kms_backend(), KmsBackend::Aws);
        assert_eq!(default_kms_timeout_ms(), 5000);
        assert_eq!(default_key_cache_ttl(), 14_400);
        assert_eq!(default_key_max_encryptions(), 4_294_967_296);
        assert_eq!(default_cache_sweep_interval(), 60);
        assert_eq!(default_rotation_check_interval(), 3600);
        assert_eq!(default_audit_channel_capacity(), 1024);
        assert_eq!(default_log_level(), "info");
        assert!(base().validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_key_for_aws() {
        let cfg = Config {
            kms_key_id: "".into(),
            ..base()
        };
        assert!(cfg.validate().is_err());
        let local = Config {
            kms_backend: KmsBackend::Local,
            ..cfg
        };
        assert!(local.validate().is_ok());
        assert_eq!(local.kms_key_ids().for_level(SensitivityLevel::Critical), "local-master");
    }

    #[test]
    fn validate_rejects_zero_intervals() {
        assert!(Config { kms_timeout_ms: 0, ..base() }.validate().is_err());
        assert!(Config { key_cache_ttl_secs: 0, ..base() }.validate().is_err());
        assert!(Config { key_max_encryptions: 0, ..base() }.validate().is_err());
        assert!(Config { rotation_check_interval_secs: 0, ..base() }.validate().is_err());
    }

    #[test]
    fn validate_rejects_blank_override() {
        let cfg = Config {
            kms_key_id_critical: Some("  ".into()),
            ..base()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn level_overrides_apply() {
        let cfg = Config {
            kms_key_id_critical: Some("alias/pii-critical".into()),
            ..base()
        };
        let ids = cfg.kms_key_ids();
        assert_eq!(ids.for_level(SensitivityLevel::Critical), "alias/pii-critical");
        assert_eq!(ids.for_level(SensitivityLevel::Sensitive), "alias/pii");
    }
}
