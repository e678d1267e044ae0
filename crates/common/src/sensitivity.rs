//! Sensitivity levels, their rotation intervals, and decrypt privilege floors.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const DAY: u64 = 24 * 60 * 60;

/// Classification of a record field.
///
/// Ordered from least to most sensitive, so `level >= SensitivityLevel::Sensitive`
/// reads naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensitivityLevel {
    Public,
    Internal,
    Sensitive,
    Critical,
}

impl SensitivityLevel {
    /// Every level, least sensitive first.
    pub const ALL: [SensitivityLevel; 4] = [
        SensitivityLevel::Public,
        SensitivityLevel::Internal,
        SensitivityLevel::Sensitive,
        SensitivityLevel::Critical,
    ];

    /// Levels whose values are stored encrypted.
    pub const ENCRYPTED: [SensitivityLevel; 3] = [
        SensitivityLevel::Internal,
        SensitivityLevel::Sensitive,
        SensitivityLevel::Critical,
    ];

    /// Whether values at this level are encrypted before persistence.
    pub fn requires_encryption(self) -> bool {
        self != SensitivityLevel::Public
    }

    /// How long the KMS key serving this level may stay active.
    pub fn rotation_interval(self) -> Option<Duration> {
        match self {
            SensitivityLevel::Public => None,
            SensitivityLevel::Internal => Some(Duration::from_secs(365 * DAY)),
            SensitivityLevel::Sensitive => Some(Duration::from_secs(180 * DAY)),
            SensitivityLevel::Critical => Some(Duration::from_secs(90 * DAY)),
        }
    }

    /// Minimum caller privilege required to reveal a value at this level.
    pub fn min_privilege(self) -> Option<Privilege> {
        match self {
            SensitivityLevel::Public => None,
            SensitivityLevel::Internal => Some(Privilege::Standard),
            SensitivityLevel::Sensitive => Some(Privilege::Elevated),
            SensitivityLevel::Critical => Some(Privilege::Privileged),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SensitivityLevel::Public => "public",
            SensitivityLevel::Internal => "internal",
            SensitivityLevel::Sensitive => "sensitive",
            SensitivityLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for SensitivityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensitivityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "public" => Ok(SensitivityLevel::Public),
            "internal" => Ok(SensitivityLevel::Internal),
            "sensitive" => Ok(SensitivityLevel::Sensitive),
            "critical" => Ok(SensitivityLevel::Critical),
            other => Err(format!("unknown sensitivity level: {other}")),
        }
    }
}

/// Privilege carried by a caller's access assertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privilege {
    Standard,
    Elevated,
    Privileged,
}

impl Privilege {
    /// Whether this privilege is enough to reveal a value at `level`.
    pub fn permits(self, level: SensitivityLevel) -> bool {
        match level.min_privilege() {
            Some(required) => self >= required,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_intervals() {
        assert_eq!(SensitivityLevel::Public.rotation_interval(), None);
        assert_eq!(
            SensitivityLevel::Internal.rotation_interval(),
            Some(Duration::from_secs(365 * DAY))
        );
        assert_eq!(
            SensitivityLevel::Sensitive.rotation_interval(),
            Some(Duration::from_secs(180 * DAY))
        );
        assert_eq!(
            SensitivityLevel::Critical.rotation_interval(),
            Some(Duration::from_secs(90 * DAY))
        );
    }

    #[test]
    fn privilege_floor() {
        assert!(Privilege::Standard.permits(SensitivityLevel::Internal));
        assert!(!Privilege::Standard.permits(SensitivityLevel::Sensitive));
        assert!(!Privilege::Elevated.permits(SensitivityLevel::Critical));
        assert!(Privilege::Privileged.permits(SensitivityLevel::Critical));
        assert!(Privilege::Standard.permits(SensitivityLevel::Public));
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(
            "Critical".parse::<SensitivityLevel>().unwrap(),
            SensitivityLevel::Critical
        );
        assert!("secret".parse::<SensitivityLevel>().is_err());
    }

    #[test]
    fn serde_uses_lowercase() {
        let json = serde_json::to_string(&SensitivityLevel::Sensitive).unwrap();
        assert_eq!(json, "\"sensitive\"");
    }
}
