//! [`EncryptedValue`]: the persisted representation of one encrypted field.
//!
//! # Persisted format
//!
//! ```text
//! {
//!   "algorithm":  "AES-256-GCM",
//!   "keyId":      "dek-<uuid>",
//!   "wrappedKey": "<base64>",
//!   "nonce":      "<base64, 12 bytes>",
//!   "authTag":    "<base64, 16 bytes>",
//!   "ciphertext": "<base64>"
//! }
//! ```
//!
//! The persistence layer stores this blob unmodified.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The only algorithm this format carries.
pub const ALGORITHM: &str = "AES-256-GCM";

/// Byte length of an AES-GCM nonce (96 bits).
pub const NONCE_LEN: usize = 12;

/// Byte length of an AES-GCM authentication tag (128 bits).
pub const TAG_LEN: usize = 16;

/// Errors produced when decoding a persisted [`EncryptedValue`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("{0} is not valid base64")]
    InvalidBase64(&'static str),

    #[error("{field} has invalid length: expected {expected} bytes, got {got}")]
    InvalidLength {
        field: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("malformed blob: {0}")]
    Json(String),
}

/// One encrypted field value. Immutable: an update produces a new value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EncryptedValueRepr", into = "EncryptedValueRepr")]
pub struct EncryptedValue {
    ciphertext: Vec<u8>,
    nonce: [u8; NONCE_LEN],
    auth_tag: [u8; TAG_LEN],
    key_id: String,
    wrapped_key: Bytes,
}

impl EncryptedValue {
    pub fn new(
        ciphertext: Vec<u8>,
        nonce: [u8; NONCE_LEN],
        auth_tag: [u8; TAG_LEN],
        key_id: impl Into<String>,
        wrapped_key: Bytes,
    ) -> Self {
        Self {
            ciphertext,
            nonce,
            auth_tag,
            key_id: key_id.into(),
            wrapped_key,
        }
    }

    pub fn algorithm(&self) -> &'static str {
        ALGORITHM
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }

    pub fn auth_tag(&self) -> &[u8; TAG_LEN] {
        &self.auth_tag
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn wrapped_key(&self) -> &Bytes {
        &self.wrapped_key
    }

    /// Serialise to the persisted JSON blob.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::Json`] if serialisation fails.
    pub fn to_blob(&self) -> Result<String, FormatError> {
        serde_json::to_string(self).map_err(|e| FormatError::Json(e.to_string()))
    }

    /// Parse a persisted JSON blob.
    ///
    /// # Errors
    ///
    /// Returns a [`FormatError`] if the blob is not valid JSON, names another
    /// algorithm, or carries a nonce/tag of the wrong length.
    pub fn from_blob(blob: &str) -> Result<Self, FormatError> {
        serde_json::from_str(blob).map_err(|e| FormatError::Json(e.to_string()))
    }
}

impl std::fmt::Debug for EncryptedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedValue")
            .field("algorithm", &ALGORITHM)
            .field("key_id", &self.key_id)
            .field("ciphertext_len", &self.ciphertext.len())
            .finish_non_exhaustive()
    }
}

/// Wire shape of [`EncryptedValue`]; binary fields as standard base64.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EncryptedValueRepr {
    algorithm: String,
    key_id: String,
    wrapped_key: String,
    nonce: String,
    auth_tag: String,
    ciphertext: String,
}

impl From<EncryptedValue> for EncryptedValueRepr {
    fn from(v: EncryptedValue) -> Self {
        Self {
            algorithm: ALGORITHM.to_owned(),
            key_id: v.key_id,
            wrapped_key: STANDARD.encode(&v.wrapped_key),
            nonce: STANDARD.encode(v.nonce),
            auth_tag: STANDARD.encode(v.auth_tag),
            ciphertext: STANDARD.encode(&v.ciphertext),
        }
    }
}

impl TryFrom<EncryptedValueRepr> for EncryptedValue {
    type Error = FormatError;

    fn try_from(r: EncryptedValueRepr) -> Result<Self, Self::Error> {
        if r.algorithm != ALGORITHM {
            return Err(FormatError::UnsupportedAlgorithm(r.algorithm));
        }
        if r.key_id.is_empty() {
            return Err(FormatError::Empty("keyId"));
        }
        let wrapped_key = decode(&r.wrapped_key, "wrappedKey")?;
        if wrapped_key.is_empty() {
            return Err(FormatError::Empty("wrappedKey"));
        }
        let nonce = decode_fixed::<NONCE_LEN>(&r.nonce, "nonce")?;
        let auth_tag = decode_fixed::<TAG_LEN>(&r.auth_tag, "authTag")?;
        let ciphertext = decode(&r.ciphertext, "ciphertext")?;

        Ok(Self {
            ciphertext,
            nonce,
            auth_tag,
            key_id: r.key_id,
            wrapped_key: Bytes::from(wrapped_key),
        })
    }
}

fn decode(s: &str, field: &'static str) -> Result<Vec<u8>, FormatError> {
    STANDARD
        .decode(s)
        .map_err(|_| FormatError::InvalidBase64(field))
}

fn decode_fixed<const N: usize>(s: &str, field: &'static str) -> Result<[u8; N], FormatError> {
    let bytes = decode(s, field)?;
    bytes.as_slice().try_into().map_err(|_| FormatError::InvalidLength {
        field,
        expected: N,
        got: bytes.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn sample() -> EncryptedValue {
        EncryptedValue::new(
            b"opaque".to_vec(),
            [7u8; NONCE_LEN],
            [9u8; TAG_LEN],
            "dek-1234",
            Bytes::from_static(b"wrapped"),
        )
    }

    #[test]
    fn blob_uses_camel_case_keys() {
        let blob = sample().to_blob().unwrap();
        let v: Value = serde_json::from_str(&blob).unwrap();
        assert_eq!(v["algorithm"], "AES-256-GCM");
        assert_eq!(v["keyId"], "dek-1234");
        assert_eq!(v["nonce"], STANDARD.encode([7u8; NONCE_LEN]));
        assert!(v.get("authTag").is_some());
        assert!(v.get("wrappedKey").is_some());
    }

    #[test]
    fn blob_parses_back() {
        let original = sample();
        let parsed = EncryptedValue::from_blob(&original.to_blob().unwrap()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn rejects_other_algorithm() {
        let blob = json!({
            "algorithm": "AES-256-GCM-SIV",
            "keyId": "dek-1",
            "wrappedKey": STANDARD.encode(b"w"),
            "nonce": STANDARD.encode([0u8; NONCE_LEN]),
            "authTag": STANDARD.encode([0u8; TAG_LEN]),
            "ciphertext": ""
        })
        .to_string();
        let err = EncryptedValue::from_blob(&blob).unwrap_err();
        assert!(err.to_string().contains("unsupported algorithm"));
    }

    #[test]
    fn rejects_short_nonce() {
        let blob = json!({
            "algorithm": ALGORITHM,
            "keyId": "dek-1",
            "wrappedKey": STANDARD.encode(b"w"),
            "nonce": STANDARD.encode([0u8; 8]),
            "authTag": STANDARD.encode([0u8; TAG_LEN]),
            "ciphertext": ""
        })
        .to_string();
        let err = EncryptedValue::from_blob(&blob).unwrap_err();
        assert!(err.to_string().contains("nonce"));
    }

    #[test]
    fn rejects_bad_base64() {
        let blob = json!({
            "algorithm": ALGORITHM,
            "keyId": "dek-1",
            "wrappedKey": "!!!",
            "nonce": STANDARD.encode([0u8; NONCE_LEN]),
            "authTag": STANDARD.encode([0u8; TAG_LEN]),
            "ciphertext": ""
        })
        .to_string();
        assert!(EncryptedValue::from_blob(&blob).is_err());
    }

    #[test]
    fn debug_hides_payload() {
        let dbg = format!("{:?}", sample());
        assert!(dbg.contains("dek-1234"));
        assert!(!dbg.contains("wrapped"));
    }
}
