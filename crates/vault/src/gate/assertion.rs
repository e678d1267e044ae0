//! Access assertions: the credential a caller presents to reveal plaintext.
//!
//! Assertions are issued and verified outside the core in production; the
//! gate only consumes an [`AccessVerifier`]. [`HmacAssertionVerifier`] is a
//! self-contained implementation for single-service deployments and tests.
//!
//! # Token format
//!
//! ```text
//! <base64url-no-pad(claims JSON)>.<base64url-no-pad(HMAC-SHA256 over the first part)>
//! ```

use std::collections::BTreeSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use common::Privilege;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Minimum HMAC key length accepted by [`HmacAssertionVerifier`].
pub const MIN_SECRET_LEN: usize = 32;

/// An opaque bearer credential. Its `Debug` output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessAssertion(String);

impl AccessAssertion {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AccessAssertion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessAssertion([REDACTED])")
    }
}

/// What a verified assertion grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// The caller the assertion was issued to.
    #[serde(rename = "sub")]
    pub subject: String,
    pub entity_type: String,
    pub entity_id: String,
    /// Fields that may be revealed; `None` means every field of the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<BTreeSet<String>>,
    pub privilege: Privilege,
    /// Expiry, in seconds since the Unix epoch.
    #[serde(rename = "exp")]
    pub expires_at: u64,
}

impl AccessClaims {
    /// Whether `field` is inside the assertion's scope.
    pub fn covers(&self, field: &str) -> bool {
        self.fields.as_ref().map_or(true, |f| f.contains(field))
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        let now = now.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
        now >= self.expires_at
    }

    /// Expiry `ttl` from now.
    pub fn expiry_in(ttl: Duration) -> u64 {
        (SystemTime::now() + ttl)
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssertionError {
    #[error("malformed assertion: {0}")]
    Malformed(&'static str),

    #[error("assertion signature is invalid")]
    BadSignature,

    #[error("assertion has expired")]
    Expired,

    #[error("assertion key must be at least {MIN_SECRET_LEN} bytes")]
    WeakKey,

    /// The verifier itself could not be reached or failed.
    #[error("assertion verifier unavailable: {0}")]
    Unavailable(String),
}

/// Validates access assertions. Implemented outside the core in production.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccessVerifier: Send + Sync {
    async fn verify(&self, assertion: &AccessAssertion) -> Result<AccessClaims, AssertionError>;
}

/// HMAC-SHA256 signed assertions with expiry.
pub struct HmacAssertionVerifier {
    secret: Zeroizing<Vec<u8>>,
}

impl HmacAssertionVerifier {
    /// # Errors
    ///
    /// [`AssertionError::WeakKey`] if `secret` is shorter than [`MIN_SECRET_LEN`].
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self, AssertionError> {
        let secret = Zeroizing::new(secret.into());
        if secret.len() < MIN_SECRET_LEN {
            return Err(AssertionError::WeakKey);
        }
        Ok(Self { secret })
    }

    /// Sign `claims` into a token.
    pub fn issue(&self, claims: &AccessClaims) -> Result<AccessAssertion, AssertionError> {
        let json = serde_json::to_vec(claims).map_err(|_| AssertionError::Malformed("claims"))?;
        let payload = URL_SAFE_NO_PAD.encode(json);
        let signature = URL_SAFE_NO_PAD.encode(self.mac(payload.as_bytes())?.finalize().into_bytes());
        Ok(AccessAssertion(format!("{payload}.{signature}")))
    }

    /// Verify against an explicit clock.
    pub fn verify_at(
        &self,
        assertion: &AccessAssertion,
        now: SystemTime,
    ) -> Result<AccessClaims, AssertionError> {
        let (payload, signature) = assertion
            .as_str()
            .split_once('.')
            .ok_or(AssertionError::Malformed("missing signature"))?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| AssertionError::Malformed("signature is not base64url"))?;
        // Signature first: nothing from an unauthenticated payload is parsed.
        self.mac(payload.as_bytes())?
            .verify_slice(&signature)
            .map_err(|_| AssertionError::BadSignature)?;

        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| AssertionError::Malformed("payload is not base64url"))?;
        let claims: AccessClaims =
            serde_json::from_slice(&json).map_err(|_| AssertionError::Malformed("claims"))?;
        if claims.is_expired_at(now) {
            return Err(AssertionError::Expired);
        }
        Ok(claims)
    }

    fn mac(&self, payload: &[u8]) -> Result<HmacSha256, AssertionError> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).map_err(|_| AssertionError::WeakKey)?;
        mac.update(payload);
        Ok(mac)
    }
}

#[async_trait]
impl AccessVerifier for HmacAssertionVerifier {
    async fn verify(&self, assertion: &AccessAssertion) -> Result<AccessClaims, AssertionError> {
        self.verify_at(assertion, SystemTime::now())
    }
}

impl std::fmt::Debug for HmacAssertionVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HmacAssertionVerifier([REDACTED])")
    }
}
