//! [`EncryptionContext`]: the (entity, caller) binding for one logical operation.
//!
//! The context is authenticated as AES-GCM associated data and passed to the
//! KMS as its encryption context, so a ciphertext produced for one entity or
//! caller cannot be decrypted under another.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

/// Byte that separates context components in the AAD serialisation.
pub const AAD_SEPARATOR: u8 = 0x1F;

/// Version tag that prefixes every AAD serialisation.
pub const AAD_VERSION: &str = "fv1";

/// Errors produced when constructing an [`EncryptionContext`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    /// A component was empty or whitespace only.
    #[error("{0} must not be empty")]
    Empty(&'static str),

    /// A component contained the reserved AAD separator byte.
    #[error("{0} must not contain the 0x1F separator byte")]
    ReservedByte(&'static str),
}

/// Immutable `(entity_type, entity_id, caller_id)` triple.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct EncryptionContext {
    entity_type: String,
    entity_id: String,
    caller_id: String,
}

impl EncryptionContext {
    /// Build a context, rejecting empty components and the separator byte.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError`] naming the offending component.
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        caller_id: impl Into<String>,
    ) -> Result<Self, ContextError> {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        let caller_id = caller_id.into();
        check_component(&entity_type, "entity_type")?;
        check_component(&entity_id, "entity_id")?;
        check_component(&caller_id, "caller_id")?;
        Ok(Self {
            entity_type,
            entity_id,
            caller_id,
        })
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn caller_id(&self) -> &str {
        &self.caller_id
    }

    /// Stable AAD serialisation:
    /// `fv1 0x1F entity_type 0x1F entity_id 0x1F caller_id`.
    pub fn aad(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            AAD_VERSION.len() + 3 + self.entity_type.len() + self.entity_id.len() + self.caller_id.len(),
        );
        out.extend_from_slice(AAD_VERSION.as_bytes());
        for part in [&self.entity_type, &self.entity_id, &self.caller_id] {
            out.push(AAD_SEPARATOR);
            out.extend_from_slice(part.as_bytes());
        }
        out
    }

    /// The context as a KMS encryption-context map.
    pub fn kms_context(&self) -> HashMap<String, String> {
        HashMap::from([
            ("entity_type".to_owned(), self.entity_type.clone()),
            ("entity_id".to_owned(), self.entity_id.clone()),
            ("caller_id".to_owned(), self.caller_id.clone()),
        ])
    }
}

impl fmt::Debug for EncryptionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionContext")
            .field("entity_type", &self.entity_type)
            .field("entity_id", &self.entity_id)
            .field("caller_id", &self.caller_id)
            .finish()
    }
}

fn check_component(value: &str, name: &'static str) -> Result<(), ContextError> {
    if value.trim().is_empty() {
        return Err(ContextError::Empty(name));
    }
    if value.as_bytes().contains(&AAD_SEPARATOR) {
        return Err(ContextError::ReservedByte(name));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aad_is_separator_joined() {
        let ctx = EncryptionContext::new("User", "42", "svc-a").unwrap();
        assert_eq!(ctx.aad(), b"fv1\x1fUser\x1f42\x1fsvc-a".to_vec());
    }

    #[test]
    fn aad_differs_per_component() {
        let a = EncryptionContext::new("User", "42", "svc-a").unwrap();
        let b = EncryptionContext::new("User", "42", "svc-b").unwrap();
        let c = EncryptionContext::new("User", "99", "svc-a").unwrap();
        assert_ne!(a.aad(), b.aad());
        assert_ne!(a.aad(), c.aad());
    }

    #[test]
    fn rejects_empty_component() {
        assert_eq!(
            EncryptionContext::new("User", " ", "svc-a"),
            Err(ContextError::Empty("entity_id"))
        );
    }

    #[test]
    fn rejects_separator_byte() {
        assert_eq!(
            EncryptionContext::new("User", "4\u{1f}2", "svc-a"),
            Err(ContextError::ReservedByte("entity_id"))
        );
    }

    #[test]
    fn kms_context_has_all_components() {
        let ctx = EncryptionContext::new("User", "42", "svc-a").unwrap();
        let map = ctx.kms_context();
        assert_eq!(map.len(), 3);
        assert_eq!(map["entity_id"], "42");
    }
}
