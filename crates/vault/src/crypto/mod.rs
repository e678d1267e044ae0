//! AES-256-GCM field encryption.
//!
//! This module is free of AWS dependencies. It seals individual field values
//! under data keys handed out by [`crate::dek::KeyProvider`] and binds every
//! ciphertext to its [`common::EncryptionContext`] through the AAD.
//!
//! # Output
//!
//! Each call produces a [`common::EncryptedValue`] carrying the detached
//! 16-byte tag, the fresh 12-byte nonce, the data key id and the wrapped data
//! key. The persisted JSON form is defined in [`common::envelope`].

pub mod cipher;

pub use cipher::{open, seal, CipherError, FieldCipher, Sealed};

pub use common::envelope::{NONCE_LEN, TAG_LEN};

/// Byte length of an AES-256 key (32 bytes = 256 bits).
pub const KEY_LEN: usize = 32;
