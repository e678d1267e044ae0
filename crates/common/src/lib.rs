//! Common types, persisted formats, and errors shared across `fieldvault` crates.

pub mod context;
pub mod envelope;
pub mod error;
pub mod protocol;
pub mod sensitivity;

pub use context::EncryptionContext;
pub use envelope::EncryptedValue;
pub use error::{FieldError, Severity};
pub use sensitivity::{Privilege, SensitivityLevel};
