//! `fieldvault`: field-level envelope encryption with KMS-backed data keys and
//! access-gated decryption.
//!
//! - [`vault::FieldVault`] protects a record's fields on write.
//! - [`gate::DecryptGate`] is the only path from a stored record to plaintext.
//! - [`dek::KeyProvider`] owns the data key cache; [`dek::KeyRotator`] rotates
//!   the KMS keys behind each sensitivity level.
//! - [`kms::KeyManagementService`] is the seam to the external KMS
//!   ([`aws::AwsKms`] or the in-process [`kms::LocalKms`]).

pub mod audit;
pub mod aws;
pub mod config;
pub mod crypto;
pub mod dek;
pub mod gate;
pub mod kms;
pub mod registry;
pub mod telemetry;
pub mod vault;

pub use common;
pub use vault::{FieldVault, RetryPolicy, WriteOutcome};
