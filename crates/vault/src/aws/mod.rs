//! AWS KMS integration.
//!
//! [`AwsClients`] loads the shared SDK configuration once; [`AwsKms`] adapts
//! the KMS client to [`crate::kms::KeyManagementService`].

pub mod clients;
pub mod kms;

pub use clients::AwsClients;
pub use kms::AwsKms;
