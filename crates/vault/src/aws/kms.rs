//! [`AwsKms`]: [`KeyManagementService`] backed by AWS KMS.
//!
//! The [`EncryptionContext`] is sent as the KMS encryption context on both
//! `GenerateDataKey` and `Decrypt`, so KMS itself refuses to unwrap a data
//! key presented under another entity or caller. Rotation uses on-demand key
//! rotation; prior key material stays available for `Decrypt`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use aws_sdk_kms::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_kms::primitives::{Blob, DateTime};
use aws_sdk_kms::types::DataKeySpec;
use bytes::Bytes;
use common::EncryptionContext;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::AwsClients;
use crate::kms::{GeneratedDataKey, KeyManagementService, KeyMetadata, KmsError};

#[derive(Clone, Debug)]
pub struct AwsKms {
    client: aws_sdk_kms::Client,
}

impl AwsKms {
    pub fn new(aws: &AwsClients) -> Self {
        Self {
            client: aws.kms.clone(),
        }
    }

    /// Most recent completed rotation, if the caller may list rotations.
    async fn last_rotation(&self, key_id: &str) -> Option<SystemTime> {
        match self.client.list_key_rotations().key_id(key_id).send().await {
            Ok(out) => out
                .rotations()
                .iter()
                .filter_map(|r| r.rotation_date().and_then(to_system_time))
                .max(),
            Err(e) => {
                debug!(key_id, error = %DisplayErrorContext(&e), "could not list key rotations");
                None
            }
        }
    }
}

#[async_trait]
impl KeyManagementService for AwsKms {
    async fn generate_data_key(
        &self,
        key_id: &str,
        context: &EncryptionContext,
    ) -> Result<GeneratedDataKey, KmsError> {
        let out = self
            .client
            .generate_data_key()
            .key_id(key_id)
            .key_spec(DataKeySpec::Aes256)
            .set_encryption_context(Some(context.kms_context()))
            .send()
            .await
            .map_err(|e| classify("GenerateDataKey", e))?;

        let plaintext = out
            .plaintext()
            .ok_or_else(|| KmsError::InvalidResponse("GenerateDataKey returned no plaintext".into()))?;
        let wrapped = out.ciphertext_blob().ok_or_else(|| {
            KmsError::InvalidResponse("GenerateDataKey returned no ciphertext blob".into())
        })?;

        Ok(GeneratedDataKey {
            plaintext: Zeroizing::new(plaintext.as_ref().to_vec()),
            wrapped: Bytes::copy_from_slice(wrapped.as_ref()),
            // KMS reports the key ARN; fall back to what was asked for.
            kms_key_id: out.key_id().unwrap_or(key_id).to_owned(),
        })
    }

    async fn unwrap(
        &self,
        wrapped: &[u8],
        context: &EncryptionContext,
    ) -> Result<Zeroizing<Vec<u8>>, KmsError> {
        let out = self
            .client
            .decrypt()
            .ciphertext_blob(Blob::new(wrapped))
            .set_encryption_context(Some(context.kms_context()))
            .send()
            .await
            .map_err(|e| classify("Decrypt", e))?;

        out.plaintext()
            .map(|p| Zeroizing::new(p.as_ref().to_vec()))
            .ok_or_else(|| KmsError::InvalidResponse("Decrypt returned no plaintext".into()))
    }

    async fn describe_key(&self, key_id: &str) -> Result<KeyMetadata, KmsError> {
        let out = self
            .client
            .describe_key()
            .key_id(key_id)
            .send()
            .await
            .map_err(|e| classify("DescribeKey", e))?;
        let meta = out
            .key_metadata()
            .ok_or_else(|| KmsError::InvalidResponse("DescribeKey returned no metadata".into()))?;

        Ok(KeyMetadata {
            key_id: key_id.to_owned(),
            enabled: meta.enabled(),
            created_at: meta.creation_date().and_then(to_system_time),
            last_rotated_at: self.last_rotation(key_id).await,
        })
    }

    async fn rotate_key(&self, key_id: &str) -> Result<KeyMetadata, KmsError> {
        self.client
            .rotate_key_on_demand()
            .key_id(key_id)
            .send()
            .await
            .map_err(|e| classify("RotateKeyOnDemand", e))?;
        let requested_at = SystemTime::now();
        Ok(rotated_metadata(key_id, self.describe_key(key_id).await, requested_at))
    }
}

/// Metadata to report once `RotateKeyOnDemand` has been accepted. The
/// rotation completes asynchronously, so the request time stands in for the
/// rotation time. A failed follow-up describe must not turn the accepted
/// rotation into an error.
fn rotated_metadata(
    key_id: &str,
    described: Result<KeyMetadata, KmsError>,
    requested_at: SystemTime,
) -> KeyMetadata {
    match described {
        Ok(mut meta) => {
            meta.last_rotated_at = Some(requested_at);
            meta
        }
        Err(e) => {
            warn!(key_id, error = %e, "KMS key rotated but describe failed");
            KeyMetadata {
                key_id: key_id.to_owned(),
                enabled: true,
                created_at: None,
                last_rotated_at: Some(requested_at),
            }
        }
    }
}

fn to_system_time(dt: &DateTime) -> Option<SystemTime> {
    u64::try_from(dt.secs())
        .ok()
        .map(|secs| UNIX_EPOCH + Duration::from_secs(secs))
}

/// Map an SDK failure onto [`KmsError`] by its service error code.
fn classify<E, R>(operation: &str, err: SdkError<E, R>) -> KmsError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let code = err.code().map(str::to_owned);
    let message = format!("{operation}: {}", DisplayErrorContext(&err));
    match code.as_deref() {
        Some(code) => kms_error_for_code(code, message),
        None => KmsError::Unavailable(message),
    }
}

fn kms_error_for_code(code: &str, message: String) -> KmsError {
    match code {
        "InvalidCiphertextException" | "IncorrectKeyException" => KmsError::InvalidCiphertext(message),
        "ThrottlingException" | "LimitExceededException" => KmsError::Throttled(message),
        "AccessDeniedException"
        | "DisabledException"
        | "KMSInvalidStateException"
        | "InvalidGrantTokenException"
        | "UnsupportedOperationException" => KmsError::AccessDenied(message),
        "NotFoundException" => KmsError::NotFound(message),
        _ => KmsError::Unavailable(message),
    }
}
