//! AWS SDK client bundle.

use anyhow::Result;
use aws_config::BehaviorVersion;
use tracing::info;

/// AWS SDK clients built from one [`aws_config::SdkConfig`], so credentials
/// are resolved once and reused.
#[derive(Clone, Debug)]
pub struct AwsClients {
    pub kms: aws_sdk_kms::Client,
}

impl AwsClients {
    /// Load the SDK configuration from the standard credential and region
    /// chain. `endpoint_url` overrides the KMS endpoint (e.g. a VPC endpoint
    /// or a local emulator).
    ///
    /// # Errors
    ///
    /// Returns an error if the SDK config cannot be loaded.
    pub async fn init(endpoint_url: Option<&str>) -> Result<Self> {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;

        let mut kms_config = aws_sdk_kms::config::Builder::from(&config);
        if let Some(url) = endpoint_url {
            info!(endpoint = url, "overriding KMS endpoint");
            kms_config = kms_config.endpoint_url(url);
        }
        let kms = aws_sdk_kms::Client::from_conf(kms_config.build());

        Ok(Self { kms })
    }
}
