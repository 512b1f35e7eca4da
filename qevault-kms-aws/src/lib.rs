//! AWS KMS key provider for `qevault`.
//!
//! Data keys are wrapped with a KMS key: `wrap` calls KMS `Encrypt` and
//! `unwrap` calls KMS `Decrypt`. The master key never leaves KMS.
//!
//! # Example
//!
//! ```rust,no_run
//! use qevault::key_provider::KmsProviders;
//! use qevault_kms_aws::AwsKmsProvider;
//!
//! # async fn example() {
//! let provider = AwsKmsProvider::new(
//!     "arn:aws:kms:us-east-1:123456789012:key/12345678-1234-1234-1234-123456789012",
//! )
//! .await;
//! let providers = KmsProviders::new().with(provider);
//! # }
//! ```
//!
//! # AWS Configuration
//!
//! The provider uses the AWS SDK's default credential chain:
//! - Environment variables (`AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`)
//! - AWS credentials file (~/.aws/credentials)
//! - IAM instance profile (for EC2)
//! - ECS task role
//! - Web identity token (for EKS)

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_kms::{primitives::Blob, Client as KmsClient};
use qevault::error::KeyProviderError;
use qevault::key_provider::KeyWrapProvider;
use qevault::key_vault::MasterKey;
use secrecy::SecretVec;
use thiserror::Error;
use tracing::debug;

/// Provider name recorded on every DEK this provider wraps.
pub const PROVIDER_NAME: &str = "aws";

/// Errors specific to AWS KMS operations.
#[derive(Debug, Error)]
pub enum AwsKmsError {
    /// AWS KMS API error
    #[error("AWS KMS error: {0}")]
    KmsError(String),

    /// KMS answered without the expected payload
    #[error("KMS returned no {0}")]
    MissingPayload(&'static str),

    /// The DEK was wrapped by another provider or key
    #[error("key was wrapped by {0}")]
    ForeignMasterKey(String),
}

impl AwsKmsError {
    fn into_wrap(self) -> KeyProviderError {
        KeyProviderError::WrapFailed(self.to_string())
    }

    fn into_unwrap(self) -> KeyProviderError {
        KeyProviderError::UnwrapFailed(self.to_string())
    }
}

/// AWS KMS key wrap provider.
pub struct AwsKmsProvider {
    client: KmsClient,
    /// KMS key ID, ARN, or alias
    key_id: String,
}

impl AwsKmsProvider {
    /// Creates a provider using the default AWS configuration.
    ///
    /// # Arguments
    ///
    /// * `key_id` - KMS key ID, ARN, or alias (e.g., "alias/qevault-master")
    pub async fn new(key_id: impl Into<String>) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Self::with_client(KmsClient::new(&config), key_id)
    }

    /// Creates a provider around an existing KMS client.
    #[must_use]
    pub fn with_client(client: KmsClient, key_id: impl Into<String>) -> Self {
        Self { client, key_id: key_id.into() }
    }

    /// Returns the KMS key this provider wraps under.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    async fn encrypt(&self, dek: &[u8]) -> Result<Vec<u8>, AwsKmsError> {
        let response = self
            .client
            .encrypt()
            .key_id(&self.key_id)
            .plaintext(Blob::new(dek))
            .send()
            .await
            .map_err(|e| AwsKmsError::KmsError(format!("encrypt failed: {e}")))?;

        let blob = response.ciphertext_blob().ok_or(AwsKmsError::MissingPayload("ciphertext"))?;
        Ok(blob.as_ref().to_vec())
    }

    async fn decrypt(&self, key_id: &str, wrapped: &[u8]) -> Result<SecretVec<u8>, AwsKmsError> {
        let response = self
            .client
            .decrypt()
            .key_id(key_id)
            .ciphertext_blob(Blob::new(wrapped))
            .send()
            .await
            .map_err(|e| AwsKmsError::KmsError(format!("decrypt failed: {e}")))?;

        let plaintext = response.plaintext().ok_or(AwsKmsError::MissingPayload("plaintext"))?;
        Ok(SecretVec::new(plaintext.as_ref().to_vec()))
    }
}

#[async_trait]
impl KeyWrapProvider for AwsKmsProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn master_key(&self) -> MasterKey {
        MasterKey { provider: PROVIDER_NAME.to_string(), key: Some(self.key_id.clone()) }
    }

    async fn wrap(&self, dek: &[u8]) -> Result<Vec<u8>, KeyProviderError> {
        debug!(key_id = %self.key_id, "wrapping data key with KMS");
        self.encrypt(dek).await.map_err(AwsKmsError::into_wrap)
    }

    async fn unwrap(
        &self,
        master_key: &MasterKey,
        wrapped: &[u8],
    ) -> Result<SecretVec<u8>, KeyProviderError> {
        if master_key.provider != PROVIDER_NAME {
            return Err(AwsKmsError::ForeignMasterKey(master_key.provider.clone()).into_unwrap());
        }
        // Keys record the KMS key they were wrapped under; prefer it over ours.
        let key_id = master_key.key.as_deref().unwrap_or(&self.key_id);
        self.decrypt(key_id, wrapped).await.map_err(AwsKmsError::into_unwrap)
    }
}
