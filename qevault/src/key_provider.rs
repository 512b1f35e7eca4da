//! Key wrap provider abstraction and the provider registry.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretVec;

use crate::error::KeyProviderError;
use crate::key_vault::MasterKey;

/// Wraps and unwraps data encryption keys under a master key.
///
/// Implementations must be thread-safe (`Send + Sync`) since many resolvers
/// and sessions share one provider.
///
/// # Example
///
/// ```rust,ignore
/// use qevault::key_provider::KeyWrapProvider;
///
/// struct MyProvider;
///
/// #[async_trait::async_trait]
/// impl KeyWrapProvider for MyProvider {
///     fn name(&self) -> &str {
///         "my-kms"
///     }
///     // ... other methods
/// }
/// ```
#[async_trait]
pub trait KeyWrapProvider: Send + Sync {
    /// Returns the provider name, e.g. `local` or `aws`.
    fn name(&self) -> &str;

    /// Returns the descriptor stored alongside every DEK wrapped by this
    /// provider.
    fn master_key(&self) -> MasterKey;

    /// Wraps (encrypts) a plaintext DEK.
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::WrapFailed` if wrapping fails.
    async fn wrap(&self, dek: &[u8]) -> Result<Vec<u8>, KeyProviderError>;

    /// Unwraps (decrypts) a DEK previously wrapped under `master_key`.
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::UnwrapFailed` if unwrapping fails.
    async fn unwrap(
        &self,
        master_key: &MasterKey,
        wrapped: &[u8],
    ) -> Result<SecretVec<u8>, KeyProviderError>;
}

/// Registry of key wrap providers addressed by name.
///
/// Cloning is cheap; clones share the registered providers.
#[derive(Clone, Default)]
pub struct KmsProviders {
    providers: BTreeMap<String, Arc<dyn KeyWrapProvider>>,
}

impl KmsProviders {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider under its own name, replacing any previous one.
    #[must_use]
    pub fn with(mut self, provider: impl KeyWrapProvider + 'static) -> Self {
        self.register(Arc::new(provider));
        self
    }

    /// Registers a shared provider under its own name.
    pub fn register(&mut self, provider: Arc<dyn KeyWrapProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    /// Returns the provider registered as `name`.
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::ProviderNotFound` if none is registered.
    pub fn get(&self, name: &str) -> Result<&Arc<dyn KeyWrapProvider>, KeyProviderError> {
        self.providers
            .get(name)
            .ok_or_else(|| KeyProviderError::ProviderNotFound(name.to_string()))
    }

    /// Wraps `dek` with the provider named `provider_name`.
    ///
    /// # Returns
    ///
    /// The master key descriptor to persist with the DEK and the wrapped bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider is unknown or wrapping fails.
    pub async fn wrap(
        &self,
        provider_name: &str,
        dek: &[u8],
    ) -> Result<(MasterKey, Vec<u8>), KeyProviderError> {
        let provider = self.get(provider_name)?;
        let wrapped = provider.wrap(dek).await?;
        Ok((provider.master_key(), wrapped))
    }

    /// Unwraps a DEK with the provider recorded in `master_key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider is unknown or unwrapping fails.
    pub async fn unwrap(
        &self,
        master_key: &MasterKey,
        wrapped: &[u8],
    ) -> Result<SecretVec<u8>, KeyProviderError> {
        self.get(&master_key.provider)?.unwrap(master_key, wrapped).await
    }
}

impl fmt::Debug for KmsProviders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.providers.keys()).finish()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MockKeyProvider;
    use super::*;
    use secrecy::ExposeSecret;

    #[tokio::test]
    async fn test_wrap_unwrap_through_registry() {
        let providers = KmsProviders::new().with(MockKeyProvider::new("local"));

        let (master_key, wrapped) = providers.wrap("local", b"plaintext-dek").await.unwrap();
        assert_eq!(master_key.provider, "local");
        assert_ne!(wrapped, b"plaintext-dek");

        let unwrapped = providers.unwrap(&master_key, &wrapped).await.unwrap();
        assert_eq!(unwrapped.expose_secret(), b"plaintext-dek");
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let providers = KmsProviders::new().with(MockKeyProvider::new("local"));

        let result = providers.wrap("aws", b"dek").await;
        assert!(matches!(result, Err(KeyProviderError::ProviderNotFound(name)) if name == "aws"));
        assert!(providers.get("local").is_ok());
    }

    #[test]
    fn test_debug_lists_names_only() {
        let providers = KmsProviders::new().with(MockKeyProvider::new("local"));
        assert_eq!(format!("{providers:?}"), r#"{"local"}"#);
    }
}
