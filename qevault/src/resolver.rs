//! Data key resolution by alt-name.
//!
//! Resolution is optimistic: look the alt-name up, and if it is missing,
//! mint and insert a new key. When several processes race on the same
//! alt-name, the store's uniqueness constraint lets exactly one insert
//! through; the losers see `DuplicateKey` and adopt the winner's key.
//! There is no in-process lock, since it could not protect against other
//! processes anyway.

use std::collections::BTreeSet;
use std::sync::Arc;

use secrecy::ExposeSecret;
use tracing::{debug, info};

use crate::error::{Error, StoreError};
use crate::field_map::ResolvedKeys;
use crate::kdf::generate_dek;
use crate::key_provider::KmsProviders;
use crate::key_vault::{validate_alt_name, DataEncryptionKey, KeyId, KeyVaultStore};

/// How a key id was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// The key already existed.
    Existing,
    /// This call created the key.
    Created,
    /// A concurrent caller created the key first; its key was adopted.
    AdoptedConcurrent,
}

/// A resolved alt-name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    /// The alt-name that was resolved
    pub alt_name: String,
    /// Id of the key carrying the alt-name
    pub key_id: KeyId,
    /// How the id was obtained
    pub outcome: ResolutionOutcome,
}

/// Produces stable key ids for alt-names, creating keys on first use.
///
/// # Example
///
/// ```rust,ignore
/// use qevault::prelude::*;
///
/// let resolver = DekResolver::new(Arc::new(vault), providers, "local");
/// let key = resolver.resolve("memories-data-key").await?;
/// println!("{} -> {}", key.alt_name, key.key_id);
/// ```
pub struct DekResolver<S: KeyVaultStore> {
    store: Arc<S>,
    providers: KmsProviders,
    provider_name: String,
}

impl<S: KeyVaultStore> DekResolver<S> {
    /// Creates a resolver.
    ///
    /// # Arguments
    ///
    /// * `store` - Key vault the keys live in
    /// * `providers` - Key wrap providers
    /// * `provider_name` - Provider that wraps newly created keys
    pub fn new(store: Arc<S>, providers: KmsProviders, provider_name: impl Into<String>) -> Self {
        Self { store, providers, provider_name: provider_name.into() }
    }

    /// Returns the key vault.
    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Resolves `alt_name` to a key id, creating the key if none exists.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidAltName` if `alt_name` is blank.
    /// - `Error::KeyResolution` if an insert conflicted but the conflicting
    ///   key cannot be read back.
    /// - `Error::KeyProvider` / `Error::Store` for provider or store failures,
    ///   which are never retried here.
    pub async fn resolve(&self, alt_name: &str) -> Result<ResolvedKey, Error> {
        validate_alt_name(alt_name)?;

        if let Some(existing) = self.store.find_by_alt_name(alt_name).await? {
            info!(alt_name, key_id = %existing.id(), "using existing data key");
            return Ok(ResolvedKey {
                alt_name: alt_name.to_string(),
                key_id: existing.id(),
                outcome: ResolutionOutcome::Existing,
            });
        }

        let dek = self.mint(alt_name).await?;
        match self.store.insert(&dek).await {
            Ok(()) => {
                info!(
                    alt_name,
                    key_id = %dek.id(),
                    provider = %self.provider_name,
                    "created new data key"
                );
                Ok(ResolvedKey {
                    alt_name: alt_name.to_string(),
                    key_id: dek.id(),
                    outcome: ResolutionOutcome::Created,
                })
            }
            Err(StoreError::DuplicateKey { .. }) => {
                debug!(alt_name, "lost key creation race; re-reading");
                let winner = self
                    .store
                    .find_by_alt_name(alt_name)
                    .await?
                    .ok_or_else(|| Error::KeyResolution { alt_name: alt_name.to_string() })?;
                info!(
                    alt_name,
                    key_id = %winner.id(),
                    "data key was created by another process; using it"
                );
                Ok(ResolvedKey {
                    alt_name: alt_name.to_string(),
                    key_id: winner.id(),
                    outcome: ResolutionOutcome::AdoptedConcurrent,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolves each distinct alt-name independently.
    ///
    /// # Errors
    ///
    /// Returns the first resolution error.
    pub async fn resolve_all<I, N>(&self, alt_names: I) -> Result<ResolvedKeys, Error>
    where
        I: IntoIterator<Item = N>,
        N: AsRef<str>,
    {
        let distinct: BTreeSet<String> =
            alt_names.into_iter().map(|n| n.as_ref().to_string()).collect();

        let mut keys = ResolvedKeys::new();
        for name in distinct {
            let resolved = self.resolve(&name).await?;
            keys.insert(resolved.alt_name, resolved.key_id);
        }
        Ok(keys)
    }

    /// Generates and wraps fresh key material for `alt_name`.
    ///
    /// The plaintext DEK is dropped (and zeroized) before this returns.
    async fn mint(&self, alt_name: &str) -> Result<DataEncryptionKey, Error> {
        let plaintext = generate_dek();
        let (master_key, wrapped) =
            self.providers.wrap(&self.provider_name, plaintext.expose_secret()).await?;
        Ok(DataEncryptionKey::new([alt_name], wrapped, master_key))
    }
}

impl<S: KeyVaultStore> Clone for DekResolver<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            providers: self.providers.clone(),
            provider_name: self.provider_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeyProviderError;
    use crate::key_provider::testing::MockKeyProvider;
    use crate::key_provider::KeyWrapProvider;
    use crate::key_vault::MasterKey;
    use crate::memory::{MemoryBackend, MemoryKeyVault};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Barrier;

    fn providers() -> KmsProviders {
        KmsProviders::new().with(MockKeyProvider::new("local"))
    }

    async fn indexed_vault(backend: &MemoryBackend) -> MemoryKeyVault {
        let vault = backend.key_vault("encryption.__keyVault".parse().unwrap());
        vault.ensure_index().await.unwrap();
        vault
    }

    /// Holds the first `parties` alt-name lookups until all of them have
    /// happened, so every racer sees the key as missing.
    struct RacingVault {
        inner: MemoryKeyVault,
        lookups: AtomicUsize,
        parties: usize,
        barrier: Barrier,
    }

    impl RacingVault {
        fn new(inner: MemoryKeyVault, parties: usize) -> Self {
            Self { inner, lookups: AtomicUsize::new(0), parties, barrier: Barrier::new(parties) }
        }
    }

    #[async_trait]
    impl KeyVaultStore for RacingVault {
        async fn ensure_index(&self) -> Result<(), StoreError> {
            self.inner.ensure_index().await
        }

        async fn find_by_alt_name(
            &self,
            alt_name: &str,
        ) -> Result<Option<DataEncryptionKey>, StoreError> {
            let result = self.inner.find_by_alt_name(alt_name).await;
            if self.lookups.fetch_add(1, Ordering::SeqCst) < self.parties {
                self.barrier.wait().await;
            }
            result
        }

        async fn find_by_id(&self, id: &KeyId) -> Result<Option<DataEncryptionKey>, StoreError> {
            self.inner.find_by_id(id).await
        }

        async fn insert(&self, dek: &DataEncryptionKey) -> Result<(), StoreError> {
            self.inner.insert(dek).await
        }

        async fn count(&self) -> Result<usize, StoreError> {
            self.inner.count().await
        }
    }

    /// Reports every insert as a duplicate but never finds anything.
    struct InconsistentVault;

    #[async_trait]
    impl KeyVaultStore for InconsistentVault {
        async fn ensure_index(&self) -> Result<(), StoreError> {
            Ok(())
        }

        async fn find_by_alt_name(
            &self,
            _alt_name: &str,
        ) -> Result<Option<DataEncryptionKey>, StoreError> {
            Ok(None)
        }

        async fn find_by_id(&self, _id: &KeyId) -> Result<Option<DataEncryptionKey>, StoreError> {
            Ok(None)
        }

        async fn insert(&self, dek: &DataEncryptionKey) -> Result<(), StoreError> {
            let alt_name = dek.key_alt_names().iter().next().cloned().unwrap_or_default();
            Err(StoreError::DuplicateKey { alt_name })
        }

        async fn count(&self) -> Result<usize, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_repeated_resolution_is_stable() {
        let backend = MemoryBackend::new();
        let vault = Arc::new(indexed_vault(&backend).await);
        let resolver = DekResolver::new(vault, providers(), "local");

        let first = resolver.resolve("memories-data-key").await.unwrap();
        assert_eq!(first.outcome, ResolutionOutcome::Created);

        for _ in 0..5 {
            let again = resolver.resolve("memories-data-key").await.unwrap();
            assert_eq!(again.key_id, first.key_id);
            assert_eq!(again.outcome, ResolutionOutcome::Existing);
        }
        assert_eq!(resolver.store().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_existing_key_does_not_touch_provider() {
        let backend = MemoryBackend::new();
        let vault = indexed_vault(&backend).await;
        let dek = DataEncryptionKey::new(["k1"], vec![1; 8], MasterKey::local("local"));
        vault.insert(&dek).await.unwrap();

        let provider = Arc::new(MockKeyProvider::new("local"));
        let mut providers = KmsProviders::new();
        providers.register(Arc::clone(&provider) as Arc<dyn KeyWrapProvider>);
        let resolver = DekResolver::new(Arc::new(vault), providers, "local");

        let resolved = resolver.resolve("k1").await.unwrap();
        assert_eq!(resolved.key_id, dek.id());
        assert_eq!(resolved.outcome, ResolutionOutcome::Existing);
        assert_eq!(provider.wraps.load(Ordering::SeqCst), 0);

        let created = resolver.resolve("k2").await.unwrap();
        assert_eq!(created.outcome, ResolutionOutcome::Created);
        assert_eq!(provider.wraps.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_resolution_converges() {
        const RACERS: usize = 8;

        let backend = MemoryBackend::new();
        let vault = Arc::new(RacingVault::new(indexed_vault(&backend).await, RACERS));

        let mut handles = Vec::new();
        for _ in 0..RACERS {
            // Each racer gets its own resolver, as separate processes would.
            let resolver = DekResolver::new(Arc::clone(&vault), providers(), "local");
            handles.push(tokio::spawn(async move { resolver.resolve("shared-key").await }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }

        let winner = results[0].key_id;
        assert!(results.iter().all(|r| r.key_id == winner));
        assert_eq!(results.iter().filter(|r| r.outcome == ResolutionOutcome::Created).count(), 1);
        assert_eq!(
            results.iter().filter(|r| r.outcome == ResolutionOutcome::AdoptedConcurrent).count(),
            RACERS - 1
        );
        assert_eq!(vault.count().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_independent_keys_resolve_concurrently() {
        let backend = MemoryBackend::new();
        let vault = Arc::new(indexed_vault(&backend).await);
        let a = DekResolver::new(Arc::clone(&vault), providers(), "local");
        let b = a.clone();

        let (ka, kb) = tokio::join!(a.resolve("k1"), b.resolve("k2"));
        let (ka, kb) = (ka.unwrap(), kb.unwrap());

        assert_ne!(ka.key_id, kb.key_id);
        assert_eq!(ka.outcome, ResolutionOutcome::Created);
        assert_eq!(kb.outcome, ResolutionOutcome::Created);
        assert_eq!(vault.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_inconsistent_vault_is_fatal() {
        let resolver = DekResolver::new(Arc::new(InconsistentVault), providers(), "local");

        let result = resolver.resolve("k1").await;
        assert!(matches!(result, Err(Error::KeyResolution { alt_name }) if alt_name == "k1"));
    }

    #[tokio::test]
    async fn test_unknown_provider_surfaces() {
        let backend = MemoryBackend::new();
        let vault = Arc::new(indexed_vault(&backend).await);
        let resolver = DekResolver::new(vault, providers(), "aws");

        let result = resolver.resolve("k1").await;
        assert!(matches!(
            result,
            Err(Error::KeyProvider(KeyProviderError::ProviderNotFound(_)))
        ));
        assert_eq!(resolver.store().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_blank_alt_name_rejected() {
        let backend = MemoryBackend::new();
        let vault = Arc::new(indexed_vault(&backend).await);
        let resolver = DekResolver::new(vault, providers(), "local");

        assert!(matches!(resolver.resolve("").await, Err(Error::InvalidAltName(_))));
    }

    #[tokio::test]
    async fn test_resolve_all_deduplicates() {
        let backend = MemoryBackend::new();
        let vault = Arc::new(indexed_vault(&backend).await);
        let resolver = DekResolver::new(vault, providers(), "local");

        let keys = resolver.resolve_all(["k1", "k2", "k1"]).await.unwrap();

        assert_eq!(keys.len(), 2);
        assert_ne!(keys.get("k1"), keys.get("k2"));
        assert_eq!(resolver.store().count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_wrapped_material_unwraps_to_dek_size() {
        use crate::kdf::DEK_SIZE;

        let backend = MemoryBackend::new();
        let vault = Arc::new(indexed_vault(&backend).await);
        let providers = providers();
        let resolver = DekResolver::new(Arc::clone(&vault), providers.clone(), "local");

        let resolved = resolver.resolve("k1").await.unwrap();
        let stored = vault.find_by_id(&resolved.key_id).await.unwrap().unwrap();
        let dek = providers.unwrap(stored.master_key(), stored.key_material()).await.unwrap();

        assert_eq!(dek.expose_secret().len(), DEK_SIZE);
    }
}
