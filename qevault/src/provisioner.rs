//! Idempotent provisioning of encrypted collections.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{Error, StoreError};
use crate::field_map::EncryptedFieldMap;
use crate::namespace::Namespace;

/// Catalog of encrypted collections kept by the backing store.
#[async_trait]
pub trait CollectionCatalog: Send + Sync {
    /// Creates `ns` with `field_map` attached.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::CollectionExists` if the collection already
    /// exists, or another `StoreError` if creation fails.
    async fn create_encrypted_collection(
        &self,
        ns: &Namespace,
        field_map: &EncryptedFieldMap,
    ) -> Result<(), StoreError>;

    /// Returns the field map attached to `ns`, if the collection exists.
    ///
    /// # Errors
    ///
    /// Returns a `StoreError` if the lookup fails.
    async fn encrypted_fields(&self, ns: &Namespace)
        -> Result<Option<EncryptedFieldMap>, StoreError>;
}

/// Result of [`EncryptedCollectionProvisioner::ensure_collection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// The collection was created by this call.
    Created,
    /// The collection was already provisioned.
    AlreadyExists,
}

/// Ensures encrypted collections exist with their field maps.
///
/// A namespace moves from unprovisioned to provisioned exactly once;
/// every later call reports [`ProvisionOutcome::AlreadyExists`].
pub struct EncryptedCollectionProvisioner<C: CollectionCatalog> {
    catalog: Arc<C>,
}

impl<C: CollectionCatalog> EncryptedCollectionProvisioner<C> {
    /// Creates a provisioner over `catalog`.
    pub const fn new(catalog: Arc<C>) -> Self {
        Self { catalog }
    }

    /// Creates the encrypted collection unless it already exists.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidFieldMap` if `field_map` was built for another namespace.
    /// - `Error::Store` for any creation failure other than "already exists".
    pub async fn ensure_collection(
        &self,
        ns: &Namespace,
        field_map: &EncryptedFieldMap,
    ) -> Result<ProvisionOutcome, Error> {
        if field_map.namespace() != ns {
            return Err(Error::InvalidFieldMap(format!(
                "field map targets {} but {ns} was requested",
                field_map.namespace()
            )));
        }

        match self.catalog.create_encrypted_collection(ns, field_map).await {
            Ok(()) => {
                info!(
                    namespace = %ns,
                    fields = field_map.fields().len(),
                    "encrypted collection created"
                );
                Ok(ProvisionOutcome::Created)
            }
            Err(StoreError::CollectionExists(_)) => {
                info!(namespace = %ns, "encrypted collection already exists");
                self.check_drift(ns, field_map).await;
                Ok(ProvisionOutcome::AlreadyExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn check_drift(&self, ns: &Namespace, requested: &EncryptedFieldMap) {
        match self.catalog.encrypted_fields(ns).await {
            Ok(Some(existing)) if existing != *requested => {
                warn!(
                    namespace = %ns,
                    "existing encrypted collection has a different field map, \
                     keeping the existing one"
                );
            }
            Ok(_) => {}
            Err(e) => debug!(namespace = %ns, error = %e, "could not read existing field map"),
        }
    }
}

impl<C: CollectionCatalog> Clone for EncryptedCollectionProvisioner<C> {
    fn clone(&self) -> Self {
        Self { catalog: Arc::clone(&self.catalog) }
    }
}
