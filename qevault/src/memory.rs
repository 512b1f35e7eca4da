//! In-process backing store.
//!
//! [`MemoryBackend`] stands in for the shared database: clones share the same
//! state, so several resolvers built from clones behave like independent
//! processes talking to one server. It enforces the same rules a real store
//! does: alt-name uniqueness once the index exists, and a distinct
//! "already exists" error for collections.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::document::{id_key, matches_filter, Document, DocumentStore};
use crate::error::StoreError;
use crate::field_map::EncryptedFieldMap;
use crate::key_vault::{DataEncryptionKey, KeyId, KeyVaultStore};
use crate::namespace::Namespace;
use crate::provisioner::CollectionCatalog;

#[derive(Default)]
struct VaultState {
    keys: Vec<DataEncryptionKey>,
    alt_name_index: bool,
}

#[derive(Default)]
struct State {
    /// key vault namespace → keys
    vaults: HashMap<Namespace, VaultState>,
    /// encrypted collection namespace → field map
    collections: HashMap<Namespace, EncryptedFieldMap>,
    /// collection namespace → documents in insertion order
    documents: HashMap<Namespace, Vec<Document>>,
}

/// Shared in-memory database.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns an accessor for the key vault stored at `ns`.
    #[must_use]
    pub fn key_vault(&self, ns: Namespace) -> MemoryKeyVault {
        MemoryKeyVault { backend: self.clone(), ns }
    }
}

/// Key vault collection inside a [`MemoryBackend`].
#[derive(Clone)]
pub struct MemoryKeyVault {
    backend: MemoryBackend,
    ns: Namespace,
}

impl MemoryKeyVault {
    /// Returns the vault namespace.
    #[must_use]
    pub const fn namespace(&self) -> &Namespace {
        &self.ns
    }
}

#[async_trait]
impl KeyVaultStore for MemoryKeyVault {
    async fn ensure_index(&self) -> Result<(), StoreError> {
        let mut state = self.backend.state.lock();
        let vault = state.vaults.entry(self.ns.clone()).or_default();
        if vault.alt_name_index {
            return Ok(());
        }

        // Building a unique index fails if the data already violates it.
        let mut seen = std::collections::HashSet::new();
        for name in vault.keys.iter().flat_map(|k| k.key_alt_names()) {
            if !seen.insert(name) {
                return Err(StoreError::Backend(format!(
                    "cannot build unique alt-name index: `{name}` is held by several keys"
                )));
            }
        }
        vault.alt_name_index = true;
        Ok(())
    }

    async fn find_by_alt_name(
        &self,
        alt_name: &str,
    ) -> Result<Option<DataEncryptionKey>, StoreError> {
        let state = self.backend.state.lock();
        Ok(state
            .vaults
            .get(&self.ns)
            .and_then(|v| v.keys.iter().find(|k| k.has_alt_name(alt_name)))
            .cloned())
    }

    async fn find_by_id(&self, id: &KeyId) -> Result<Option<DataEncryptionKey>, StoreError> {
        let state = self.backend.state.lock();
        Ok(state
            .vaults
            .get(&self.ns)
            .and_then(|v| v.keys.iter().find(|k| k.id() == *id))
            .cloned())
    }

    async fn insert(&self, dek: &DataEncryptionKey) -> Result<(), StoreError> {
        let mut state = self.backend.state.lock();
        let vault = state.vaults.entry(self.ns.clone()).or_default();

        if vault.keys.iter().any(|k| k.id() == dek.id()) {
            return Err(StoreError::Backend(format!("key {} already exists", dek.id())));
        }
        if vault.alt_name_index {
            if let Some(taken) = dek
                .key_alt_names()
                .iter()
                .find(|name| vault.keys.iter().any(|k| k.has_alt_name(name)))
            {
                return Err(StoreError::DuplicateKey { alt_name: taken.clone() });
            }
        }

        vault.keys.push(dek.clone());
        Ok(())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let state = self.backend.state.lock();
        Ok(state.vaults.get(&self.ns).map_or(0, |v| v.keys.len()))
    }
}

#[async_trait]
impl CollectionCatalog for MemoryBackend {
    async fn create_encrypted_collection(
        &self,
        ns: &Namespace,
        field_map: &EncryptedFieldMap,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.collections.contains_key(ns) {
            return Err(StoreError::CollectionExists(ns.clone()));
        }
        state.collections.insert(ns.clone(), field_map.clone());
        Ok(())
    }

    async fn encrypted_fields(
        &self,
        ns: &Namespace,
    ) -> Result<Option<EncryptedFieldMap>, StoreError> {
        Ok(self.state.lock().collections.get(ns).cloned())
    }
}

#[async_trait]
impl DocumentStore for MemoryBackend {
    async fn insert_document(&self, ns: &Namespace, doc: Document) -> Result<(), StoreError> {
        let id = doc
            .get("_id")
            .map(id_key)
            .ok_or_else(|| StoreError::Backend("document has no _id".to_string()))?;

        let mut state = self.state.lock();
        let docs = state.documents.entry(ns.clone()).or_default();
        if docs.iter().any(|d| d.get("_id").map(id_key).as_deref() == Some(id.as_str())) {
            return Err(StoreError::Backend(format!("duplicate _id `{id}` in {ns}")));
        }
        docs.push(doc);
        Ok(())
    }

    async fn find_documents(
        &self,
        ns: &Namespace,
        filter: &Document,
    ) -> Result<Vec<Document>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .documents
            .get(ns)
            .map(|docs| docs.iter().filter(|d| matches_filter(d, filter)).cloned().collect())
            .unwrap_or_default())
    }

    async fn drop_collection(&self, ns: &Namespace) -> Result<(), StoreError> {
        self.state.lock().documents.remove(ns);
        Ok(())
    }
}
