//! Key vault documents and the store contract.
//!
//! A key vault is a collection of [`DataEncryptionKey`] documents. Each key
//! carries wrapped key material plus a set of human-readable alt-names. The
//! store enforces that an alt-name belongs to at most one key; that
//! constraint is what lets independent processes create keys without any
//! shared lock.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, StoreError};

/// Opaque identifier of a data encryption key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(Uuid);

impl KeyId {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the 16 raw bytes of the identifier.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Rebuilds an identifier from its raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl Default for KeyId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for KeyId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Describes the master key a DEK was wrapped under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterKey {
    /// Provider name, e.g. `local` or `aws`
    pub provider: String,
    /// Provider-specific key identifier (KMS key ARN); `None` for local keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl MasterKey {
    /// Master key descriptor for a provider without remote key ids.
    #[must_use]
    pub fn local(provider: impl Into<String>) -> Self {
        Self { provider: provider.into(), key: None }
    }
}

/// A data encryption key document as persisted in the key vault.
///
/// Keys are never mutated once inserted.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataEncryptionKey {
    #[serde(rename = "_id")]
    id: KeyId,
    key_alt_names: BTreeSet<String>,
    key_material: Vec<u8>,
    master_key: MasterKey,
    creation_date: DateTime<Utc>,
    update_date: DateTime<Utc>,
}

impl DataEncryptionKey {
    /// Creates a new key document with a fresh id.
    ///
    /// # Arguments
    ///
    /// * `alt_names` - Logical names the key can be looked up by
    /// * `key_material` - DEK bytes already wrapped by the key provider
    /// * `master_key` - Descriptor of the wrapping master key
    #[must_use]
    pub fn new(
        alt_names: impl IntoIterator<Item = impl Into<String>>,
        key_material: Vec<u8>,
        master_key: MasterKey,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: KeyId::new(),
            key_alt_names: alt_names.into_iter().map(Into::into).collect(),
            key_material,
            master_key,
            creation_date: now,
            update_date: now,
        }
    }

    /// Returns the key identifier.
    #[must_use]
    pub const fn id(&self) -> KeyId {
        self.id
    }

    /// Returns the alt-names carried by the key.
    #[must_use]
    pub const fn key_alt_names(&self) -> &BTreeSet<String> {
        &self.key_alt_names
    }

    /// Returns `true` if the key carries `alt_name`.
    #[must_use]
    pub fn has_alt_name(&self, alt_name: &str) -> bool {
        self.key_alt_names.contains(alt_name)
    }

    /// Returns the wrapped key material.
    #[must_use]
    pub fn key_material(&self) -> &[u8] {
        &self.key_material
    }

    /// Returns the master key descriptor.
    #[must_use]
    pub const fn master_key(&self) -> &MasterKey {
        &self.master_key
    }

    /// Returns the creation timestamp.
    #[must_use]
    pub const fn creation_date(&self) -> DateTime<Utc> {
        self.creation_date
    }

    /// Returns the last update timestamp.
    #[must_use]
    pub const fn update_date(&self) -> DateTime<Utc> {
        self.update_date
    }

    /// Reassembles a key document loaded from storage.
    #[must_use]
    pub fn from_parts(
        id: KeyId,
        key_alt_names: BTreeSet<String>,
        key_material: Vec<u8>,
        master_key: MasterKey,
        creation_date: DateTime<Utc>,
        update_date: DateTime<Utc>,
    ) -> Self {
        Self { id, key_alt_names, key_material, master_key, creation_date, update_date }
    }
}

impl fmt::Debug for DataEncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataEncryptionKey")
            .field("id", &self.id)
            .field("key_alt_names", &self.key_alt_names)
            .field("key_material", &format_args!("[{} bytes]", self.key_material.len()))
            .field("master_key", &self.master_key)
            .field("creation_date", &self.creation_date)
            .finish()
    }
}

/// Rejects alt-names that can never be looked up.
pub(crate) fn validate_alt_name(alt_name: &str) -> Result<(), Error> {
    if alt_name.trim().is_empty() {
        return Err(Error::InvalidAltName(alt_name.to_string()));
    }
    Ok(())
}

/// Accessor for the collection that persists data encryption keys.
///
/// Every method is a round trip to shared external storage. Implementations
/// must be safe to use from many tasks and from many processes at once.
#[async_trait]
pub trait KeyVaultStore: Send + Sync {
    /// Establishes the alt-name uniqueness constraint.
    ///
    /// The constraint only covers keys that carry at least one alt-name.
    /// Calling this repeatedly is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the constraint cannot be created.
    async fn ensure_index(&self) -> Result<(), StoreError>;

    /// Looks up the key carrying `alt_name`.
    ///
    /// # Errors
    ///
    /// Returns a `StoreError` if the lookup itself fails.
    async fn find_by_alt_name(&self, alt_name: &str)
        -> Result<Option<DataEncryptionKey>, StoreError>;

    /// Looks up a key by id.
    ///
    /// # Errors
    ///
    /// Returns a `StoreError` if the lookup itself fails.
    async fn find_by_id(&self, id: &KeyId) -> Result<Option<DataEncryptionKey>, StoreError>;

    /// Persists a new key.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::DuplicateKey` if another key already holds one
    /// of the alt-names. Callers must re-read instead of retrying.
    async fn insert(&self, dek: &DataEncryptionKey) -> Result<(), StoreError>;

    /// Returns the number of keys in the vault.
    ///
    /// # Errors
    ///
    /// Returns a `StoreError` if the count fails.
    async fn count(&self) -> Result<usize, StoreError>;
}
