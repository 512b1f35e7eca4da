//! # `qevault`
//!
//! Data encryption key lifecycle and encrypted field maps for queryable
//! field-level encryption.
//!
//! ## Features
//!
//! - Idempotent key resolution by alt-name, safe across racing processes
//! - Pure, validated construction of encrypted field maps
//! - Idempotent provisioning of encrypted collections
//! - Envelope encryption with pluggable key wrap providers (local, AWS KMS)
//! - Deterministic encryption (AES-SIV) for equality-queryable fields
//! - Randomized encryption (ChaCha20-Poly1305) for everything else
//!
//! ## Example
//!
//! ```rust,ignore
//! use qevault::prelude::*;
//!
//! let backend = MemoryBackend::new();
//! let vault = Arc::new(backend.key_vault("encryption.__keyVault".parse()?));
//! vault.ensure_index().await?;
//!
//! let resolver = DekResolver::new(Arc::clone(&vault), providers.clone(), "local");
//! let builder = EncryptedFieldMapBuilder::new("test.coll".parse()?)
//!     .field(
//!         FieldDeclaration::new("email", BsonType::String, "k1")
//!             .with_queries(QueryType::Equality),
//!     )
//!     .field(FieldDeclaration::new("memory", BsonType::String, "k2"));
//! let keys = resolver.resolve_all(builder.alt_names()).await?;
//! let map = builder.build(&keys)?;
//!
//! let provisioner = EncryptedCollectionProvisioner::new(Arc::new(backend.clone()));
//! provisioner.ensure_collection(map.namespace(), &map).await?;
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod cipher;
pub mod config;
pub mod context;
pub mod deterministic;
pub mod document;
pub mod error;
pub mod field_map;
pub mod header;
pub mod kdf;
pub mod key_provider;
pub mod key_vault;
pub mod memory;
pub mod namespace;
pub mod provisioner;
pub mod resolver;
pub mod session;

pub mod prelude {
    //! Convenience re-exports for common use.
    pub use crate::config::VaultConfig;
    pub use crate::document::{Document, DocumentStore};
    pub use crate::error::{Error, KeyProviderError, StoreError};
    pub use crate::field_map::{
        BsonType, EncryptedFieldMap, EncryptedFieldMapBuilder, EncryptedFields, FieldDeclaration,
        QueryType, ResolvedKeys,
    };
    pub use crate::key_provider::{KeyWrapProvider, KmsProviders};
    pub use crate::key_vault::{DataEncryptionKey, KeyId, KeyVaultStore, MasterKey};
    pub use crate::memory::{MemoryBackend, MemoryKeyVault};
    pub use crate::namespace::Namespace;
    pub use crate::provisioner::{
        CollectionCatalog, EncryptedCollectionProvisioner, ProvisionOutcome,
    };
    pub use crate::resolver::{DekResolver, ResolutionOutcome, ResolvedKey};
    pub use crate::session::EncryptedSession;
}
