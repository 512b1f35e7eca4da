//! Error types for `qevault` operations.

use std::fmt;

use crate::key_vault::KeyId;
use crate::namespace::Namespace;

/// Main error type for `qevault` operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Key provider operation failed
    #[error("key provider error: {0}")]
    KeyProvider(#[from] KeyProviderError),

    /// Backing store operation failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The key vault rejected an insert as a duplicate but the winning key
    /// could not be read back.
    #[error("key vault is inconsistent: insert of `{alt_name}` conflicted but no key carries it")]
    KeyResolution {
        /// The alt-name being resolved
        alt_name: String,
    },

    /// A field declaration references an alt-name that was never resolved.
    #[error("field `{path}` references unresolved key alt-name `{alt_name}`")]
    UnresolvedKey {
        /// Field path of the offending declaration
        path: String,
        /// Alt-name missing from the resolved mapping
        alt_name: String,
    },

    /// The encrypted field map is structurally invalid.
    #[error("invalid encrypted field map: {0}")]
    InvalidFieldMap(String),

    /// A key alt-name is empty or otherwise unusable.
    #[error("invalid key alt-name: {0:?}")]
    InvalidAltName(String),

    /// A namespace string or pair is malformed.
    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A field map references a key that is missing from the vault.
    #[error("data key {0} not found in key vault")]
    KeyNotFound(KeyId),

    /// A document value does not match the declared field type.
    #[error("field `{path}` must be of type {expected}")]
    FieldTypeMismatch {
        /// Field path
        path: String,
        /// Declared BSON type
        expected: String,
    },

    /// A query filter targets an encrypted field without query support.
    #[error("field `{0}` is encrypted without query support")]
    UnqueryableField(String),

    /// Key material has the wrong length.
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Required length
        expected: usize,
        /// Supplied length
        actual: usize,
    },

    /// Encryption operation failed
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption operation failed
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Authentication tag verification failed (data may be corrupted or tampered)
    #[error("authentication failed: ciphertext may be corrupted or tampered")]
    AuthenticationFailed,

    /// Ciphertext header parsing failed
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// Unsupported ciphertext version
    #[error("unsupported version: {version} (supported: {supported})")]
    UnsupportedVersion {
        /// The version found in the ciphertext
        version: u8,
        /// Supported versions
        supported: String,
    },

    /// Key derivation failed
    #[error("key derivation failed")]
    KeyDerivation,

    /// Document (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors reported by a backing store.
///
/// `DuplicateKey` and `CollectionExists` are distinct so callers can treat
/// them as signals rather than failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Another key already carries this alt-name.
    #[error("duplicate key alt-name: {alt_name}")]
    DuplicateKey {
        /// The conflicting alt-name
        alt_name: String,
    },

    /// The encrypted collection already exists.
    #[error("collection {0} already exists")]
    CollectionExists(Namespace),

    /// The operation did not complete in time.
    #[error("store operation timed out: {0}")]
    Timeout(String),

    /// Any other backend failure (I/O, auth, malformed data).
    #[error("{0}")]
    Backend(String),
}

/// Errors specific to key provider operations.
#[derive(Debug)]
pub enum KeyProviderError {
    /// No provider is registered under this name
    ProviderNotFound(String),

    /// Master key material is missing or malformed
    InvalidMasterKey(String),

    /// DEK wrapping failed
    WrapFailed(String),

    /// DEK unwrapping failed
    UnwrapFailed(String),

    /// I/O operation failed
    Io(std::io::Error),
}

impl fmt::Display for KeyProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProviderNotFound(name) => write!(f, "KMS provider not configured: {name}"),
            Self::InvalidMasterKey(msg) => write!(f, "invalid master key: {msg}"),
            Self::WrapFailed(msg) => write!(f, "DEK wrap failed: {msg}"),
            Self::UnwrapFailed(msg) => write!(f, "DEK unwrap failed: {msg}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for KeyProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for KeyProviderError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}
