//! Local master key provider for `qevault`.
//!
//! Data keys are wrapped with a master key held in process memory, usually
//! loaded from a file. Suitable for development, testing and single-host
//! deployments; use a KMS-backed provider when the master key must never
//! leave an HSM.
//!
//! Key file layout: exactly 96 raw bytes, mode 0600 on unix.
//!
//! Wrapped format:
//! ```text
//! [nonce:12][ciphertext+tag]
//! ```

#![warn(clippy::pedantic, clippy::nursery)]

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

use async_trait::async_trait;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use qevault::error::KeyProviderError;
use qevault::key_provider::KeyWrapProvider;
use qevault::key_vault::MasterKey;
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretVec};
use sha2::Sha256;
use tracing::info;
use zeroize::Zeroizing;

/// Provider name recorded on every DEK this provider wraps.
pub const PROVIDER_NAME: &str = "local";

/// Required master key length in bytes.
pub const MASTER_KEY_SIZE: usize = 96;

const NONCE_SIZE: usize = 12;
const WRAP_AAD: &[u8] = b"qevault-dek";
const KEK_INFO: &[u8] = b"qevault-local-kek";

/// Key wrap provider backed by a local master key.
pub struct LocalKeyProvider {
    kek: SecretVec<u8>,
}

impl LocalKeyProvider {
    /// Creates a provider from master key bytes.
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::InvalidMasterKey` unless the key is exactly
    /// 96 bytes.
    pub fn new(master_key: &SecretVec<u8>) -> Result<Self, KeyProviderError> {
        let bytes = master_key.expose_secret();
        if bytes.len() != MASTER_KEY_SIZE {
            return Err(KeyProviderError::InvalidMasterKey(format!(
                "expected {MASTER_KEY_SIZE} bytes, got {}",
                bytes.len()
            )));
        }

        let hkdf = Hkdf::<Sha256>::new(None, bytes);
        let mut kek = vec![0u8; 32];
        hkdf.expand(KEK_INFO, &mut kek)
            .map_err(|_| KeyProviderError::InvalidMasterKey("KEK derivation failed".to_string()))?;

        Ok(Self { kek: SecretVec::new(kek) })
    }

    /// Generates fresh master key bytes.
    #[must_use]
    pub fn generate_master_key() -> SecretVec<u8> {
        let mut key = vec![0u8; MASTER_KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        SecretVec::new(key)
    }

    /// Writes a fresh master key to `path`.
    ///
    /// # Errors
    ///
    /// Returns error if the file already exists or cannot be written.
    pub fn init(path: impl AsRef<Path>) -> Result<(), KeyProviderError> {
        let path = path.as_ref();
        let key = Self::generate_master_key();

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(path).map_err(|e| {
            if e.kind() == ErrorKind::AlreadyExists {
                KeyProviderError::InvalidMasterKey(format!(
                    "refusing to overwrite existing key file {}",
                    path.display()
                ))
            } else {
                KeyProviderError::Io(e)
            }
        })?;
        file.write_all(key.expose_secret())?;
        file.sync_all()?;

        info!(path = %path.display(), "wrote new local master key");
        Ok(())
    }

    /// Loads the master key stored at `path`.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or has the wrong length.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, KeyProviderError> {
        let bytes = Zeroizing::new(fs::read(path.as_ref())?);
        Self::new(&SecretVec::new(bytes.to_vec()))
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305, KeyProviderError> {
        ChaCha20Poly1305::new_from_slice(self.kek.expose_secret())
            .map_err(|e| KeyProviderError::InvalidMasterKey(e.to_string()))
    }
}

#[async_trait]
impl KeyWrapProvider for LocalKeyProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn master_key(&self) -> MasterKey {
        MasterKey::local(PROVIDER_NAME)
    }

    async fn wrap(&self, dek: &[u8]) -> Result<Vec<u8>, KeyProviderError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher()?
            .encrypt(&Nonce::from(nonce_bytes), Payload { msg: dek, aad: WRAP_AAD })
            .map_err(|e| KeyProviderError::WrapFailed(e.to_string()))?;

        let mut wrapped = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        wrapped.extend_from_slice(&nonce_bytes);
        wrapped.extend_from_slice(&ciphertext);
        Ok(wrapped)
    }

    async fn unwrap(
        &self,
        master_key: &MasterKey,
        wrapped: &[u8],
    ) -> Result<SecretVec<u8>, KeyProviderError> {
        if master_key.provider != PROVIDER_NAME {
            return Err(KeyProviderError::UnwrapFailed(format!(
                "key was wrapped by provider `{}`",
                master_key.provider
            )));
        }
        if wrapped.len() < NONCE_SIZE {
            return Err(KeyProviderError::UnwrapFailed("wrapped key truncated".to_string()));
        }

        let (nonce, ciphertext) = wrapped.split_at(NONCE_SIZE);
        let dek = self
            .cipher()?
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad: WRAP_AAD })
            .map_err(|_| {
                KeyProviderError::UnwrapFailed(
                    "authentication failed (wrong master key?)".to_string(),
                )
            })?;
        Ok(SecretVec::new(dek))
    }
}
