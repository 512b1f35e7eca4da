//! Field value encryption under an unwrapped data key.
//!
//! Output layout is `[header][ciphertext]`, see [`crate::header`].
//! Randomized values use ChaCha20-Poly1305 with a fresh nonce; deterministic
//! values use AES-256-SIV. Both derive a per-field key from the DEK and bind
//! the field context as associated data.

use chacha20poly1305::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng, Payload},
    ChaCha20Poly1305, Nonce,
};
use secrecy::{ExposeSecret, SecretVec};

use crate::context::FieldContext;
use crate::deterministic::DeterministicCipher;
use crate::error::Error;
use crate::header::CiphertextHeader;
use crate::kdf::derive_subkey;
use crate::key_vault::KeyId;

/// Nonce size for ChaCha20-Poly1305 (96 bits).
const NONCE_SIZE: usize = 12;

/// ChaCha20-Poly1305 key size.
const AEAD_KEY_SIZE: usize = 32;

/// Cipher mode for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CipherMode {
    /// ChaCha20-Poly1305 with a random nonce (default).
    #[default]
    Randomized,
    /// AES-256-SIV; equal plaintexts give equal ciphertexts.
    Deterministic,
}

/// Encrypts and decrypts field values under one data key.
///
/// # Example
///
/// ```rust,ignore
/// use qevault::cipher::{CipherMode, FieldCipher};
///
/// let cipher = FieldCipher::new(key_id, dek);
/// let ct = cipher.encrypt(b"likes dogs", &ctx, CipherMode::Randomized)?;
/// assert_eq!(cipher.decrypt(&ct, &ctx)?, b"likes dogs");
/// ```
pub struct FieldCipher {
    key_id: KeyId,
    dek: SecretVec<u8>,
}

impl FieldCipher {
    /// Creates a cipher for the unwrapped DEK identified by `key_id`.
    #[must_use]
    pub const fn new(key_id: KeyId, dek: SecretVec<u8>) -> Self {
        Self { key_id, dek }
    }

    /// Returns the id of the data key.
    #[must_use]
    pub const fn key_id(&self) -> KeyId {
        self.key_id
    }

    /// Encrypts `plaintext` for the field described by `context`.
    ///
    /// # Errors
    ///
    /// Returns error if key derivation or encryption fails.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        context: &FieldContext,
        mode: CipherMode,
    ) -> Result<Vec<u8>, Error> {
        let (header, ciphertext) = match mode {
            CipherMode::Deterministic => {
                let cipher = DeterministicCipher::for_field(&self.dek, context)?;
                let header = CiphertextHeader::new(
                    self.key_id,
                    CipherMode::Deterministic,
                    Vec::new(),
                );
                (header, cipher.encrypt(plaintext, context)?)
            }
            CipherMode::Randomized => {
                let cipher = self.aead(context)?;

                let mut nonce_bytes = [0u8; NONCE_SIZE];
                OsRng.fill_bytes(&mut nonce_bytes);
                let nonce = Nonce::from(nonce_bytes);

                let aad = context.to_string();
                let ciphertext = cipher
                    .encrypt(&nonce, Payload { msg: plaintext, aad: aad.as_bytes() })
                    .map_err(|e| {
                        Error::Encryption(format!("ChaCha20-Poly1305 encryption failed: {e}"))
                    })?;

                let header =
                    CiphertextHeader::new(
                        self.key_id,
                        CipherMode::Randomized,
                        nonce_bytes.to_vec(),
                    );
                (header, ciphertext)
            }
        };

        let header_bytes = header.to_bytes()?;
        let mut result = Vec::with_capacity(header_bytes.len() + ciphertext.len());
        result.extend_from_slice(&header_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypts a value produced by [`FieldCipher::encrypt`].
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Header parsing fails
    /// - The value was encrypted under another data key
    /// - Authentication fails (corruption or wrong field context)
    pub fn decrypt(&self, data: &[u8], context: &FieldContext) -> Result<Vec<u8>, Error> {
        let (header, header_len) = CiphertextHeader::from_bytes(data)?;
        if header.key_id() != self.key_id {
            return Err(Error::Decryption(format!(
                "value was encrypted under key {}, not {}",
                header.key_id(),
                self.key_id
            )));
        }
        let ciphertext = &data[header_len..];

        if header.mode() == CipherMode::Deterministic {
            return DeterministicCipher::for_field(&self.dek, context)?.decrypt(ciphertext, context);
        }

        let nonce_bytes: [u8; NONCE_SIZE] = header
            .nonce()
            .try_into()
            .map_err(|_| Error::Decryption("Invalid nonce size".to_string()))?;
        let nonce = Nonce::from(nonce_bytes);

        let aad = context.to_string();
        self.aead(context)?
            .decrypt(&nonce, Payload { msg: ciphertext, aad: aad.as_bytes() })
            .map_err(|_| Error::AuthenticationFailed)
    }

    fn aead(&self, context: &FieldContext) -> Result<ChaCha20Poly1305, Error> {
        let key = derive_subkey(&self.dek, &context.derivation_info("rnd"), AEAD_KEY_SIZE)?;
        ChaCha20Poly1305::new_from_slice(key.expose_secret())
            .map_err(|e| Error::Encryption(format!("Invalid field key: {e}")))
    }
}

/// Reads the data key id out of an encrypted value without decrypting it.
///
/// # Errors
///
/// Returns error if the header is malformed.
pub fn key_id_of(data: &[u8]) -> Result<KeyId, Error> {
    CiphertextHeader::from_bytes(data).map(|(header, _)| header.key_id())
}
