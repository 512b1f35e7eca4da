//! Deterministic encryption using AES-SIV for equality queries.
//!
//! AES-SIV (Synthetic IV) is a misuse-resistant authenticated encryption mode
//! that produces deterministic output for the same plaintext and context.
//! Equality-queryable fields use it so that an encrypted filter value matches
//! the stored ciphertext byte for byte.
//!
//! # Security Properties
//!
//! - **Deterministic**: Same plaintext + key + context → same ciphertext
//! - **Misuse-resistant**: Safe even with nonce reuse
//! - **Authenticated**: Provides confidentiality and authenticity
//! - **Context-bound**: Different fields produce different ciphertexts
//!
//! # Security Warning
//!
//! Deterministic encryption reveals equality patterns. Declare a field
//! queryable only when it must be filtered on.

use aes_siv::{
    aead::{Aead, KeyInit, Payload},
    Aes256SivAead,
};
use secrecy::{ExposeSecret, SecretVec};
use zeroize::Zeroizing;

use crate::context::FieldContext;
use crate::error::Error;
use crate::kdf::derive_subkey;

/// AES-256-SIV key size in bytes.
pub const SIV_KEY_SIZE: usize = 64;

/// Deterministic encryption using AES-256-SIV.
///
/// # Example
///
/// ```rust,ignore
/// use qevault::context::FieldContext;
/// use qevault::deterministic::DeterministicCipher;
///
/// let ctx = FieldContext::new("test.coll".parse()?, "email");
/// let cipher = DeterministicCipher::for_field(&dek, &ctx)?;
///
/// let ct1 = cipher.encrypt(b"alice@example.com", &ctx)?;
/// let ct2 = cipher.encrypt(b"alice@example.com", &ctx)?;
/// assert_eq!(ct1, ct2);
/// ```
pub struct DeterministicCipher {
    key: SecretVec<u8>,
}

impl DeterministicCipher {
    /// Creates a cipher from a raw AES-256-SIV key.
    ///
    /// # Errors
    ///
    /// Returns an error if the key length is not 64 bytes.
    pub fn new(key: SecretVec<u8>) -> Result<Self, Error> {
        if key.expose_secret().len() != SIV_KEY_SIZE {
            return Err(Error::InvalidKeyLength {
                expected: SIV_KEY_SIZE,
                actual: key.expose_secret().len(),
            });
        }
        Ok(Self { key })
    }

    /// Creates the cipher for one field, deriving its key from the DEK.
    ///
    /// # Errors
    ///
    /// Returns an error if key derivation fails.
    pub fn for_field(dek: &SecretVec<u8>, context: &FieldContext) -> Result<Self, Error> {
        Self::new(derive_subkey(dek, &context.derivation_info("det"), SIV_KEY_SIZE)?)
    }

    /// Encrypts plaintext deterministically.
    ///
    /// The context is used as associated data, so the same plaintext in two
    /// fields produces two different ciphertexts.
    ///
    /// # Errors
    ///
    /// Returns an error if encryption fails.
    pub fn encrypt(&self, plaintext: &[u8], context: &FieldContext) -> Result<Vec<u8>, Error> {
        let cipher = Aes256SivAead::new_from_slice(self.key.expose_secret())
            .map_err(|e| Error::Encryption(format!("Failed to create AES-SIV cipher: {e}")))?;

        let aad = Zeroizing::new(context.to_string().into_bytes());
        let payload = Payload { msg: plaintext, aad: &aad };

        // AES-SIV is deterministic - uses empty nonce
        cipher
            .encrypt(&Default::default(), payload)
            .map_err(|e| Error::Encryption(format!("AES-SIV encryption failed: {e}")))
    }

    /// Decrypts ciphertext produced under the same key and context.
    ///
    /// # Errors
    ///
    /// Returns `Error::AuthenticationFailed` if the ciphertext is corrupted
    /// or the context does not match.
    pub fn decrypt(&self, ciphertext: &[u8], context: &FieldContext) -> Result<Vec<u8>, Error> {
        let cipher = Aes256SivAead::new_from_slice(self.key.expose_secret())
            .map_err(|e| Error::Decryption(format!("Failed to create AES-SIV cipher: {e}")))?;

        let aad = Zeroizing::new(context.to_string().into_bytes());
        let payload = Payload { msg: ciphertext, aad: &aad };

        cipher.decrypt(&Default::default(), payload).map_err(|_| Error::AuthenticationFailed)
    }
}
