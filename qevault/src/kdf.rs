//! Data key generation and sub-key derivation.
//!
//! A data encryption key (DEK) is 96 random bytes. Field ciphers never use it
//! directly: each field derives its own sub-key with HKDF-SHA256, using the
//! field context as the `info` parameter for domain separation.

use crate::error::Error;
use hkdf::Hkdf;
use secrecy::{ExposeSecret, SecretVec};
use sha2::Sha256;

/// DEK size in bytes.
pub const DEK_SIZE: usize = 96;

/// Derives a sub-key of `len` bytes from a DEK using HKDF.
///
/// # Arguments
///
/// * `dek` - The unwrapped data encryption key
/// * `info` - Domain separation string (cipher mode and field context)
/// * `len` - Output length in bytes
///
/// # Errors
///
/// Returns `Error::KeyDerivation` if `len` exceeds the HKDF output limit.
///
/// # Example
///
/// ```
/// use qevault::kdf::{derive_subkey, generate_dek};
/// use secrecy::ExposeSecret;
///
/// let dek = generate_dek();
/// let key = derive_subkey(&dek, "rnd|users.memories|memory", 32).unwrap();
/// assert_eq!(key.expose_secret().len(), 32);
/// ```
pub fn derive_subkey(dek: &SecretVec<u8>, info: &str, len: usize) -> Result<SecretVec<u8>, Error> {
    let hkdf = Hkdf::<Sha256>::new(None, dek.expose_secret());

    let mut key = vec![0u8; len];
    hkdf.expand(info.as_bytes(), &mut key).map_err(|_| Error::KeyDerivation)?;

    Ok(SecretVec::new(key))
}

/// Generates a random DEK.
///
/// The DEK must be wrapped by a key provider before it is stored.
///
/// # Example
///
/// ```
/// use qevault::kdf::{generate_dek, DEK_SIZE};
/// use secrecy::ExposeSecret;
///
/// let dek = generate_dek();
/// assert_eq!(dek.expose_secret().len(), DEK_SIZE);
/// ```
#[must_use]
pub fn generate_dek() -> SecretVec<u8> {
    use chacha20poly1305::aead::{rand_core::RngCore, OsRng};

    let mut dek = vec![0u8; DEK_SIZE];
    OsRng.fill_bytes(&mut dek);
    SecretVec::new(dek)
}
