//! Header format for encrypted field values.
//!
//! Every encrypted value carries a small header so it can be decrypted
//! without consulting the field map:
//! - Format version
//! - Id of the data key
//! - Flags (bit 0 set for deterministic values)
//! - Nonce (empty for deterministic values)

use crate::cipher::CipherMode;
use crate::error::Error;
use crate::key_vault::KeyId;

/// Format version for encrypted values.
pub const FORMAT_VERSION: u8 = 1;

/// Length of a key id on the wire.
const KEY_ID_LEN: usize = 16;

/// Flag bit marking a deterministic value.
const DETERMINISTIC_FLAG: u8 = 0x01;

const fn mode_flags(mode: CipherMode) -> u8 {
    match mode {
        CipherMode::Randomized => 0,
        CipherMode::Deterministic => DETERMINISTIC_FLAG,
    }
}

fn mode_from_flags(flags: u8) -> Result<CipherMode, Error> {
    match flags {
        0 => Ok(CipherMode::Randomized),
        DETERMINISTIC_FLAG => Ok(CipherMode::Deterministic),
        other => Err(Error::InvalidHeader(format!("unknown flags {other:#04x}"))),
    }
}

/// Metadata prefixed to every encrypted value.
///
/// Format:
/// ```text
/// [version:1][key_id:16][flags:1][nonce_len:1][nonce:L]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiphertextHeader {
    version: u8,
    key_id: KeyId,
    mode: CipherMode,
    nonce: Vec<u8>,
}

impl CiphertextHeader {
    /// Creates a new header.
    ///
    /// # Arguments
    ///
    /// * `key_id` - Id of the data key the value was encrypted under
    /// * `mode` - How the payload was encrypted
    /// * `nonce` - AEAD nonce, empty for deterministic values
    #[must_use]
    pub const fn new(key_id: KeyId, mode: CipherMode, nonce: Vec<u8>) -> Self {
        Self { version: FORMAT_VERSION, key_id, mode, nonce }
    }

    /// Returns the format version.
    #[must_use]
    pub const fn version(&self) -> u8 {
        self.version
    }

    /// Returns the data key id.
    #[must_use]
    pub const fn key_id(&self) -> KeyId {
        self.key_id
    }

    /// Returns the cipher mode recorded in the flags.
    #[must_use]
    pub const fn mode(&self) -> CipherMode {
        self.mode
    }

    /// Returns the nonce.
    #[must_use]
    pub fn nonce(&self) -> &[u8] {
        &self.nonce
    }

    /// Serializes the header to bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the nonce is longer than 255 bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        if self.nonce.len() > 255 {
            return Err(Error::InvalidHeader(format!(
                "Nonce too long: {} bytes (max: 255)",
                self.nonce.len()
            )));
        }

        let mut bytes = Vec::with_capacity(3 + KEY_ID_LEN + self.nonce.len());
        bytes.push(self.version);
        bytes.extend_from_slice(self.key_id.as_bytes());
        bytes.push(mode_flags(self.mode));

        // Safe cast: length validated above, max 255
        #[allow(clippy::cast_possible_truncation)]
        let nonce_len = self.nonce.len() as u8;
        bytes.push(nonce_len);
        bytes.extend_from_slice(&self.nonce);

        Ok(bytes)
    }

    /// Deserializes a header, returning it with the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The data is too short
    /// - The version is not supported
    /// - The data is malformed
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize), Error> {
        let Some(&version) = data.first() else {
            return Err(Error::InvalidHeader("Empty header data".to_string()));
        };
        let mut pos = 1;

        if version != FORMAT_VERSION {
            return Err(Error::UnsupportedVersion {
                version,
                supported: FORMAT_VERSION.to_string(),
            });
        }

        let key_id: [u8; KEY_ID_LEN] = data
            .get(pos..pos + KEY_ID_LEN)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| Error::InvalidHeader("Key id truncated".to_string()))?;
        pos += KEY_ID_LEN;

        let flags =
            *data.get(pos).ok_or_else(|| Error::InvalidHeader("Missing flags".to_string()))?;
        let mode = mode_from_flags(flags)?;
        pos += 1;

        let nonce_len = *data
            .get(pos)
            .ok_or_else(|| Error::InvalidHeader("Missing nonce length".to_string()))?
            as usize;
        pos += 1;

        let nonce = data
            .get(pos..pos + nonce_len)
            .ok_or_else(|| Error::InvalidHeader("Nonce truncated".to_string()))?
            .to_vec();
        pos += nonce_len;

        let header = Self { version, key_id: KeyId::from_bytes(key_id), mode, nonce };
        Ok((header, pos))
    }
}
