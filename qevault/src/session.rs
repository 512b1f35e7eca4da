//! Client-side encrypted reads and writes.
//!
//! An [`EncryptedSession`] applies one collection's [`EncryptedFieldMap`]:
//! declared fields are encrypted before a document reaches the store, and
//! decrypted on the way back. Equality-queryable fields are encrypted
//! deterministically so filters on them can be encrypted and matched
//! server-side. Everything else uses randomized encryption.
//!
//! Encrypted values are stored as extended-JSON binary of subtype `06`:
//!
//! ```text
//! {"$binary": {"base64": "<header||ciphertext>", "subType": "06"}}
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::cipher::{key_id_of, CipherMode, FieldCipher};
use crate::context::FieldContext;
use crate::document::{get_path, get_path_mut, Document, DocumentStore};
use crate::error::Error;
use crate::field_map::{BsonType, EncryptedFieldMap, FieldSpec};
use crate::key_provider::KmsProviders;
use crate::key_vault::{KeyId, KeyVaultStore};
use crate::namespace::Namespace;

/// Binary subtype of encrypted values.
pub const ENCRYPTED_SUBTYPE: &str = "06";

/// Reads and writes one collection through its encrypted field map.
pub struct EncryptedSession<K: KeyVaultStore, D: DocumentStore> {
    key_vault: Arc<K>,
    documents: Arc<D>,
    providers: KmsProviders,
    field_map: EncryptedFieldMap,
}

impl<K: KeyVaultStore, D: DocumentStore> EncryptedSession<K, D> {
    /// Creates a session for the collection `field_map` describes.
    pub const fn new(
        key_vault: Arc<K>,
        documents: Arc<D>,
        providers: KmsProviders,
        field_map: EncryptedFieldMap,
    ) -> Self {
        Self { key_vault, documents, providers, field_map }
    }

    /// Returns the collection namespace.
    #[must_use]
    pub const fn namespace(&self) -> &Namespace {
        self.field_map.namespace()
    }

    /// Returns the field map in use.
    #[must_use]
    pub const fn field_map(&self) -> &EncryptedFieldMap {
        &self.field_map
    }

    /// Encrypts the declared fields of `doc` and stores it.
    ///
    /// A random string `_id` is assigned when the document has none.
    /// Declared fields absent from the document are skipped.
    ///
    /// Returns the document's `_id`.
    ///
    /// # Errors
    ///
    /// - `Error::FieldTypeMismatch` if a value does not match its declared type.
    /// - `Error::KeyNotFound` if a referenced data key is missing from the vault.
    /// - `Error::KeyProvider` / `Error::Store` for provider or store failures.
    pub async fn insert_one(&self, mut doc: Document) -> Result<Value, Error> {
        let id = doc
            .entry("_id")
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()))
            .clone();

        let mut ciphers = CipherCache::default();
        for spec in self.field_map.fields() {
            let Some(value) = get_path_mut(&mut doc, &spec.path) else {
                continue;
            };
            let cipher = ciphers.get(self, spec.key_id).await?;
            *value = self.encrypt_field(cipher, spec, value)?;
        }

        self.documents.insert_document(self.namespace(), doc).await?;
        debug!(namespace = %self.namespace(), id = %id, "inserted encrypted document");
        Ok(id)
    }

    /// Returns every document matching the equality `filter`, decrypted.
    ///
    /// Filter values on encrypted fields are encrypted before the query is
    /// sent; only equality-queryable fields may appear in the filter.
    ///
    /// # Errors
    ///
    /// - `Error::UnqueryableField` if the filter targets an encrypted field
    ///   without equality support, or a path inside one.
    /// - `Error::FieldTypeMismatch` if a filter value does not match its field type.
    /// - Any error from decrypting the results.
    pub async fn find(&self, filter: &Document) -> Result<Vec<Document>, Error> {
        let encrypted_filter = self.encrypt_filter(filter).await?;
        let raw = self.documents.find_documents(self.namespace(), &encrypted_filter).await?;
        debug!(namespace = %self.namespace(), matches = raw.len(), "encrypted query");

        let mut ciphers = CipherCache::default();
        let mut results = Vec::with_capacity(raw.len());
        for doc in raw {
            results.push(self.decrypt_with(&mut ciphers, doc).await?);
        }
        Ok(results)
    }

    /// Returns the first document matching `filter`, decrypted.
    ///
    /// # Errors
    ///
    /// See [`EncryptedSession::find`].
    pub async fn find_one(&self, filter: &Document) -> Result<Option<Document>, Error> {
        Ok(self.find(filter).await?.into_iter().next())
    }

    /// Decrypts the declared fields of a raw document.
    ///
    /// Fields that are absent or not encrypted are left as they are.
    ///
    /// # Errors
    ///
    /// Returns an error if a data key cannot be loaded or a value fails to decrypt.
    pub async fn decrypt_document(&self, doc: Document) -> Result<Document, Error> {
        self.decrypt_with(&mut CipherCache::default(), doc).await
    }

    async fn decrypt_with(
        &self,
        ciphers: &mut CipherCache,
        mut doc: Document,
    ) -> Result<Document, Error> {
        for spec in self.field_map.fields() {
            let Some(value) = get_path_mut(&mut doc, &spec.path) else {
                continue;
            };
            let Some(data) = decode_encrypted(value)? else {
                continue;
            };

            let cipher = ciphers.get(self, key_id_of(&data)?).await?;
            let plaintext = cipher.decrypt(&data, &self.context(spec))?;
            *value = serde_json::from_slice(&plaintext)?;
        }
        Ok(doc)
    }

    async fn encrypt_filter(&self, filter: &Document) -> Result<Document, Error> {
        let mut ciphers = CipherCache::default();
        let mut encrypted = Document::new();

        for (path, value) in filter {
            if let Some(enclosing) = self.enclosing_field(path) {
                return Err(Error::UnqueryableField(enclosing.path.clone()));
            }
            let value = match self.field_map.field(path) {
                Some(spec) if spec.is_equality_queryable() => {
                    let cipher = ciphers.get(self, spec.key_id).await?;
                    self.encrypt_field(cipher, spec, value)?
                }
                Some(spec) => return Err(Error::UnqueryableField(spec.path.clone())),
                None => value.clone(),
            };
            encrypted.insert(path.clone(), value);
        }
        Ok(encrypted)
    }

    /// Finds an encrypted field that strictly contains `path`.
    fn enclosing_field(&self, path: &str) -> Option<&FieldSpec> {
        self.field_map.fields().iter().find(|spec| {
            path.strip_prefix(spec.path.as_str()).is_some_and(|rest| rest.starts_with('.'))
        })
    }

    fn encrypt_field(
        &self,
        cipher: &FieldCipher,
        spec: &FieldSpec,
        value: &Value,
    ) -> Result<Value, Error> {
        if !matches_type(value, spec.bson_type) {
            return Err(Error::FieldTypeMismatch {
                path: spec.path.clone(),
                expected: spec.bson_type.to_string(),
            });
        }

        let mode = if spec.is_equality_queryable() {
            CipherMode::Deterministic
        } else {
            CipherMode::Randomized
        };
        let plaintext = serde_json::to_vec(value)?;
        let data = cipher.encrypt(&plaintext, &self.context(spec), mode)?;
        Ok(encode_encrypted(&data))
    }

    fn context(&self, spec: &FieldSpec) -> FieldContext {
        FieldContext::new(self.namespace().clone(), spec.path.clone())
    }

    async fn load_cipher(&self, key_id: KeyId) -> Result<FieldCipher, Error> {
        let dek = self.key_vault.find_by_id(&key_id).await?.ok_or(Error::KeyNotFound(key_id))?;
        let plaintext = self.providers.unwrap(dek.master_key(), dek.key_material()).await?;
        Ok(FieldCipher::new(key_id, plaintext))
    }
}

/// Unwrapped data keys for the duration of one operation.
#[derive(Default)]
struct CipherCache(HashMap<KeyId, FieldCipher>);

impl CipherCache {
    async fn get<K: KeyVaultStore, D: DocumentStore>(
        &mut self,
        session: &EncryptedSession<K, D>,
        key_id: KeyId,
    ) -> Result<&FieldCipher, Error> {
        if !self.0.contains_key(&key_id) {
            let cipher = session.load_cipher(key_id).await?;
            self.0.insert(key_id, cipher);
        }
        self.0.get(&key_id).ok_or(Error::KeyNotFound(key_id))
    }
}

/// Wraps encrypted bytes as extended-JSON binary.
#[must_use]
pub fn encode_encrypted(data: &[u8]) -> Value {
    json!({ "$binary": { "base64": STANDARD.encode(data), "subType": ENCRYPTED_SUBTYPE } })
}

/// Extracts encrypted bytes from an extended-JSON binary value.
///
/// Returns `Ok(None)` if `value` is not an encrypted binary.
///
/// # Errors
///
/// Returns `Error::Decryption` if the payload is not valid base64.
pub fn decode_encrypted(value: &Value) -> Result<Option<Vec<u8>>, Error> {
    let Some(binary) = value.get("$binary") else {
        return Ok(None);
    };
    if binary.get("subType").and_then(Value::as_str) != Some(ENCRYPTED_SUBTYPE) {
        return Ok(None);
    }
    let Some(encoded) = binary.get("base64").and_then(Value::as_str) else {
        return Ok(None);
    };
    STANDARD
        .decode(encoded)
        .map(Some)
        .map_err(|e| Error::Decryption(format!("invalid base64 payload: {e}")))
}

/// Returns `true` if `value` is a valid instance of `bson_type`.
fn matches_type(value: &Value, bson_type: BsonType) -> bool {
    match bson_type {
        BsonType::String => value.is_string(),
        BsonType::Object => value.is_object() && !is_extended(value),
        BsonType::Int => value.as_i64().is_some_and(|n| i32::try_from(n).is_ok()),
        BsonType::Long => value.as_i64().is_some(),
        BsonType::Double => value.is_number(),
        BsonType::Bool => value.is_boolean(),
        BsonType::Date => {
            value.get("$date").is_some()
                || value
                    .as_str()
                    .is_some_and(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok())
        }
        BsonType::BinData => value.get("$binary").is_some(),
        BsonType::Array => value.is_array(),
        BsonType::Decimal => value.is_number() || value.get("$numberDecimal").is_some(),
    }
}

/// Extended-JSON wrappers such as `{"$date": ..}` are not plain objects.
fn is_extended(value: &Value) -> bool {
    value.as_object().is_some_and(|o| o.keys().any(|k| k.starts_with('$')))
}

/// Returns `true` if the raw value at `path` is an encrypted binary.
#[must_use]
pub fn is_encrypted_at(doc: &Document, path: &str) -> bool {
    get_path(doc, path).is_some_and(|v| matches!(decode_encrypted(v), Ok(Some(_))))
}
