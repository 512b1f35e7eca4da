//! JSON documents, dotted paths and the raw document store contract.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::namespace::Namespace;

/// A document is a JSON object.
pub type Document = Map<String, Value>;

/// Raw (unencrypted-client) access to stored documents.
///
/// The encrypted session sits on top of this contract; reading through it
/// directly shows what the database actually holds.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Inserts a document. The document must carry an `_id`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the `_id` already exists or the write fails.
    async fn insert_document(&self, ns: &Namespace, doc: Document) -> Result<(), StoreError>;

    /// Returns every document matching the equality `filter`.
    ///
    /// # Errors
    ///
    /// Returns a `StoreError` if the read fails.
    async fn find_documents(
        &self,
        ns: &Namespace,
        filter: &Document,
    ) -> Result<Vec<Document>, StoreError>;

    /// Removes every document of the collection.
    ///
    /// # Errors
    ///
    /// Returns a `StoreError` if the write fails.
    async fn drop_collection(&self, ns: &Namespace) -> Result<(), StoreError>;
}

/// Returns the value at a dotted `path`.
#[must_use]
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Returns a mutable reference to the value at a dotted `path`.
pub fn get_path_mut<'a>(doc: &'a mut Document, path: &str) -> Option<&'a mut Value> {
    let mut segments = path.split('.');
    let mut current = doc.get_mut(segments.next()?)?;
    for segment in segments {
        current = current.as_object_mut()?.get_mut(segment)?;
    }
    Some(current)
}

/// Returns `true` if every `path: value` pair of `filter` equals the
/// document's value at that path.
#[must_use]
pub fn matches_filter(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(path, expected)| get_path(doc, path) == Some(expected))
}

/// Renders an `_id` value as a storage key.
///
/// The key is the value's JSON encoding, so `"1"` and `1` stay distinct.
#[must_use]
pub fn id_key(id: &Value) -> String {
    id.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_get_nested_path() {
        let d = doc(json!({"preferences": {"theme": "dark"}}));
        assert_eq!(get_path(&d, "preferences.theme"), Some(&json!("dark")));
        assert_eq!(get_path(&d, "preferences.missing"), None);
        assert_eq!(get_path(&d, "preferences.theme.deeper"), None);
    }

    #[test]
    fn test_get_path_mut_replaces_value() {
        let mut d = doc(json!({"a": {"b": 1}}));
        *get_path_mut(&mut d, "a.b").unwrap() = json!(2);
        assert_eq!(d["a"]["b"], 2);
    }

    #[test]
    fn test_matches_filter() {
        let d = doc(json!({"email": "user@example.com", "meta": {"n": 1}}));
        assert!(matches_filter(&d, &doc(json!({"email": "user@example.com"}))));
        assert!(matches_filter(&d, &doc(json!({"meta.n": 1}))));
        assert!(!matches_filter(&d, &doc(json!({"email": "other@example.com"}))));
        assert!(matches_filter(&d, &Document::new()));
    }

    #[test]
    fn test_id_key() {
        assert_eq!(id_key(&json!("abc")), "\"abc\"");
        assert_eq!(id_key(&json!(7)), "7");
        assert_ne!(id_key(&json!("1")), id_key(&json!(1)));
    }
}
