//! Encrypted field maps.
//!
//! An [`EncryptedFieldMap`] tells the encrypted session which document paths
//! are encrypted, with which key, and whether they can be queried. It is
//! built from logical [`FieldDeclaration`]s plus the key ids the resolver
//! produced for their alt-names. Building is a pure transformation: the same
//! declarations and the same resolved keys always yield an equal map.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::key_vault::{validate_alt_name, KeyId};
use crate::namespace::Namespace;

/// Declared BSON type of an encrypted field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BsonType {
    /// UTF-8 string
    String,
    /// Embedded document
    Object,
    /// 32-bit integer
    Int,
    /// 64-bit integer
    Long,
    /// Floating point number
    Double,
    /// Boolean
    Bool,
    /// Date
    Date,
    /// Binary data
    BinData,
    /// Array
    Array,
    /// 128-bit decimal
    Decimal,
}

impl BsonType {
    /// Returns the wire name of the type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Object => "object",
            Self::Int => "int",
            Self::Long => "long",
            Self::Double => "double",
            Self::Bool => "bool",
            Self::Date => "date",
            Self::BinData => "binData",
            Self::Array => "array",
            Self::Decimal => "decimal",
        }
    }

    /// Returns `true` if equality queries may target a field of this type.
    #[must_use]
    pub const fn supports_equality(self) -> bool {
        !matches!(self, Self::Object | Self::Array | Self::Double | Self::Decimal)
    }
}

impl fmt::Display for BsonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Query capability of an encrypted field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryType {
    /// Exact-match queries
    Equality,
}

/// Query settings attached to a [`FieldSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    /// Supported query type
    pub query_type: QueryType,
}

/// A logical declaration of an encrypted field.
///
/// # Example
///
/// ```
/// use qevault::field_map::{BsonType, FieldDeclaration, QueryType};
///
/// let email = FieldDeclaration::new("email", BsonType::String, "k1")
///     .with_queries(QueryType::Equality);
/// assert!(email.is_queryable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDeclaration {
    /// Dotted document path
    pub path: String,
    /// Declared type
    pub bson_type: BsonType,
    /// Alt-name of the key that encrypts this field
    pub key_alt_name: String,
    /// Optional query capability
    #[serde(default)]
    pub queries: Option<QueryType>,
}

impl FieldDeclaration {
    /// Declares a field without query support.
    #[must_use]
    pub fn new(
        path: impl Into<String>,
        bson_type: BsonType,
        key_alt_name: impl Into<String>,
    ) -> Self {
        Self { path: path.into(), bson_type, key_alt_name: key_alt_name.into(), queries: None }
    }

    /// Enables a query capability.
    #[must_use]
    pub const fn with_queries(mut self, query_type: QueryType) -> Self {
        self.queries = Some(query_type);
        self
    }

    /// Returns `true` if the field supports queries.
    #[must_use]
    pub const fn is_queryable(&self) -> bool {
        self.queries.is_some()
    }
}

/// Types whose encrypted fields are declared statically.
///
/// Usually implemented with `#[derive(EncryptedFields)]` from `qevault-derive`.
pub trait EncryptedFields {
    /// Returns the field declarations in declaration order.
    fn field_declarations() -> Vec<FieldDeclaration>;
}

/// Mapping from key alt-name to resolved key id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedKeys(BTreeMap<String, KeyId>);

impl ResolvedKeys {
    /// Creates an empty mapping.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the key id for an alt-name.
    pub fn insert(&mut self, alt_name: impl Into<String>, key_id: KeyId) {
        self.0.insert(alt_name.into(), key_id);
    }

    /// Returns the key id for an alt-name.
    #[must_use]
    pub fn get(&self, alt_name: &str) -> Option<KeyId> {
        self.0.get(alt_name).copied()
    }

    /// Returns the number of resolved alt-names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if nothing was resolved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over `(alt_name, key_id)` pairs in alt-name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, KeyId)> {
        self.0.iter().map(|(name, id)| (name.as_str(), *id))
    }
}

impl<S: Into<String>> FromIterator<(S, KeyId)> for ResolvedKeys {
    fn from_iter<T: IntoIterator<Item = (S, KeyId)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(name, id)| (name.into(), id)).collect())
    }
}

/// One encrypted field of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    /// Key that encrypts the field
    pub key_id: KeyId,
    /// Dotted document path
    pub path: String,
    /// Declared type
    pub bson_type: BsonType,
    /// Query settings, if the field is queryable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queries: Option<QuerySpec>,
}

impl FieldSpec {
    /// Returns `true` if the field supports equality queries.
    #[must_use]
    pub fn is_equality_queryable(&self) -> bool {
        matches!(self.queries, Some(QuerySpec { query_type: QueryType::Equality }))
    }
}

/// Wire form of the map, without its namespace.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EncryptedFieldsDocument {
    esc_collection: String,
    ecoc_collection: String,
    fields: Vec<FieldSpec>,
}

/// The complete encryption specification of one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedFieldMap {
    namespace: Namespace,
    esc_collection: String,
    ecoc_collection: String,
    fields: Vec<FieldSpec>,
}

impl EncryptedFieldMap {
    /// Returns the target namespace.
    #[must_use]
    pub const fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Returns the encrypted state collection name.
    #[must_use]
    pub fn esc_collection(&self) -> &str {
        &self.esc_collection
    }

    /// Returns the encrypted compaction collection name.
    #[must_use]
    pub fn ecoc_collection(&self) -> &str {
        &self.ecoc_collection
    }

    /// Returns the encrypted fields in declaration order.
    #[must_use]
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Returns the spec for an exact path.
    #[must_use]
    pub fn field(&self, path: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.path == path)
    }

    /// Returns every distinct key id the map references.
    #[must_use]
    pub fn key_ids(&self) -> BTreeSet<KeyId> {
        self.fields.iter().map(|f| f.key_id).collect()
    }

    /// Renders the `encryptedFields` document attached to the collection.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if rendering fails.
    pub fn to_document(&self) -> Result<Value, Error> {
        let doc = EncryptedFieldsDocument {
            esc_collection: self.esc_collection.clone(),
            ecoc_collection: self.ecoc_collection.clone(),
            fields: self.fields.clone(),
        };
        Ok(serde_json::to_value(doc)?)
    }

    /// Parses an `encryptedFields` document for `namespace`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if the document is malformed, or
    /// `Error::InvalidFieldMap` if its paths are invalid.
    pub fn from_document(namespace: Namespace, document: Value) -> Result<Self, Error> {
        let doc: EncryptedFieldsDocument = serde_json::from_value(document)?;
        validate_paths(
            doc.fields.iter().map(|f| (f.path.as_str(), f.bson_type, f.queries.is_some())),
        )?;
        Ok(Self {
            namespace,
            esc_collection: doc.esc_collection,
            ecoc_collection: doc.ecoc_collection,
            fields: doc.fields,
        })
    }
}

/// Builds an [`EncryptedFieldMap`] from field declarations.
///
/// # Example
///
/// ```
/// use qevault::field_map::{
///     BsonType, EncryptedFieldMapBuilder, FieldDeclaration, QueryType, ResolvedKeys,
/// };
/// use qevault::key_vault::KeyId;
///
/// let ns = "users.memories".parse().unwrap();
/// let builder = EncryptedFieldMapBuilder::new(ns)
///     .field(
///         FieldDeclaration::new("email", BsonType::String, "k1")
///             .with_queries(QueryType::Equality),
///     )
///     .field(FieldDeclaration::new("memory", BsonType::String, "k1"));
///
/// let keys: ResolvedKeys = [("k1", KeyId::new())].into_iter().collect();
/// let map = builder.build(&keys).unwrap();
/// assert_eq!(map.fields().len(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct EncryptedFieldMapBuilder {
    namespace: Namespace,
    declarations: Vec<FieldDeclaration>,
    esc_collection: Option<String>,
    ecoc_collection: Option<String>,
}

impl EncryptedFieldMapBuilder {
    /// Starts a map for `namespace`.
    #[must_use]
    pub const fn new(namespace: Namespace) -> Self {
        Self { namespace, declarations: Vec::new(), esc_collection: None, ecoc_collection: None }
    }

    /// Adds one field declaration.
    #[must_use]
    pub fn field(mut self, declaration: FieldDeclaration) -> Self {
        self.declarations.push(declaration);
        self
    }

    /// Adds several field declarations, keeping their order.
    #[must_use]
    pub fn fields(mut self, declarations: impl IntoIterator<Item = FieldDeclaration>) -> Self {
        self.declarations.extend(declarations);
        self
    }

    /// Overrides the auxiliary state collection names.
    #[must_use]
    pub fn state_collections(mut self, esc: impl Into<String>, ecoc: impl Into<String>) -> Self {
        self.esc_collection = Some(esc.into());
        self.ecoc_collection = Some(ecoc.into());
        self
    }

    /// Returns the declarations added so far.
    #[must_use]
    pub fn declarations(&self) -> &[FieldDeclaration] {
        &self.declarations
    }

    /// Returns the distinct alt-names the declarations reference.
    #[must_use]
    pub fn alt_names(&self) -> BTreeSet<String> {
        self.declarations.iter().map(|d| d.key_alt_name.clone()).collect()
    }

    /// Builds the map, attaching the resolved key id to every field.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidFieldMap` if no fields are declared, a path is
    ///   malformed or duplicated, one path is nested under another, or an
    ///   equality query targets a type that cannot support it.
    /// - `Error::UnresolvedKey` if an alt-name is missing from `keys`.
    pub fn build(&self, keys: &ResolvedKeys) -> Result<EncryptedFieldMap, Error> {
        validate_paths(
            self.declarations.iter().map(|d| (d.path.as_str(), d.bson_type, d.is_queryable())),
        )?;

        let fields = self
            .declarations
            .iter()
            .map(|decl| {
                validate_alt_name(&decl.key_alt_name)?;
                let key_id = keys.get(&decl.key_alt_name).ok_or_else(|| Error::UnresolvedKey {
                    path: decl.path.clone(),
                    alt_name: decl.key_alt_name.clone(),
                })?;
                Ok(FieldSpec {
                    key_id,
                    path: decl.path.clone(),
                    bson_type: decl.bson_type,
                    queries: decl.queries.map(|query_type| QuerySpec { query_type }),
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let collection = self.namespace.collection();
        Ok(EncryptedFieldMap {
            namespace: self.namespace.clone(),
            esc_collection: self
                .esc_collection
                .clone()
                .unwrap_or_else(|| format!("enxcol_.{collection}.esc")),
            ecoc_collection: self
                .ecoc_collection
                .clone()
                .unwrap_or_else(|| format!("enxcol_.{collection}.ecoc")),
            fields,
        })
    }
}

fn validate_paths<'a>(
    fields: impl Iterator<Item = (&'a str, BsonType, bool)>,
) -> Result<(), Error> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut paths = Vec::new();

    for (path, bson_type, queryable) in fields {
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(Error::InvalidFieldMap(format!("malformed field path `{path}`")));
        }
        if path.starts_with('$') {
            return Err(Error::InvalidFieldMap(format!(
                "field path `{path}` must not start with '$'"
            )));
        }
        if path == "_id" || path.starts_with("_id.") {
            return Err(Error::InvalidFieldMap("`_id` cannot be encrypted".to_string()));
        }
        if !seen.insert(path) {
            return Err(Error::InvalidFieldMap(format!("duplicate field path `{path}`")));
        }
        if queryable && !bson_type.supports_equality() {
            return Err(Error::InvalidFieldMap(format!(
                "field `{path}` of type {bson_type} cannot support equality queries"
            )));
        }
        paths.push(path);
    }

    if paths.is_empty() {
        return Err(Error::InvalidFieldMap("no encrypted fields declared".to_string()));
    }

    for a in &paths {
        for b in &paths {
            if b.len() > a.len() && b.starts_with(a) && b.as_bytes()[a.len()] == b'.' {
                return Err(Error::InvalidFieldMap(format!(
                    "field path `{b}` is nested under encrypted field `{a}`"
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ns() -> Namespace {
        Namespace::new("csfle_demo", "memories").unwrap()
    }

    fn demo_declarations() -> Vec<FieldDeclaration> {
        vec![
            FieldDeclaration::new("email", BsonType::String, "k1")
                .with_queries(QueryType::Equality),
            FieldDeclaration::new("memory", BsonType::String, "k2"),
        ]
    }

    #[test]
    fn test_build_attaches_key_ids() {
        let k1 = KeyId::new();
        let k2 = KeyId::new();
        let keys: ResolvedKeys = [("k1", k1), ("k2", k2)].into_iter().collect();

        let map =
            EncryptedFieldMapBuilder::new(ns()).fields(demo_declarations()).build(&keys).unwrap();

        assert_eq!(map.fields().len(), 2);
        assert_eq!(map.field("email").unwrap().key_id, k1);
        assert!(map.field("email").unwrap().is_equality_queryable());
        assert_eq!(map.field("memory").unwrap().key_id, k2);
        assert!(map.field("memory").unwrap().queries.is_none());
        assert_eq!(map.key_ids().len(), 2);
    }

    #[test]
    fn test_shared_key_across_fields() {
        let k = KeyId::new();
        let keys: ResolvedKeys = [("shared", k)].into_iter().collect();

        let map = EncryptedFieldMapBuilder::new(ns())
            .field(FieldDeclaration::new("email", BsonType::String, "shared"))
            .field(FieldDeclaration::new("preferences", BsonType::Object, "shared"))
            .field(FieldDeclaration::new("password", BsonType::String, "shared"))
            .build(&keys)
            .unwrap();

        assert!(map.fields().iter().all(|f| f.key_id == k));
        assert_eq!(map.key_ids().len(), 1);
    }

    #[test]
    fn test_unresolved_key_rejected() {
        let keys: ResolvedKeys = [("k1", KeyId::new())].into_iter().collect();

        let result = EncryptedFieldMapBuilder::new(ns()).fields(demo_declarations()).build(&keys);

        assert!(matches!(
            result,
            Err(Error::UnresolvedKey { ref path, ref alt_name })
                if path == "memory" && alt_name == "k2"
        ));
    }

    #[test]
    fn test_duplicate_paths_rejected() {
        let keys: ResolvedKeys = [("k1", KeyId::new())].into_iter().collect();
        let result = EncryptedFieldMapBuilder::new(ns())
            .field(FieldDeclaration::new("email", BsonType::String, "k1"))
            .field(FieldDeclaration::new("email", BsonType::String, "k1"))
            .build(&keys);

        assert!(matches!(result, Err(Error::InvalidFieldMap(_))));
    }

    #[test]
    fn test_duplicate_path_reported_before_unresolved_key() {
        let result = EncryptedFieldMapBuilder::new(ns())
            .field(FieldDeclaration::new("email", BsonType::String, "k1"))
            .field(FieldDeclaration::new("email", BsonType::String, "k1"))
            .build(&ResolvedKeys::new());

        assert!(matches!(result, Err(Error::InvalidFieldMap(_))));
    }

    #[test]
    fn test_nested_paths_rejected() {
        let keys: ResolvedKeys = [("k1", KeyId::new())].into_iter().collect();
        let result = EncryptedFieldMapBuilder::new(ns())
            .field(FieldDeclaration::new("profile.email", BsonType::String, "k1"))
            .field(FieldDeclaration::new("profile", BsonType::Object, "k1"))
            .build(&keys);

        assert!(matches!(result, Err(Error::InvalidFieldMap(_))));
    }

    #[test]
    fn test_sibling_prefix_is_not_nesting() {
        let keys: ResolvedKeys = [("k1", KeyId::new())].into_iter().collect();
        let map = EncryptedFieldMapBuilder::new(ns())
            .field(FieldDeclaration::new("mail", BsonType::String, "k1"))
            .field(FieldDeclaration::new("mailbox", BsonType::String, "k1"))
            .build(&keys);

        assert!(map.is_ok());
    }

    #[test]
    fn test_malformed_paths_rejected() {
        let keys: ResolvedKeys = [("k1", KeyId::new())].into_iter().collect();
        for path in ["", "a..b", ".a", "a.", "$where", "_id", "_id.x"] {
            let result = EncryptedFieldMapBuilder::new(ns())
                .field(FieldDeclaration::new(path, BsonType::String, "k1"))
                .build(&keys);
            assert!(matches!(result, Err(Error::InvalidFieldMap(_))), "path {path:?} accepted");
        }
    }

    #[test]
    fn test_empty_declarations_rejected() {
        let result = EncryptedFieldMapBuilder::new(ns()).build(&ResolvedKeys::new());
        assert!(matches!(result, Err(Error::InvalidFieldMap(_))));
    }

    #[test]
    fn test_equality_on_object_rejected() {
        let keys: ResolvedKeys = [("k1", KeyId::new())].into_iter().collect();
        let result = EncryptedFieldMapBuilder::new(ns())
            .field(
                FieldDeclaration::new("preferences", BsonType::Object, "k1")
                    .with_queries(QueryType::Equality),
            )
            .build(&keys);

        assert!(matches!(result, Err(Error::InvalidFieldMap(_))));
    }

    #[test]
    fn test_default_state_collections() {
        let keys: ResolvedKeys = [("k1", KeyId::new()), ("k2", KeyId::new())].into_iter().collect();
        let map =
            EncryptedFieldMapBuilder::new(ns()).fields(demo_declarations()).build(&keys).unwrap();

        assert_eq!(map.esc_collection(), "enxcol_.memories.esc");
        assert_eq!(map.ecoc_collection(), "enxcol_.memories.ecoc");

        let custom = EncryptedFieldMapBuilder::new(ns())
            .fields(demo_declarations())
            .state_collections("esc", "ecoc")
            .build(&keys)
            .unwrap();
        assert_eq!(custom.esc_collection(), "esc");
    }

    #[test]
    fn test_document_shape() {
        let k1 = KeyId::new();
        let keys: ResolvedKeys = [("k1", k1), ("k2", KeyId::new())].into_iter().collect();
        let map =
            EncryptedFieldMapBuilder::new(ns()).fields(demo_declarations()).build(&keys).unwrap();

        let doc = map.to_document().unwrap();
        assert_eq!(doc["escCollection"], "enxcol_.memories.esc");
        assert_eq!(doc["fields"][0]["path"], "email");
        assert_eq!(doc["fields"][0]["bsonType"], "string");
        assert_eq!(doc["fields"][0]["keyId"], k1.to_string());
        assert_eq!(doc["fields"][0]["queries"]["queryType"], "equality");
        assert!(doc["fields"][1].get("queries").is_none());

        let parsed = EncryptedFieldMap::from_document(ns(), doc).unwrap();
        assert_eq!(parsed, map);
    }

    #[test]
    fn test_declaration_deserializes_from_config_shape() {
        let decl: FieldDeclaration = serde_json::from_str(
            r#"{"path":"email","bson_type":"string","key_alt_name":"k1","queries":"equality"}"#,
        )
        .unwrap();
        assert_eq!(decl.bson_type, BsonType::String);
        assert_eq!(decl.queries, Some(QueryType::Equality));

        let bin: BsonType = serde_json::from_str(r#""binData""#).unwrap();
        assert_eq!(bin, BsonType::BinData);
    }

    fn arb_declarations() -> impl Strategy<Value = Vec<FieldDeclaration>> {
        prop::collection::btree_set("[a-z]{1,8}", 1..8).prop_flat_map(|paths| {
            let n = paths.len();
            (Just(paths), prop::collection::vec((0..3usize, any::<bool>()), n)).prop_map(
                |(paths, attrs)| {
                    paths
                        .into_iter()
                        .zip(attrs)
                        .map(|(path, (key, queryable))| {
                            let decl =
                                FieldDeclaration::new(path, BsonType::String, format!("k{key}"));
                            if queryable {
                                decl.with_queries(QueryType::Equality)
                            } else {
                                decl
                            }
                        })
                        .collect()
                },
            )
        })
    }

    proptest! {
        #[test]
        fn prop_build_is_deterministic(decls in arb_declarations()) {
            let keys: ResolvedKeys =
                (0..3).map(|i| (format!("k{i}"), KeyId::new())).collect();

            let build = || {
                EncryptedFieldMapBuilder::new(ns()).fields(decls.clone()).build(&keys).unwrap()
            };
            let first = build();
            let second = build();

            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first.fields().len(), decls.len());
            for (spec, decl) in first.fields().iter().zip(&decls) {
                prop_assert_eq!(&spec.path, &decl.path);
                prop_assert_eq!(Some(spec.key_id), keys.get(&decl.key_alt_name));
            }
        }
    }
}
