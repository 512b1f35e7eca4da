//! Provisioning configuration.
//!
//! Everything the workflow needs except secrets: master key material stays
//! with the key provider that uses it.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::field_map::{EncryptedFieldMapBuilder, FieldDeclaration, ResolvedKeys};
use crate::key_vault::{validate_alt_name, KeyId};
use crate::namespace::Namespace;

/// What to provision, and where its keys live.
///
/// Namespaces are written as `"db.coll"` strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Collection holding the data encryption keys
    #[serde(with = "namespace_string")]
    pub key_vault: Namespace,

    /// Encrypted collection to provision
    #[serde(with = "namespace_string")]
    pub target: Namespace,

    /// Provider that wraps newly created keys
    #[serde(default = "default_kms_provider")]
    pub kms_provider: String,

    /// Encrypted fields of the target collection
    #[serde(default)]
    pub fields: Vec<FieldDeclaration>,

    /// Overrides the encrypted state collection name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub esc_collection: Option<String>,

    /// Overrides the encrypted compaction collection name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ecoc_collection: Option<String>,
}

fn default_kms_provider() -> String {
    "local".into()
}

impl VaultConfig {
    /// Checks the configuration without touching any store.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first problem found.
    pub fn validate(&self) -> Result<(), Error> {
        if self.key_vault == self.target {
            return Err(Error::Config(format!(
                "key vault and target must be different collections (both are {})",
                self.target
            )));
        }
        if self.kms_provider.trim().is_empty() {
            return Err(Error::Config("kms_provider must not be empty".to_string()));
        }
        if self.esc_collection.is_some() != self.ecoc_collection.is_some() {
            return Err(Error::Config(
                "esc_collection and ecoc_collection must be set together".to_string(),
            ));
        }
        for field in &self.fields {
            validate_alt_name(&field.key_alt_name).map_err(|e| Error::Config(e.to_string()))?;
        }

        // Keys do not matter for structural checks; any id will do.
        let builder = self.field_map_builder();
        let placeholder: ResolvedKeys =
            builder.alt_names().into_iter().map(|name| (name, KeyId::new())).collect();
        builder.build(&placeholder).map_err(|e| Error::Config(e.to_string()))?;
        Ok(())
    }

    /// Returns a field map builder for the target collection.
    #[must_use]
    pub fn field_map_builder(&self) -> EncryptedFieldMapBuilder {
        let builder =
            EncryptedFieldMapBuilder::new(self.target.clone()).fields(self.fields.clone());
        match (&self.esc_collection, &self.ecoc_collection) {
            (Some(esc), Some(ecoc)) => builder.state_collections(esc.clone(), ecoc.clone()),
            _ => builder,
        }
    }
}

mod namespace_string {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    use crate::namespace::Namespace;

    pub fn serialize<S: Serializer>(ns: &Namespace, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(ns)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Namespace, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field_map::{BsonType, QueryType};
    use serde_json::json;

    fn sample() -> VaultConfig {
        serde_json::from_value(json!({
            "key_vault": "encryption.__keyVault",
            "target": "test.coll",
            "fields": [
                {
                    "path": "email",
                    "bson_type": "string",
                    "key_alt_name": "k1",
                    "queries": "equality"
                },
                {"path": "memory", "bson_type": "string", "key_alt_name": "k2"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config = sample();

        assert_eq!(config.key_vault.collection(), "__keyVault");
        assert_eq!(config.target.to_string(), "test.coll");
        assert_eq!(config.kms_provider, "local");
        assert_eq!(config.fields[0].queries, Some(QueryType::Equality));
        assert_eq!(config.fields[1].bson_type, BsonType::String);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_namespace_rejected_on_load() {
        let result: Result<VaultConfig, _> =
            serde_json::from_value(json!({"key_vault": "nodot", "target": "test.coll"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_same_namespace() {
        let mut config = sample();
        config.key_vault = config.target.clone();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_duplicate_paths() {
        let mut config = sample();
        config.fields.push(FieldDeclaration::new("email", BsonType::String, "k2"));
        assert!(matches!(config.validate(), Err(Error::Config(msg)) if msg.contains("email")));
    }

    #[test]
    fn test_validate_rejects_half_state_collections() {
        let mut config = sample();
        config.esc_collection = Some("esc".into());
        assert!(config.validate().is_err());

        config.ecoc_collection = Some("ecoc".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_uses_overrides() {
        let mut config = sample();
        config.esc_collection = Some("state.esc".into());
        config.ecoc_collection = Some("state.ecoc".into());

        let keys: ResolvedKeys = [("k1", KeyId::new()), ("k2", KeyId::new())].into_iter().collect();
        let map = config.field_map_builder().build(&keys).unwrap();

        assert_eq!(map.esc_collection(), "state.esc");
        assert_eq!(map.ecoc_collection(), "state.ecoc");
    }
}
