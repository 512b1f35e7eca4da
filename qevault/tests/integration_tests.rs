//! End-to-end provisioning with the local key provider and the in-memory
//! backend.

use std::sync::Arc;

use qevault::prelude::*;
use qevault::session::is_encrypted_at;
use qevault_derive::EncryptedFields;
use qevault_kms_local::LocalKeyProvider;
use secrecy::SecretVec;
use serde_json::json;

#[derive(EncryptedFields)]
#[allow(dead_code)]
struct Memory {
    #[encrypted(key_alt_name = "k1", queries = "equality")]
    email: String,
    #[encrypted(key_alt_name = "k2")]
    memory: String,
    #[encrypted(key_alt_name = "k2", bson_type = "object", path = "preferences")]
    prefs: serde_json::Value,
    created_by: String,
}

struct Deployment {
    backend: MemoryBackend,
    providers: KmsProviders,
}

impl Deployment {
    fn new(master_key: &SecretVec<u8>) -> Self {
        let providers = KmsProviders::new().with(LocalKeyProvider::new(master_key).unwrap());
        Self { backend: MemoryBackend::new(), providers }
    }

    /// One run of the provisioning workflow, as a freshly started process.
    async fn provision(
        &self,
        declarations: Vec<FieldDeclaration>,
    ) -> Result<(EncryptedFieldMap, ProvisionOutcome), Error> {
        let vault = Arc::new(self.backend.key_vault("encryption.__keyVault".parse()?));
        vault.ensure_index().await?;

        let builder =
            EncryptedFieldMapBuilder::new(Namespace::new("test", "coll")?).fields(declarations);
        let resolver = DekResolver::new(vault, self.providers.clone(), "local");
        let keys = resolver.resolve_all(builder.alt_names()).await?;
        let map = builder.build(&keys)?;

        let provisioner = EncryptedCollectionProvisioner::new(Arc::new(self.backend.clone()));
        let outcome = provisioner.ensure_collection(map.namespace(), &map).await?;
        Ok((map, outcome))
    }

    fn session(&self, map: EncryptedFieldMap) -> EncryptedSession<MemoryKeyVault, MemoryBackend> {
        let vault = self.backend.key_vault("encryption.__keyVault".parse().unwrap());
        EncryptedSession::new(
            Arc::new(vault),
            Arc::new(self.backend.clone()),
            self.providers.clone(),
            map,
        )
    }
}

fn scenario_declarations() -> Vec<FieldDeclaration> {
    vec![
        FieldDeclaration::new("email", BsonType::String, "k1").with_queries(QueryType::Equality),
        FieldDeclaration::new("memory", BsonType::String, "k2"),
    ]
}

fn doc(value: serde_json::Value) -> Document {
    value.as_object().cloned().unwrap()
}

#[tokio::test]
async fn test_end_to_end_scenario() {
    let deployment = Deployment::new(&LocalKeyProvider::generate_master_key());

    let (map, outcome) = deployment.provision(scenario_declarations()).await.unwrap();
    assert_eq!(outcome, ProvisionOutcome::Created);

    let email = map.field("email").unwrap();
    let memory = map.field("memory").unwrap();
    assert_ne!(email.key_id, memory.key_id);
    assert!(email.is_equality_queryable());
    assert!(!memory.is_equality_queryable());

    let vault = deployment.backend.key_vault("encryption.__keyVault".parse().unwrap());
    assert_eq!(vault.count().await.unwrap(), 2);
    assert_eq!(vault.find_by_alt_name("k1").await.unwrap().unwrap().id(), email.key_id);
    assert_eq!(vault.find_by_alt_name("k2").await.unwrap().unwrap().id(), memory.key_id);

    let session = deployment.session(map);
    session
        .insert_one(doc(json!({"email": "user@example.com", "memory": "likes dogs"})))
        .await
        .unwrap();

    let by_email = doc(json!({"email": "user@example.com"}));
    let found = session.find_one(&by_email).await.unwrap().unwrap();
    assert_eq!(found["memory"], "likes dogs");
    assert_eq!(found["email"], "user@example.com");

    let raw = deployment
        .backend
        .find_documents(session.namespace(), &Document::new())
        .await
        .unwrap();
    assert!(is_encrypted_at(&raw[0], "email"));
    assert!(is_encrypted_at(&raw[0], "memory"));
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let deployment = Deployment::new(&LocalKeyProvider::generate_master_key());

    let (first, created) = deployment.provision(scenario_declarations()).await.unwrap();
    let (second, again) = deployment.provision(scenario_declarations()).await.unwrap();

    assert_eq!(created, ProvisionOutcome::Created);
    assert_eq!(again, ProvisionOutcome::AlreadyExists);
    assert_eq!(first, second);
    assert_eq!(first.to_document().unwrap(), second.to_document().unwrap());

    let vault = deployment.backend.key_vault("encryption.__keyVault".parse().unwrap());
    assert_eq!(vault.count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_data_written_before_restart_stays_readable() {
    let master_key = LocalKeyProvider::generate_master_key();
    let deployment = Deployment::new(&master_key);

    let (map, _) = deployment.provision(scenario_declarations()).await.unwrap();
    deployment
        .session(map)
        .insert_one(doc(json!({"email": "user@example.com", "memory": "likes dogs"})))
        .await
        .unwrap();

    let (map, _) = deployment.provision(scenario_declarations()).await.unwrap();
    let found = deployment
        .session(map)
        .find_one(&doc(json!({"email": "user@example.com"})))
        .await
        .unwrap();
    assert_eq!(found.unwrap()["memory"], "likes dogs");
}

#[tokio::test]
async fn test_unresolved_key_is_rejected_before_provisioning() {
    let deployment = Deployment::new(&LocalKeyProvider::generate_master_key());
    let ns = Namespace::new("test", "coll").unwrap();

    let keys: ResolvedKeys = [("k1", KeyId::new())].into_iter().collect();
    let result =
        EncryptedFieldMapBuilder::new(ns.clone()).fields(scenario_declarations()).build(&keys);

    assert!(matches!(
        result,
        Err(Error::UnresolvedKey { path, alt_name }) if path == "memory" && alt_name == "k2"
    ));
    assert_eq!(deployment.backend.encrypted_fields(&ns).await.unwrap(), None);
}

#[tokio::test]
async fn test_wrong_master_key_cannot_read() {
    let deployment = Deployment::new(&LocalKeyProvider::generate_master_key());
    let (map, _) = deployment.provision(scenario_declarations()).await.unwrap();
    deployment
        .session(map.clone())
        .insert_one(doc(json!({"email": "user@example.com", "memory": "likes dogs"})))
        .await
        .unwrap();

    let intruder = Deployment {
        backend: deployment.backend.clone(),
        providers: KmsProviders::new()
            .with(LocalKeyProvider::new(&LocalKeyProvider::generate_master_key()).unwrap()),
    };
    let result = intruder.session(map).find(&Document::new()).await;
    assert!(matches!(result, Err(Error::KeyProvider(KeyProviderError::UnwrapFailed(_)))));
}

#[tokio::test]
async fn test_derived_declarations() {
    let declarations = Memory::field_declarations();

    assert_eq!(
        declarations,
        vec![
            FieldDeclaration::new("email", BsonType::String, "k1")
                .with_queries(QueryType::Equality),
            FieldDeclaration::new("memory", BsonType::String, "k2"),
            FieldDeclaration::new("preferences", BsonType::Object, "k2"),
        ]
    );

    let deployment = Deployment::new(&LocalKeyProvider::generate_master_key());
    let (map, _) = deployment.provision(declarations).await.unwrap();
    let session = deployment.session(map);
    session
        .insert_one(doc(json!({
            "email": "user@example.com",
            "memory": "likes dogs",
            "preferences": {"theme": "dark"},
            "created_by": "importer"
        })))
        .await
        .unwrap();

    let found = session.find_one(&doc(json!({"created_by": "importer"}))).await.unwrap().unwrap();
    assert_eq!(found["preferences"]["theme"], "dark");
}

#[test]
fn test_encrypted_fields_document_shape() {
    let k1 = KeyId::new();
    let keys: ResolvedKeys = [("k1", k1), ("k2", KeyId::new())].into_iter().collect();
    let map = EncryptedFieldMapBuilder::new(Namespace::new("test", "coll").unwrap())
        .fields(scenario_declarations())
        .build(&keys)
        .unwrap();

    let document = map.to_document().unwrap();
    assert_eq!(document["escCollection"], "enxcol_.coll.esc");
    assert_eq!(document["ecocCollection"], "enxcol_.coll.ecoc");
    assert_eq!(document["fields"][0]["keyId"], k1.to_string());
    assert_eq!(document["fields"][0]["path"], "email");
    assert_eq!(document["fields"][0]["bsonType"], "string");
    assert_eq!(document["fields"][0]["queries"]["queryType"], "equality");
    assert!(document["fields"][1].get("queries").is_none());
}
