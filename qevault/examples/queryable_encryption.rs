//! Provisions an encrypted collection in memory, stores a document and
//! queries it back by an encrypted field.

use std::sync::Arc;

use qevault::prelude::*;
use qevault_kms_local::LocalKeyProvider;
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let backend = MemoryBackend::new();
    let master_key = LocalKeyProvider::generate_master_key();
    let providers = KmsProviders::new().with(LocalKeyProvider::new(&master_key)?);

    let vault = Arc::new(backend.key_vault("encryption.__keyVault".parse()?));
    vault.ensure_index().await?;

    let builder = EncryptedFieldMapBuilder::new("test.coll".parse()?)
        .field(
            FieldDeclaration::new("email", BsonType::String, "k1")
                .with_queries(QueryType::Equality),
        )
        .field(FieldDeclaration::new("memory", BsonType::String, "k2"));

    let resolver = DekResolver::new(Arc::clone(&vault), providers.clone(), "local");
    for alt_name in builder.alt_names() {
        let key = resolver.resolve(&alt_name).await?;
        println!("{}: {} ({:?})", key.alt_name, key.key_id, key.outcome);
    }

    // Every key is in the vault now; a second pass takes the fast path.
    let keys = resolver.resolve_all(builder.alt_names()).await?;
    let map = builder.build(&keys)?;
    println!("{}", serde_json::to_string_pretty(&map.to_document()?)?);

    let provisioner = EncryptedCollectionProvisioner::new(Arc::new(backend.clone()));
    for _ in 0..2 {
        let outcome = provisioner.ensure_collection(map.namespace(), &map).await?;
        println!("{}: {outcome:?}", map.namespace());
    }

    let session = EncryptedSession::new(vault, Arc::new(backend.clone()), providers, map);
    let doc = json!({"email": "user@example.com", "memory": "likes dogs"});
    let id = session.insert_one(doc.as_object().cloned().unwrap_or_default()).await?;
    println!("inserted {id}");

    let mut filter = Document::new();
    filter.insert("email".into(), json!("user@example.com"));
    println!("decrypted: {:?}", session.find_one(&filter).await?);
    let stored = backend.find_documents(session.namespace(), &Document::new()).await?;
    println!("stored:    {stored:?}");

    Ok(())
}
