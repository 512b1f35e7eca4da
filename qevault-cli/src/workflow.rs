//! The provisioning workflow and the insert/query demo, wired to the
//! configured SQLite store and key providers.

use std::sync::Arc;

use anyhow::{Context, Result};
use qevault::prelude::*;
use qevault_kms_aws::AwsKmsProvider;
use qevault_kms_local::LocalKeyProvider;
use qevault_store_sqlite::{SqliteKeyVault, SqliteStore};
use serde_json::{json, Value};
use tracing::info;

use crate::settings::{KmsSettings, Settings};

/// What `demo` inserted and read back.
#[derive(Debug)]
pub struct DemoReport {
    pub inserted_id: Value,
    pub decrypted: Option<Document>,
    pub raw: Option<Document>,
}

pub struct Workflow {
    settings: Settings,
    store: SqliteStore,
    providers: KmsProviders,
}

impl Workflow {
    pub async fn open(settings: Settings) -> Result<Self> {
        let store = SqliteStore::open(&settings.store.path)
            .with_context(|| format!("failed to open store {}", settings.store.path.display()))?;
        let providers = providers(&settings.kms).await?;
        Ok(Self { settings, store, providers })
    }

    fn key_vault(&self) -> Arc<SqliteKeyVault> {
        Arc::new(self.store.key_vault(self.settings.vault.key_vault.clone()))
    }

    async fn resolver(&self) -> Result<DekResolver<SqliteKeyVault>> {
        let vault = self.key_vault();
        vault.ensure_index().await.context("failed to ensure key vault index")?;
        let provider = self.settings.vault.kms_provider.clone();
        Ok(DekResolver::new(vault, self.providers.clone(), provider))
    }

    pub async fn resolve_key(&self, alt_name: &str) -> Result<ResolvedKey> {
        let resolver = self.resolver().await?;
        resolver
            .resolve(alt_name)
            .await
            .with_context(|| format!("failed to resolve data key `{alt_name}`"))
    }

    /// Ensures keys, builds the field map and provisions the target.
    ///
    /// Returns the map the target is actually encrypted with: the one just
    /// built on creation, or the stored one if the target already existed.
    pub async fn provision(&self) -> Result<(EncryptedFieldMap, ProvisionOutcome)> {
        let builder = self.settings.vault.field_map_builder();
        let keys = self
            .resolver()
            .await?
            .resolve_all(builder.alt_names())
            .await
            .context("failed to resolve data keys")?;
        let map = builder.build(&keys).context("failed to build encrypted field map")?;

        let provisioner = EncryptedCollectionProvisioner::new(Arc::new(self.store.clone()));
        let outcome = provisioner
            .ensure_collection(map.namespace(), &map)
            .await
            .context("failed to provision encrypted collection")?;

        match outcome {
            ProvisionOutcome::Created => Ok((map, outcome)),
            ProvisionOutcome::AlreadyExists => {
                let stored = self
                    .store
                    .encrypted_fields(map.namespace())
                    .await
                    .context("failed to read stored encrypted field map")?
                    .with_context(|| {
                        format!("{} exists but has no encrypted field map", map.namespace())
                    })?;
                Ok((stored, outcome))
            }
        }
    }

    pub async fn demo(&self) -> Result<DemoReport> {
        let (map, _) = self.provision().await?;
        let session = EncryptedSession::new(
            self.key_vault(),
            Arc::new(self.store.clone()),
            self.providers.clone(),
            map,
        );

        let inserted_id = session
            .insert_one(sample_document()?)
            .await
            .context("failed to insert sample document")?;
        info!(id = %inserted_id, "sample document inserted");

        let mut query = Document::new();
        query.insert("_id".into(), inserted_id.clone());
        query.insert("email".into(), json!("user@example.com"));
        let decrypted = session.find_one(&query).await.context("query by email failed")?;

        let mut by_id = Document::new();
        by_id.insert("_id".into(), inserted_id.clone());
        let raw = self
            .store
            .find_documents(session.namespace(), &by_id)
            .await
            .context("failed to read raw document")?
            .into_iter()
            .next();

        Ok(DemoReport { inserted_id, decrypted, raw })
    }
}

async fn providers(settings: &KmsSettings) -> Result<KmsProviders> {
    let mut providers = KmsProviders::new();
    if let Some(local) = &settings.local {
        let provider = LocalKeyProvider::from_file(&local.master_key_path).with_context(|| {
            format!("failed to load master key from {}", local.master_key_path.display())
        })?;
        providers = providers.with(provider);
    }
    if let Some(aws) = &settings.aws {
        providers = providers.with(AwsKmsProvider::new(aws.key_id.clone()).await);
    }
    Ok(providers)
}

fn sample_document() -> Result<Document> {
    serde_json::from_value(json!({
        "email": "user@example.com",
        "memory": "Today I chatted with the assistant about Queryable Encryption.",
        "preferences": {"theme": "dark", "notifications": true},
        "password": "super_secret_password",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
    .context("invalid sample document")
}
