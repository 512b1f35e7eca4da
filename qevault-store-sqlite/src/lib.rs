//! SQLite backing store for `qevault`.
//!
//! One database file holds key vaults, the encrypted collection catalog and
//! documents. Several processes may open the same file; writes run in
//! `IMMEDIATE` transactions and alt-name uniqueness is enforced by a unique
//! index, so racing key creators are arbitrated by SQLite itself.

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use qevault::document::{id_key, matches_filter, Document, DocumentStore};
use qevault::error::StoreError;
use qevault::field_map::EncryptedFieldMap;
use qevault::key_vault::{DataEncryptionKey, KeyId, KeyVaultStore};
use qevault::namespace::Namespace;
use qevault::provisioner::CollectionCatalog;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS key_vault (
    vault_ns TEXT NOT NULL,
    key_id   TEXT NOT NULL,
    document TEXT NOT NULL,
    PRIMARY KEY (vault_ns, key_id)
);
CREATE TABLE IF NOT EXISTS key_alt_names (
    vault_ns TEXT NOT NULL,
    alt_name TEXT NOT NULL,
    key_id   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS key_alt_names_lookup ON key_alt_names (vault_ns, alt_name);
CREATE TABLE IF NOT EXISTS encrypted_collections (
    ns               TEXT PRIMARY KEY,
    encrypted_fields TEXT NOT NULL,
    created_at       TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS documents (
    seq    INTEGER PRIMARY KEY AUTOINCREMENT,
    ns     TEXT NOT NULL,
    doc_id TEXT NOT NULL,
    body   TEXT NOT NULL,
    UNIQUE (ns, doc_id)
);
";

const ALT_NAME_INDEX: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS key_alt_names_unique ON key_alt_names (vault_ns, alt_name)";

/// How long a connection waits for another writer before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to a SQLite database. Clones share one connection.
///
/// Statements run on Tokio's blocking pool, so a writer waiting on the
/// busy timeout never stalls a runtime worker. A Tokio runtime is required.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the file cannot be opened or the
    /// schema cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref()).map_err(store_error)?;
        Self::init(conn)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(store_error)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(store_error)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(store_error)?;
        conn.execute_batch(SCHEMA).map_err(store_error)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Returns an accessor for the key vault stored at `ns`.
    #[must_use]
    pub fn key_vault(&self, ns: Namespace) -> SqliteKeyVault {
        SqliteKeyVault { store: self.clone(), ns }
    }

    /// Runs `f` against the connection on the blocking thread pool.
    ///
    /// A call may wait up to the busy timeout for another writer.
    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&mut conn.lock()))
            .await
            .map_err(|e| StoreError::Backend(format!("store task failed: {e}")))?
    }
}

/// Key vault collection inside a [`SqliteStore`].
///
/// The alt-name index created by [`KeyVaultStore::ensure_index`] covers
/// every vault in the database, each scoped by its own namespace.
#[derive(Clone)]
pub struct SqliteKeyVault {
    store: SqliteStore,
    ns: Namespace,
}

impl SqliteKeyVault {
    /// Returns the vault namespace.
    #[must_use]
    pub const fn namespace(&self) -> &Namespace {
        &self.ns
    }
}

#[async_trait]
impl KeyVaultStore for SqliteKeyVault {
    async fn ensure_index(&self) -> Result<(), StoreError> {
        self.store
            .run(|conn| {
                conn.execute(ALT_NAME_INDEX, []).map_err(|e| {
                    if is_constraint_violation(&e) {
                        StoreError::Backend(format!(
                            "cannot build unique alt-name index, \
                             existing keys share an alt-name: {e}"
                        ))
                    } else {
                        store_error(e)
                    }
                })?;
                Ok(())
            })
            .await
    }

    async fn find_by_alt_name(
        &self,
        alt_name: &str,
    ) -> Result<Option<DataEncryptionKey>, StoreError> {
        let ns = self.ns.to_string();
        let alt_name = alt_name.to_string();
        let document: Option<String> = self
            .store
            .run(move |conn| {
                conn.query_row(
                    "SELECT v.document FROM key_alt_names a
                     JOIN key_vault v ON v.vault_ns = a.vault_ns AND v.key_id = a.key_id
                     WHERE a.vault_ns = ?1 AND a.alt_name = ?2
                     LIMIT 1",
                    params![ns, alt_name],
                    |row| row.get(0),
                )
                .optional()
                .map_err(store_error)
            })
            .await?;
        document.as_deref().map(parse_key).transpose()
    }

    async fn find_by_id(&self, id: &KeyId) -> Result<Option<DataEncryptionKey>, StoreError> {
        let ns = self.ns.to_string();
        let key_id = id.to_string();
        let document: Option<String> = self
            .store
            .run(move |conn| {
                conn.query_row(
                    "SELECT document FROM key_vault WHERE vault_ns = ?1 AND key_id = ?2",
                    params![ns, key_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(store_error)
            })
            .await?;
        document.as_deref().map(parse_key).transpose()
    }

    async fn insert(&self, dek: &DataEncryptionKey) -> Result<(), StoreError> {
        let document =
            serde_json::to_string(dek).map_err(|e| StoreError::Backend(e.to_string()))?;
        let ns = self.ns.to_string();
        let key_id = dek.id().to_string();
        let alt_names: Vec<String> = dek.key_alt_names().iter().cloned().collect();

        self.store
            .run(move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(store_error)?;

                tx.execute(
                    "INSERT INTO key_vault (vault_ns, key_id, document) VALUES (?1, ?2, ?3)",
                    params![ns, key_id, document],
                )
                .map_err(store_error)?;

                for alt_name in alt_names {
                    tx.execute(
                        "INSERT INTO key_alt_names (vault_ns, alt_name, key_id) \
                         VALUES (?1, ?2, ?3)",
                        params![ns, alt_name, key_id],
                    )
                    .map_err(|e| {
                        if is_constraint_violation(&e) {
                            StoreError::DuplicateKey { alt_name: alt_name.clone() }
                        } else {
                            store_error(e)
                        }
                    })?;
                }

                tx.commit().map_err(store_error)?;
                debug!(vault = %ns, key_id = %key_id, "stored data key");
                Ok(())
            })
            .await
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let ns = self.ns.to_string();
        let count: i64 = self
            .store
            .run(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM key_vault WHERE vault_ns = ?1",
                    params![ns],
                    |row| row.get(0),
                )
                .map_err(store_error)
            })
            .await?;
        usize::try_from(count).map_err(|e| StoreError::Backend(e.to_string()))
    }
}

#[async_trait]
impl CollectionCatalog for SqliteStore {
    async fn create_encrypted_collection(
        &self,
        ns: &Namespace,
        field_map: &EncryptedFieldMap,
    ) -> Result<(), StoreError> {
        let fields = field_map
            .to_document()
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .to_string();
        let namespace = ns.clone();

        self.run(move |conn| {
            conn.execute(
                "INSERT INTO encrypted_collections (ns, encrypted_fields, created_at) \
                 VALUES (?1, ?2, ?3)",
                params![namespace.to_string(), fields, chrono::Utc::now().to_rfc3339()],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    StoreError::CollectionExists(namespace.clone())
                } else {
                    store_error(e)
                }
            })?;
            Ok(())
        })
        .await
    }

    async fn encrypted_fields(
        &self,
        ns: &Namespace,
    ) -> Result<Option<EncryptedFieldMap>, StoreError> {
        let key = ns.to_string();
        let fields: Option<String> = self
            .run(move |conn| {
                conn.query_row(
                    "SELECT encrypted_fields FROM encrypted_collections WHERE ns = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()
                .map_err(store_error)
            })
            .await?;

        fields
            .map(|raw| {
                let value =
                    serde_json::from_str(&raw).map_err(|e| StoreError::Backend(e.to_string()))?;
                EncryptedFieldMap::from_document(ns.clone(), value)
                    .map_err(|e| StoreError::Backend(e.to_string()))
            })
            .transpose()
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn insert_document(&self, ns: &Namespace, doc: Document) -> Result<(), StoreError> {
        let id = doc
            .get("_id")
            .map(id_key)
            .ok_or_else(|| StoreError::Backend("document has no _id".to_string()))?;
        let body = serde_json::to_string(&doc).map_err(|e| StoreError::Backend(e.to_string()))?;
        let ns = ns.to_string();

        self.run(move |conn| {
            conn.execute(
                "INSERT INTO documents (ns, doc_id, body) VALUES (?1, ?2, ?3)",
                params![ns, id, body],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    StoreError::Backend(format!("duplicate _id {id} in {ns}"))
                } else {
                    store_error(e)
                }
            })?;
            Ok(())
        })
        .await
    }

    async fn find_documents(
        &self,
        ns: &Namespace,
        filter: &Document,
    ) -> Result<Vec<Document>, StoreError> {
        let key = ns.to_string();
        let bodies = self
            .run(move |conn| {
                let mut stmt = conn
                    .prepare_cached("SELECT body FROM documents WHERE ns = ?1 ORDER BY seq")
                    .map_err(store_error)?;
                let rows = stmt
                    .query_map(params![key], |row| row.get::<_, String>(0))
                    .map_err(store_error)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(store_error)
            })
            .await?;

        let mut matches = Vec::new();
        for body in bodies {
            let doc: Document =
                serde_json::from_str(&body).map_err(|e| StoreError::Backend(e.to_string()))?;
            if matches_filter(&doc, filter) {
                matches.push(doc);
            }
        }
        Ok(matches)
    }

    async fn drop_collection(&self, ns: &Namespace) -> Result<(), StoreError> {
        let ns = ns.to_string();
        self.run(move |conn| {
            conn.execute("DELETE FROM documents WHERE ns = ?1", params![ns])
                .map_err(store_error)?;
            Ok(())
        })
        .await
    }
}

fn parse_key(document: &str) -> Result<DataEncryptionKey, StoreError> {
    serde_json::from_str(document)
        .map_err(|e| StoreError::Backend(format!("malformed key document: {e}")))
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation)
}

fn store_error(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(f, _)
            if matches!(f.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            StoreError::Timeout(err.to_string())
        }
        _ => StoreError::Backend(err.to_string()),
    }
}
