// src/store.rs

use crate::models::Transfer;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_rusqlite::Connection;

/// Version written alongside every record.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable mapping from identifier to [`Transfer`].
///
/// Each write replaces one record atomically; there is no cross-record
/// transaction.
pub trait TransferStore: Send + Sync + 'static {
    /// Inserts or replaces the record keyed by `transfer.identifier()`.
    fn set(&self, transfer: &Transfer) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get(&self, identifier: &str) -> impl Future<Output = Result<Option<Transfer>, StoreError>> + Send;

    fn get_all(&self) -> impl Future<Output = Result<Vec<Transfer>, StoreError>> + Send;

    /// Removing an unknown identifier is not an error.
    fn remove(&self, identifier: &str) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Persists transfers to an SQLite database, one JSON record per row.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Opens (or creates) the database at `db_path` and ensures the table exists.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let conn = Connection::open(db_path).await?;
        let store = Self { conn };
        store.setup_database().await?;
        Ok(store)
    }

    /// A private, non-durable database. Useful for tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.setup_database().await?;
        Ok(store)
    }

    async fn setup_database(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS transfers (
                        identifier      TEXT PRIMARY KEY,
                        schema_version  INTEGER NOT NULL,
                        record          TEXT NOT NULL
                    )",
                    [],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

fn decode(record: &str) -> Result<Transfer, rusqlite::Error> {
    serde_json::from_str(record)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

impl TransferStore for SqliteStore {
    async fn set(&self, transfer: &Transfer) -> Result<(), StoreError> {
        let record = serde_json::to_string(transfer)?;
        let identifier = transfer.identifier().to_owned();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO transfers (identifier, schema_version, record) VALUES (?1, ?2, ?3)",
                    params![identifier, SCHEMA_VERSION, record],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get(&self, identifier: &str) -> Result<Option<Transfer>, StoreError> {
        let identifier = identifier.to_owned();
        let transfer = self
            .conn
            .call(move |conn| {
                let record: Option<String> = conn
                    .query_row(
                        "SELECT record FROM transfers WHERE identifier = ?1",
                        params![identifier],
                        |row| row.get(0),
                    )
                    .optional()?;
                record.as_deref().map(decode).transpose()
            })
            .await?;
        Ok(transfer)
    }

    async fn get_all(&self) -> Result<Vec<Transfer>, StoreError> {
        let transfers = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT record FROM transfers ORDER BY identifier")?;
                let rows = stmt.query_map([], |row| {
                    let record: String = row.get(0)?;
                    decode(&record)
                })?;
                rows.collect::<Result<Vec<Transfer>, rusqlite::Error>>()
            })
            .await?;
        Ok(transfers)
    }

    async fn remove(&self, identifier: &str) -> Result<(), StoreError> {
        let identifier = identifier.to_owned();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM transfers WHERE identifier = ?1", params![identifier])?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

/// Keeps transfers in process memory only.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, Transfer>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransferStore for MemoryStore {
    async fn set(&self, transfer: &Transfer) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(transfer.identifier().to_owned(), transfer.clone());
        Ok(())
    }

    async fn get(&self, identifier: &str) -> Result<Option<Transfer>, StoreError> {
        Ok(self.records.read().await.get(identifier).cloned())
    }

    async fn get_all(&self) -> Result<Vec<Transfer>, StoreError> {
        let mut all: Vec<Transfer> = self.records.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.identifier().cmp(b.identifier()));
        Ok(all)
    }

    async fn remove(&self, identifier: &str) -> Result<(), StoreError> {
        self.records.write().await.remove(identifier);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TransferRequest, TransferState};

    fn sample(id: &str) -> Transfer {
        Transfer::new(TransferRequest::download(id, "https://example.com/file", "/tmp/file"))
    }

    async fn exercise<S: TransferStore>(store: &S) {
        assert!(store.get("a").await.unwrap().is_none());

        let mut a = sample("a");
        store.set(&a).await.unwrap();
        store.set(&sample("b")).await.unwrap();

        a.state = TransferState::InProgress;
        a.bytes_to_transfer = Some(1_000);
        a.bytes_transferred = 250;
        store.set(&a).await.unwrap();

        let loaded = store.get("a").await.unwrap().unwrap();
        assert_eq!(loaded, a);

        let all = store.get_all().await.unwrap();
        let ids: Vec<_> = all.iter().map(|t| t.identifier().to_owned()).collect();
        assert_eq!(ids, ["a", "b"]);

        store.remove("a").await.unwrap();
        store.remove("missing").await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
        assert_eq!(store.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn memory_store_contract() {
        exercise(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn sqlite_store_contract() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("transfers.db");

        {
            let store = SqliteStore::open(&path).await.unwrap();
            let mut t = sample("persisted");
            t.bytes_transferred = 42;
            store.set(&t).await.unwrap();
        }

        let store = SqliteStore::open(&path).await.unwrap();
        let loaded = store.get("persisted").await.unwrap().unwrap();
        assert_eq!(loaded.bytes_transferred, 42);
        assert_eq!(loaded.state, TransferState::Pending);
    }

    #[tokio::test]
    async fn sqlite_records_carry_schema_version() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.set(&sample("v")).await.unwrap();
        let version: u32 = store
            .conn
            .call(|conn| conn.query_row("SELECT schema_version FROM transfers", [], |row| row.get(0)))
            .await
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }
}
