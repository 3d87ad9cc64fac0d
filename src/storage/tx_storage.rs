//! Hybrid storage for transaction records
//!
//! Combines SQLite (durable persistence) with an in-memory cache (fast reads).
//! Writes go through to both; the cache keeps insertion order, which is the
//! "oldest first" order used for history eviction.

use std::path::Path;
use std::sync::RwLock;

use rusqlite::{params, Connection};

use crate::tx::meta::{TxId, TxMeta};

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Transaction store with SQLite persistence + in-memory cache
pub struct TxStorage {
    /// SQLite connection for durable persistence
    conn: Connection,

    /// In-memory copy of every record, in insertion order
    cache: RwLock<Vec<TxMeta>>,
}

impl TxStorage {
    /// Open (or create) the store in `dir`
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StorageError> {
        std::fs::create_dir_all(dir.as_ref())?;
        let db_path = dir.as_ref().join("transactions.db");

        log::info!("Opening transactions database: {}", db_path.display());

        let conn = Connection::open(&db_path)?;
        Self::with_connection(conn)
    }

    /// Store backed by an in-memory database
    pub fn in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        Self::init_schema(&conn)?;
        let records = Self::load_all(&conn)?;
        log::debug!("Loaded {} transaction records", records.len());

        Ok(Self {
            conn,
            cache: RwLock::new(records),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), StorageError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS transactions (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                from_address TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                body TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_transactions_status ON transactions(status)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_transactions_from ON transactions(from_address)",
            [],
        )?;

        log::debug!("✓ Transactions schema initialized");

        Ok(())
    }

    fn load_all(conn: &Connection) -> Result<Vec<TxMeta>, StorageError> {
        let mut stmt = conn.prepare("SELECT body FROM transactions ORDER BY seq ASC")?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(StorageError::from))
            .collect()
    }

    /// Insert a new record with write-through to DB and cache
    pub fn insert(&mut self, meta: &TxMeta) -> Result<(), StorageError> {
        let body = serde_json::to_string(meta)?;

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO transactions (id, from_address, status, created_at, body)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                &meta.id,
                &meta.params.from,
                meta.status().as_str(),
                meta.time.timestamp(),
                body,
            ],
        )?;
        tx.commit()?;

        let mut cache = self
            .cache
            .write()
            .map_err(|e| StorageError::Cache(e.to_string()))?;
        cache.push(meta.clone());

        log::debug!("✓ Inserted transaction {}", meta.id);

        Ok(())
    }

    /// Replace an existing record
    pub fn update(&mut self, meta: &TxMeta) -> Result<(), StorageError> {
        let body = serde_json::to_string(meta)?;

        let tx = self.conn.transaction()?;
        let changed = tx.execute(
            "UPDATE transactions SET from_address = ?1, status = ?2, body = ?3 WHERE id = ?4",
            params![&meta.params.from, meta.status().as_str(), body, &meta.id],
        )?;
        if changed == 0 {
            return Err(StorageError::InvalidData(format!(
                "Transaction not found: {}",
                meta.id
            )));
        }
        tx.commit()?;

        let mut cache = self
            .cache
            .write()
            .map_err(|e| StorageError::Cache(e.to_string()))?;
        if let Some(slot) = cache.iter_mut().find(|m| m.id == meta.id) {
            *slot = meta.clone();
        }

        Ok(())
    }

    /// Delete records in bulk
    pub fn remove(&mut self, ids: &[TxId]) -> Result<(), StorageError> {
        if ids.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        for id in ids {
            tx.execute("DELETE FROM transactions WHERE id = ?1", params![id])?;
        }
        tx.commit()?;

        let mut cache = self
            .cache
            .write()
            .map_err(|e| StorageError::Cache(e.to_string()))?;
        cache.retain(|m| !ids.contains(&m.id));

        log::debug!("✓ Removed {} transaction records", ids.len());

        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<TxMeta>, StorageError> {
        let cache = self
            .cache
            .read()
            .map_err(|e| StorageError::Cache(e.to_string()))?;
        Ok(cache.iter().find(|m| m.id == id).cloned())
    }

    /// All records in insertion order
    pub fn all(&self) -> Result<Vec<TxMeta>, StorageError> {
        let cache = self
            .cache
            .read()
            .map_err(|e| StorageError::Cache(e.to_string()))?;
        Ok(cache.clone())
    }
}
