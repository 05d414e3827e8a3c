//! SQLite-based store implementation

use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::{KeyValueStore, StoreError, StoreResult, WriteBatch};

/// SQLite-based store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Database("connection lock poisoned".into()))
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;

        debug!("Store schema initialized");
        Ok(())
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn apply(&self, batch: WriteBatch) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for (key, value) in batch.ops() {
            match value {
                Some(value) => {
                    tx.execute(
                        "INSERT INTO kv (key, value) VALUES (?, ?)
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                        params![key, value],
                    )?;
                }
                None => {
                    tx.execute("DELETE FROM kv WHERE key = ?", params![key])?;
                }
            }
        }
        tx.commit()?;

        debug!(writes = batch.len(), "Batch applied");
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        match self.conn() {
            Ok(conn) => match conn.query_row("SELECT 1", [], |_| Ok(())) {
                Ok(_) => true,
                Err(e) => {
                    warn!(error = %e, "Database health check failed");
                    false
                }
            },
            Err(e) => {
                warn!(error = %e, "Database health check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_store() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.is_healthy());
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_put_overwrite_delete() {
        let store = SqliteStore::in_memory().unwrap();

        let mut batch = WriteBatch::new();
        batch.put("a", "1");
        batch.put("b", "2");
        batch.put("a", "3");
        store.apply(batch).unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("3"));
        assert_eq!(store.get("b").unwrap().as_deref(), Some("2"));

        let mut batch = WriteBatch::new();
        batch.delete("b");
        store.apply(batch).unwrap();
        assert!(store.get("b").unwrap().is_none());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("upkeepd.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            let mut batch = WriteBatch::new();
            batch.put("plannerItems_alice", "ciphertext");
            store.apply(batch).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(
            store.get("plannerItems_alice").unwrap().as_deref(),
            Some("ciphertext")
        );
    }
}
