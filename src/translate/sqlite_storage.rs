//! Durable key-value storage backed by SQLite.
//! Plays the role of browser local storage: one `kv` table, WAL mode, and an
//! optional size cap enforced through `max_page_count` so a full database
//! reports `StorageError::QuotaExceeded` like an exhausted storage quota.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::{debug, info};

use super::storage::{KeyValueStorage, StorageError};

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open (or create) the storage database at the given path.
    /// `max_bytes` caps the database file size; `None` leaves SQLite's default.
    pub fn open(db_path: &Path, max_bytes: Option<u64>) -> Result<Self, StorageError> {
        let conn = Connection::open(db_path)
            .map_err(|e| StorageError::Backend(format!("failed to open SQLite storage: {e}")))?;
        let storage = Self::init(conn, max_bytes)?;
        info!(path = %db_path.display(), ?max_bytes, "SQLite storage opened");
        Ok(storage)
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory(max_bytes: Option<u64>) -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StorageError::Backend(format!("failed to open SQLite storage: {e}")))?;
        Self::init(conn, max_bytes)
    }

    fn init(conn: Connection, max_bytes: Option<u64>) -> Result<Self, StorageError> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| StorageError::Backend(format!("PRAGMA failed: {e}")))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )
        .map_err(|e| StorageError::Backend(format!("create table failed: {e}")))?;

        if let Some(max_bytes) = max_bytes {
            let page_size: i64 = conn
                .query_row("PRAGMA page_size", [], |row| row.get(0))
                .map_err(|e| StorageError::Backend(format!("page_size query failed: {e}")))?;
            let pages = (max_bytes as i64 / page_size.max(1)).max(1);
            let applied: i64 = conn
                .query_row(&format!("PRAGMA max_page_count = {pages}"), [], |row| row.get(0))
                .map_err(|e| StorageError::Backend(format!("max_page_count failed: {e}")))?;
            debug!(page_size, requested_pages = pages, applied_pages = applied, "storage quota set");
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl KeyValueStorage for SqliteStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM kv WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(map_sqlite_error)
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )
        .map(|_| ())
        .map_err(map_sqlite_error)
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
            .map(|_| ())
            .map_err(map_sqlite_error)
    }
}

fn map_sqlite_error(e: rusqlite::Error) -> StorageError {
    match e {
        rusqlite::Error::SqliteFailure(ref err, _) if err.code == ErrorCode::DiskFull => {
            StorageError::QuotaExceeded
        }
        other => StorageError::Backend(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.db");

        {
            let storage = SqliteStorage::open(&path, None).unwrap();
            storage.set_item("userLanguage", "ja").unwrap();
            storage.set_item("other", "x").unwrap();
            storage.remove_item("other").unwrap();
        }

        let storage = SqliteStorage::open(&path, None).unwrap();
        assert_eq!(storage.get_item("userLanguage").unwrap().as_deref(), Some("ja"));
        assert_eq!(storage.get_item("other").unwrap(), None);
    }

    #[test]
    fn overwrite_replaces_value() {
        let storage = SqliteStorage::open_in_memory(None).unwrap();
        storage.set_item("k", "one").unwrap();
        storage.set_item("k", "two").unwrap();
        assert_eq!(storage.get_item("k").unwrap().as_deref(), Some("two"));
    }

    #[test]
    fn disk_full_maps_to_quota_exceeded() {
        let err = map_sqlite_error(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_FULL),
            None,
        ));
        assert!(matches!(err, StorageError::QuotaExceeded));
    }
}
