//! SQLite-backed [`DeviceStorage`], for hosts that hand the core a file path
//! instead of a native key/value store.

use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

use super::kv::{DeviceStorage, KvError, StorageErrorCode, MAX_VALUE_SIZE};
use crate::lock;

pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
        let conn = Connection::open(path.as_ref()).map_err(map_sqlite_error)?;
        info!(path = %path.as_ref().display(), "opened sqlite key/value store");
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, KvError> {
        Self::from_connection(Connection::open_in_memory().map_err(map_sqlite_error)?)
    }

    fn from_connection(conn: Connection) -> Result<Self, KvError> {
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )
        .map_err(map_sqlite_error)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, KvError>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&conn);
            f(&mut guard).map_err(map_sqlite_error)
        })
        .await
        .map_err(|e| KvError::storage(StorageErrorCode::Unknown, e.to_string()))?
    }
}

fn map_sqlite_error(e: rusqlite::Error) -> KvError {
    let code = match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) => StorageErrorCode::Busy,
        Some(ErrorCode::DatabaseLocked) => StorageErrorCode::Locked,
        Some(ErrorCode::DiskFull) => StorageErrorCode::DiskFull,
        Some(ErrorCode::PermissionDenied | ErrorCode::ReadOnly) => {
            StorageErrorCode::PermissionDenied
        }
        Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase) => StorageErrorCode::Corrupted,
        Some(ErrorCode::SystemIoFailure | ErrorCode::CannotOpen) => StorageErrorCode::IoError,
        _ => StorageErrorCode::Unknown,
    };
    KvError::storage(code, e.to_string())
}

#[async_trait]
impl DeviceStorage for SqliteStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>, KvError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
        })
        .await
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), KvError> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(KvError::ValueTooLarge {
                size: value.len(),
                max: MAX_VALUE_SIZE,
            });
        }
        let (key, value) = (key.to_string(), value.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map(|_| ())
        })
        .await
    }

    async fn remove_item(&self, key: &str) -> Result<(), KvError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
                .map(|_| ())
        })
        .await
    }

    async fn multi_remove(&self, keys: &[String]) -> Result<(), KvError> {
        let keys = keys.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare("DELETE FROM kv WHERE key = ?1")?;
                for key in &keys {
                    stmt.execute(params![key])?;
                }
            }
            tx.commit()
        })
        .await
    }

    async fn all_keys(&self) -> Result<Vec<String>, KvError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY key")?;
            let keys = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(keys)
        })
        .await
    }
}
