//! Persistent key-value store bound to script scope
//!
//! An embedded disk-backed B-tree: one table per bucket, keys and values
//! are opaque strings (values carry JSON). The database file is opened
//! at engine init; the advisory file lock is retried for up to a second,
//! after which a second open is a hard error.

use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::time::{Duration, Instant};

const LOCK_TIMEOUT: Duration = Duration::from_secs(1);
const LOCK_RETRY: Duration = Duration::from_millis(50);

/// Default file mode of the database
pub const DB_FILE_MODE: u32 = 0o640;

/// Storage errors
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    /// Open failure: locked by another process past the timeout,
    /// unreadable, or corrupt. Fatal at engine init.
    #[error("can't open persistent DB file: {0}")]
    Open(String),

    #[error("persistent DB access failed: {0}")]
    Access(String),
}

fn access(e: impl std::fmt::Display) -> StorageError {
    StorageError::Access(e.to_string())
}

/// Handle to the persistent database
pub struct PersistentStore {
    db: Database,
}

impl PersistentStore {
    /// Open or create the database file.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let deadline = Instant::now() + LOCK_TIMEOUT;
        let db = loop {
            match Database::create(path) {
                Ok(db) => break db,
                Err(e) if Instant::now() < deadline => {
                    tracing::debug!("persistent DB busy ({}), retrying", e);
                    std::thread::sleep(LOCK_RETRY);
                }
                Err(e) => return Err(StorageError::Open(e.to_string())),
            }
        };
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) =
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(DB_FILE_MODE))
            {
                tracing::warn!("failed to set persistent DB mode: {}", e);
            }
        }
        Ok(Self { db })
    }

    /// Store a JSON-serialized value.
    pub fn set(&self, bucket: &str, key: &str, value: &str) -> Result<(), StorageError> {
        let table_def = TableDefinition::<&str, &str>::new(bucket);
        let tx = self.db.begin_write().map_err(access)?;
        {
            let mut table = tx.open_table(table_def).map_err(access)?;
            table.insert(key, value).map_err(access)?;
        }
        tx.commit().map_err(access)?;
        tracing::debug!(
            "write value to persistent storage {}: '{}' <= '{}'",
            bucket,
            key,
            value
        );
        Ok(())
    }

    /// Fetch a JSON-serialized value; missing bucket or key is `None`.
    pub fn get(&self, bucket: &str, key: &str) -> Result<Option<String>, StorageError> {
        let table_def = TableDefinition::<&str, &str>::new(bucket);
        let tx = self.db.begin_read().map_err(access)?;
        let table = match tx.open_table(table_def) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(access(e)),
        };
        let value = table.get(key).map_err(access)?;
        Ok(value.map(|guard| guard.value().to_string()))
    }
}
