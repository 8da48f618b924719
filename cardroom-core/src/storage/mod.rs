//! Local persistence for the ledger.
//!
//! A [`KeyValueStore`] holds raw strings under flat keys, like browser
//! storage or a directory of files. [`LedgerStore`] maps ledger sections
//! onto it, one key per section.

mod file;
mod ledger_store;
mod memory;

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::ledger::LedgerError;

pub use file::FileStore;
pub use ledger_store::{LedgerStore, BACKUP_DIR};
pub use memory::MemoryStore;

/// A flat string key-value store. Writes replace the whole value.
pub trait KeyValueStore: Send + Sync {
    /// Returns `Ok(None)` when the key has never been written.
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Directory backing this store, if it lives on disk.
    fn root(&self) -> Option<&std::path::Path> {
        None
    }
}

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error for {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Invalid storage key: {0}")]
    InvalidKey(String),
    #[error("Failed to serialize value: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    InvalidSection(#[from] LedgerError),
    #[error("Backups require a file-backed store")]
    BackupUnsupported,
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Rejects keys that could escape the store's directory.
pub(crate) fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty()
        || key.contains('/')
        || key.contains('\\')
        || key.contains("..")
        || key.starts_with('.')
    {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}
