//! Error types for storage operations

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The host refused to open the database (quota, disabled feature, corruption)
    #[error("Failed to open database '{name}': {reason}")]
    Open { name: String, reason: String },

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Invalid update request: key '{0}' is both inserted and deleted")]
    ConflictingKey(String),

    #[error("Database '{0}' is closed")]
    Closed(String),

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Storage is not ready: {0}")]
    NotReady(&'static str),
}

impl StorageError {
    pub(crate) fn open(name: &str, reason: impl ToString) -> Self {
        StorageError::Open {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error came from opening a database
    pub fn is_open_error(&self) -> bool {
        matches!(self, StorageError::Open { .. })
    }

    /// Whether this error came from a write that did not commit
    pub fn is_transaction_error(&self) -> bool {
        matches!(
            self,
            StorageError::Transaction(_)
                | StorageError::Commit(_)
                | StorageError::Table(_)
                | StorageError::Storage(_)
                | StorageError::Closed(_)
                | StorageError::Task(_)
        )
    }
}
