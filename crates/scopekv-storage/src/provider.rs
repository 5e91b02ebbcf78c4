//! Item store trait and the batched update request

use crate::{Result, StorageError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Pluggable item store interface
///
/// Implemented by the durable backend and by the in-memory fallback, so
/// the layers above cannot tell which one they are talking to.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Name of the database this store was opened for
    fn name(&self) -> &str;

    /// Whether writes survive a close and reopen
    fn is_durable(&self) -> bool;

    /// Read every entry
    ///
    /// Entries whose stored value is not a string are skipped.
    async fn get_items(&self) -> Result<HashMap<String, String>>;

    /// Apply all inserts and deletes of `request` in one transaction
    ///
    /// Returns `false` without touching the store if the request is empty.
    async fn update_items(&self, request: &UpdateRequest) -> Result<bool>;

    /// Delete every entry in one transaction
    async fn clear(&self) -> Result<()>;

    /// Release the connection
    async fn close(&self) -> Result<()>;

    /// Best-effort compaction
    async fn optimize(&self) -> Result<()> {
        Ok(())
    }
}

/// A single atomic unit of inserts and deletes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    #[serde(default)]
    pub insert: HashMap<String, String>,
    #[serde(default)]
    pub delete: HashSet<String>,
}

impl UpdateRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert.insert(key.into(), value.into());
        self
    }

    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.delete.insert(key.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.insert.is_empty() && self.delete.is_empty()
    }

    /// Reject requests that both insert and delete the same key
    pub fn validate(&self) -> Result<()> {
        if let Some(key) = self.delete.iter().find(|key| self.insert.contains_key(*key)) {
            return Err(StorageError::ConflictingKey(key.clone()));
        }
        Ok(())
    }
}
