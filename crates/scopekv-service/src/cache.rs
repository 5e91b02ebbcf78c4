//! Cache layer over a scoped database
//!
//! Holds every item of one database in memory, tracks the minimal set of
//! inserts and deletes since the last flush, and reports changes.

use crate::listeners::Listeners;
use parking_lot::Mutex;
use scopekv_storage::{Result, ScopedDatabase, StorageItemsChangeEvent, UpdateRequest};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// A single changed key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: String,
    /// Applied from another instance rather than set locally
    pub external: bool,
}

#[derive(Default)]
struct CacheState {
    items: HashMap<String, String>,
    pending_inserts: HashMap<String, String>,
    pending_deletes: HashSet<String>,
}

/// Cached view of one scope's database
pub struct Storage {
    database: Arc<ScopedDatabase>,
    state: Mutex<CacheState>,
    changes: Listeners<StorageChange>,
    // Flushes run one at a time so writes commit in call order.
    flushing: tokio::sync::Mutex<()>,
}

impl Storage {
    pub fn new(database: Arc<ScopedDatabase>) -> Self {
        Self {
            database,
            state: Mutex::new(CacheState::default()),
            changes: Listeners::new(),
            flushing: tokio::sync::Mutex::new(()),
        }
    }

    pub fn database(&self) -> &Arc<ScopedDatabase> {
        &self.database
    }

    /// Load every item from the database into the cache
    pub async fn init(&self) -> Result<()> {
        let items = self.database.get_items().await?;
        self.state.lock().items = items;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.state.lock().items.get(key).cloned()
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).map(|value| value == "true")
    }

    pub fn items(&self) -> HashMap<String, String> {
        self.state.lock().items.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Set a value; no-op if it is unchanged
    pub fn set(&self, key: &str, value: impl Into<String>) {
        let value = value.into();
        {
            let mut state = self.state.lock();
            if state.items.get(key) == Some(&value) {
                return;
            }
            state.items.insert(key.to_string(), value.clone());
            state.pending_deletes.remove(key);
            state.pending_inserts.insert(key.to_string(), value);
        }
        self.emit(key, false);
    }

    /// Delete a value; no-op if it is absent
    pub fn delete(&self, key: &str) {
        {
            let mut state = self.state.lock();
            if state.items.remove(key).is_none() {
                return;
            }
            state.pending_inserts.remove(key);
            state.pending_deletes.insert(key.to_string());
        }
        self.emit(key, false);
    }

    /// Whether local changes are waiting to be flushed
    pub fn has_pending_changes(&self) -> bool {
        let state = self.state.lock();
        !state.pending_inserts.is_empty() || !state.pending_deletes.is_empty()
    }

    /// Every change from now on, in the order it was applied
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StorageChange> {
        self.changes.subscribe()
    }

    /// Write every pending change to the database as one request
    ///
    /// Resolves once all changes made before the call are committed. If the
    /// write fails the attempted changes are dropped and the error returned.
    pub async fn flush(&self) -> Result<()> {
        let _flushing = self.flushing.lock().await;

        let request = {
            let mut state = self.state.lock();
            UpdateRequest {
                insert: std::mem::take(&mut state.pending_inserts),
                delete: std::mem::take(&mut state.pending_deletes),
            }
        };
        if request.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.database.update_items(&request).await {
            error!(database = %self.database.name(), error = %e, "failed to flush storage");
            return Err(e);
        }
        Ok(())
    }

    /// Apply changes committed by another instance
    ///
    /// Only the cache is updated; nothing is written back to the database.
    pub fn accept_external(&self, event: StorageItemsChangeEvent) {
        let mut changed = Vec::new();
        {
            let mut state = self.state.lock();
            for (key, value) in event.changed {
                if state.items.get(&key) != Some(&value) {
                    state.items.insert(key.clone(), value);
                    changed.push(key);
                }
            }
            for key in event.deleted {
                if state.items.remove(&key).is_some() {
                    changed.push(key);
                }
            }
        }

        for key in changed {
            self.emit(&key, true);
        }
    }

    /// Re-read the database after missing changes from other instances
    ///
    /// Keys with local changes that are not flushed yet keep their local
    /// state; everything else is brought in line with the database and
    /// reported as external.
    pub async fn reload(&self) -> Result<()> {
        let _flushing = self.flushing.lock().await;
        let items = self.database.get_items().await?;

        let event = {
            let state = self.state.lock();
            let mut event = StorageItemsChangeEvent::default();
            for (key, value) in items {
                if !state.pending_inserts.contains_key(&key) && !state.pending_deletes.contains(&key) {
                    event.changed.insert(key, value);
                }
            }
            for key in state.items.keys() {
                if !event.changed.contains_key(key) && !state.pending_inserts.contains_key(key) {
                    event.deleted.insert(key.clone());
                }
            }
            event
        };
        debug!(database = %self.database.name(), "reloaded storage");
        self.accept_external(event);
        Ok(())
    }

    fn emit(&self, key: &str, external: bool) {
        self.changes.emit(StorageChange {
            key: key.to_string(),
            external,
        });
    }
}
