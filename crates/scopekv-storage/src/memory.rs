//! In-memory fallback store

use crate::{ItemStore, Result, UpdateRequest};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// In-memory item store
///
/// Non-persistent substitute for the durable store, used when the host
/// refuses to open a database. All data is lost when the store is dropped.
pub struct InMemoryStore {
    name: String,
    items: RwLock<HashMap<String, String>>,
}

impl InMemoryStore {
    /// Create a new empty in-memory store
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ItemStore for InMemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_durable(&self) -> bool {
        false
    }

    async fn get_items(&self) -> Result<HashMap<String, String>> {
        Ok(self.items.read().clone())
    }

    async fn update_items(&self, request: &UpdateRequest) -> Result<bool> {
        request.validate()?;
        if request.is_empty() {
            return Ok(false);
        }

        let mut items = self.items.write();
        for (key, value) in &request.insert {
            items.insert(key.clone(), value.clone());
        }
        for key in &request.delete {
            items.remove(key);
        }
        Ok(true)
    }

    async fn clear(&self) -> Result<()> {
        self.items.write().clear();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // Nothing to release
        Ok(())
    }
}
