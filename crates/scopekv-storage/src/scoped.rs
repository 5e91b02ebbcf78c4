//! A store paired with its broadcast channel

use crate::broadcast::{BroadcastReceiver, Broadcaster, StorageItemsChangeEvent};
use crate::{DatabaseName, DurableStore, InMemoryStore, ItemStore, Result, StorageHost, UpdateRequest};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// One scope's database: a durable or fallback store plus its broadcaster
///
/// Tracks writes in flight so callers can tell when the backend is busy,
/// and republishes every committed write to other instances.
pub struct ScopedDatabase {
    name: DatabaseName,
    store: Box<dyn ItemStore>,
    broadcaster: Broadcaster,
    pending: AtomicUsize,
    settled: Notify,
}

impl ScopedDatabase {
    /// Open the durable database for `name`, falling back to memory if the
    /// host refuses
    pub async fn open(host: &Arc<StorageHost>, name: DatabaseName) -> Self {
        let store: Box<dyn ItemStore> = match DurableStore::connect(host, &name).await {
            Ok(store) => Box::new(store),
            Err(e) => {
                warn!(database = %name, error = %e, "falling back to in-memory storage");
                Box::new(InMemoryStore::new(name.as_str()))
            }
        };
        Self::with_store(host, name, store)
    }

    /// A database that never touches the durable backend
    pub fn in_memory(host: &Arc<StorageHost>, name: DatabaseName) -> Self {
        let store = Box::new(InMemoryStore::new(name.as_str()));
        Self::with_store(host, name, store)
    }

    fn with_store(host: &Arc<StorageHost>, name: DatabaseName, store: Box<dyn ItemStore>) -> Self {
        let broadcaster = host.channels().join(&name);
        Self {
            name,
            store,
            broadcaster,
            pending: AtomicUsize::new(0),
            settled: Notify::new(),
        }
    }

    pub fn name(&self) -> &DatabaseName {
        &self.name
    }

    /// False when running on the in-memory fallback
    pub fn is_durable(&self) -> bool {
        self.store.is_durable()
    }

    /// Whether an `update_items` call has not settled yet
    pub fn has_pending_update(&self) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }

    pub async fn get_items(&self) -> Result<HashMap<String, String>> {
        self.store.get_items().await
    }

    /// Write `request` and publish it to other instances once committed
    ///
    /// Overlapping calls are not serialized here; ordering is the caller's
    /// job.
    pub async fn update_items(&self, request: &UpdateRequest) -> Result<bool> {
        let _pending = PendingGuard::new(self);

        let did_update = self.store.update_items(request).await?;
        if did_update {
            if let Err(e) = self
                .broadcaster
                .post_data(&StorageItemsChangeEvent::from(request))
            {
                warn!(database = %self.name, error = %e, "failed to broadcast change");
            }
        }
        Ok(did_update)
    }

    /// Events committed by other instances sharing this database name
    pub fn subscribe(&self) -> BroadcastReceiver {
        self.broadcaster.subscribe()
    }

    /// Wait until no update is in flight
    pub async fn when_settled(&self) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.has_pending_update() {
                return;
            }
            notified.await;
        }
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.clear().await
    }

    pub async fn optimize(&self) -> Result<()> {
        self.store.optimize().await
    }

    /// Close the store after pending updates settle
    pub async fn close(&self) -> Result<()> {
        self.when_settled().await;
        debug!(database = %self.name, "closing database");
        self.store.close().await
    }
}

struct PendingGuard<'a> {
    database: &'a ScopedDatabase,
}

impl<'a> PendingGuard<'a> {
    fn new(database: &'a ScopedDatabase) -> Self {
        database.pending.fetch_add(1, Ordering::SeqCst);
        Self { database }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.database.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.database.settled.notify_waiters();
        }
    }
}
