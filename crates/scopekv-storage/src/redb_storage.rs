//! redb-based durable item store

use crate::host::{Connection, ITEM_TABLE};
use crate::{DatabaseName, ItemStore, Result, StorageError, StorageHost, UpdateRequest};
use async_trait::async_trait;
use parking_lot::Mutex;
use redb::{ReadableTable, WriteTransaction};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// redb-based durable store
///
/// Holds one connection to the shared physical database for a name. Every
/// operation runs on the blocking pool and owns its own handle to the
/// connection, so closing the store never truncates a write in flight.
pub struct DurableStore {
    name: String,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl DurableStore {
    /// Open (creating if absent) the database called `name`
    ///
    /// Fails with [`StorageError::Open`] if the host denies storage. The
    /// failure is not retried here.
    pub async fn connect(host: &Arc<StorageHost>, name: &DatabaseName) -> Result<Self> {
        let host = Arc::clone(host);
        let db_name = name.to_string();
        let connection = tokio::task::spawn_blocking(move || host.connect_blocking(&db_name))
            .await
            .map_err(|e| StorageError::open(name.as_str(), e))??;

        Ok(Self {
            name: name.to_string(),
            connection: Mutex::new(Some(connection)),
        })
    }

    fn connection(&self) -> Result<Arc<Connection>> {
        self.connection
            .lock()
            .clone()
            .ok_or_else(|| StorageError::Closed(self.name.clone()))
    }
}

#[async_trait]
impl ItemStore for DurableStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_durable(&self) -> bool {
        true
    }

    async fn get_items(&self) -> Result<HashMap<String, String>> {
        let connection = self.connection()?;
        tokio::task::spawn_blocking(move || read_items(&connection)).await?
    }

    async fn update_items(&self, request: &UpdateRequest) -> Result<bool> {
        request.validate()?;
        if request.is_empty() {
            return Ok(false);
        }

        let connection = self.connection()?;
        let request = request.clone();
        tokio::task::spawn_blocking(move || write_items(&connection, &request)).await??;
        Ok(true)
    }

    async fn clear(&self) -> Result<()> {
        let connection = self.connection()?;
        tokio::task::spawn_blocking(move || clear_items(&connection)).await?
    }

    async fn close(&self) -> Result<()> {
        if self.connection.lock().take().is_some() {
            debug!(database = %self.name, "closed database connection");
        }
        Ok(())
    }

    async fn optimize(&self) -> Result<()> {
        let connection = self.connection()?;
        tokio::task::spawn_blocking(move || {
            let mut db = connection.db.write();
            match db.compact() {
                Ok(compacted) => debug!(database = %connection.name, compacted, "compaction finished"),
                Err(e) => warn!(database = %connection.name, error = %e, "compaction skipped"),
            }
        })
        .await?;
        Ok(())
    }
}

fn read_items(connection: &Connection) -> Result<HashMap<String, String>> {
    let db = connection.db.read();
    let read_txn = db.begin_read()?;
    let table = read_txn.open_table(ITEM_TABLE)?;

    let mut items = HashMap::new();
    for entry in table.iter()? {
        let (key, value) = entry?;
        match std::str::from_utf8(value.value()) {
            Ok(value) => {
                items.insert(key.value().to_string(), value.to_string());
            }
            Err(_) => {
                debug!(database = %connection.name, key = key.value(), "skipping non-string value");
            }
        }
    }

    Ok(items)
}

fn write_items(connection: &Connection, request: &UpdateRequest) -> Result<()> {
    let db = connection.db.read();
    // Dropping an uncommitted transaction aborts it, so any error below
    // leaves the table exactly as it was.
    let write_txn = db.begin_write()?;
    stage_items(&write_txn, request)?;
    write_txn.commit()?;
    Ok(())
}

fn stage_items(write_txn: &WriteTransaction, request: &UpdateRequest) -> Result<()> {
    let mut table = write_txn.open_table(ITEM_TABLE)?;
    for (key, value) in &request.insert {
        table.insert(key.as_str(), value.as_bytes())?;
    }
    for key in &request.delete {
        table.remove(key.as_str())?;
    }
    Ok(())
}

fn clear_items(connection: &Connection) -> Result<()> {
    let db = connection.db.read();
    let write_txn = db.begin_write()?;
    {
        let mut table = write_txn.open_table(ITEM_TABLE)?;
        let keys: Vec<String> = table
            .iter()?
            .map(|r| r.map(|(k, _)| k.value().to_string()))
            .collect::<std::result::Result<_, _>>()?;
        for key in keys {
            table.remove(key.as_str())?;
        }
    }
    write_txn.commit()?;
    Ok(())
}
