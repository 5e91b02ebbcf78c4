//! The host environment shared by every storage instance in a process

use crate::broadcast::BroadcastHub;
use crate::{Result, StorageError};
use parking_lot::{Mutex, RwLock};
use redb::{Database, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// The only table used in every database
pub(crate) const ITEM_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("ItemTable");

/// Host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Directory holding one database file per database name
    pub root: PathBuf,

    /// When false the host denies durable storage and every open fails
    pub persistent: bool,

    /// Close durable connections on shutdown instead of leaving them to
    /// drop; needed on hosts that leak open transactions across reloads
    pub close_connections_on_shutdown: bool,

    /// Per-channel buffer for cross-instance change events
    pub broadcast_capacity: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".scopekv"),
            persistent: true,
            close_connections_on_shutdown: false,
            broadcast_capacity: 256,
        }
    }
}

impl HostConfig {
    /// Default configuration rooted at `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Load a JSON configuration file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Deterministic name of the physical database behind a scope
///
/// These strings are part of the on-disk format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatabaseName(String);

impl DatabaseName {
    pub fn application() -> Self {
        Self("global".to_string())
    }

    pub fn profile(profile_id: &str) -> Self {
        Self(format!("global-{}", profile_id))
    }

    pub fn workspace(workspace_id: &str) -> Self {
        Self(workspace_id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name of the database under the host root
    pub fn file_name(&self) -> String {
        let safe: String = self
            .0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("state-db-{}.redb", safe)
    }
}

impl fmt::Display for DatabaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DatabaseName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// A physical database shared by every connection opened for one name
pub(crate) struct Connection {
    pub(crate) name: String,
    // Compaction needs exclusive access; transactions take the read side.
    pub(crate) db: RwLock<Database>,
}

/// Process-wide host: durable databases, broadcast channels and focus
///
/// Several instances (windows) in one process share one host, the same way
/// several browser tabs share one origin.
pub struct StorageHost {
    config: HostConfig,
    connections: Mutex<HashMap<String, Weak<Connection>>>,
    channels: BroadcastHub,
    focused: AtomicBool,
}

impl StorageHost {
    pub fn new(config: HostConfig) -> Arc<Self> {
        let channels = BroadcastHub::new(config.broadcast_capacity);
        Arc::new(Self {
            config,
            connections: Mutex::new(HashMap::new()),
            channels,
            focused: AtomicBool::new(true),
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn channels(&self) -> &BroadcastHub {
        &self.channels
    }

    /// Whether the top-level window has user focus
    pub fn has_focus(&self) -> bool {
        self.focused.load(Ordering::SeqCst)
    }

    pub fn set_focused(&self, focused: bool) {
        self.focused.store(focused, Ordering::SeqCst);
    }

    /// Number of live connections to the database called `name`
    pub fn open_connections(&self, name: &DatabaseName) -> usize {
        self.connections
            .lock()
            .get(name.as_str())
            .map(Weak::strong_count)
            .unwrap_or(0)
    }

    /// Open (creating if absent) the database called `name`
    ///
    /// Blocking; callers run it off the async executor.
    pub(crate) fn connect_blocking(&self, name: &str) -> Result<Arc<Connection>> {
        if !self.config.persistent {
            return Err(StorageError::open(name, "durable storage is disabled by the host"));
        }

        let mut connections = self.connections.lock();
        if let Some(existing) = connections.get(name).and_then(Weak::upgrade) {
            debug!(database = name, "reusing open database");
            return Ok(existing);
        }

        std::fs::create_dir_all(&self.config.root).map_err(|e| StorageError::open(name, e))?;
        let path = self.config.root.join(DatabaseName::from(name).file_name());
        let db = Database::create(&path).map_err(|e| StorageError::open(name, e))?;

        let write_txn = db.begin_write().map_err(|e| StorageError::open(name, e))?;
        write_txn
            .open_table(ITEM_TABLE)
            .map_err(|e| StorageError::open(name, e))?;
        write_txn.commit().map_err(|e| StorageError::open(name, e))?;

        debug!(database = name, path = %path.display(), "opened database");
        let connection = Arc::new(Connection {
            name: name.to_string(),
            db: RwLock::new(db),
        });
        connections.retain(|_, weak| weak.strong_count() > 0);
        connections.insert(name.to_string(), Arc::downgrade(&connection));
        Ok(connection)
    }
}
