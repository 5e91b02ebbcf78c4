//! scopekv storage - durable and fallback item stores for scoped state
//!
//! This crate provides the leaf layers of the scoped key-value service:
//! - A durable store backed by redb, one database per name
//! - An in-memory fallback with the same contract
//! - A broadcaster that fans committed changes out to sibling instances
//! - `ScopedDatabase`, which pairs a store with its broadcaster
//!
//! ## Architecture
//!
//! All instances in a process share one [`StorageHost`]. The host owns the
//! physical databases (shared between connections to the same name), the
//! broadcast channels and the focus flag. Instances never talk to each
//! other except through committed writes and broadcast events.

mod broadcast;
mod error;
mod host;
mod memory;
mod provider;
mod redb_storage;
mod scoped;

pub use broadcast::{
    is_storage_items_change_event, BroadcastHub, BroadcastReceiver, Broadcaster,
    ChannelMessage, StorageItemsChangeEvent,
};
pub use error::{Result, StorageError};
pub use host::{DatabaseName, HostConfig, StorageHost};
pub use memory::InMemoryStore;
pub use provider::{ItemStore, UpdateRequest};
pub use redb_storage::DurableStore;
pub use scoped::ScopedDatabase;
