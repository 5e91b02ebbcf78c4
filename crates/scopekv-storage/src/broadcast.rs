//! Cross-instance change broadcasting
//!
//! Every instance that opens a database also joins a channel named after
//! it. Committed deltas are posted as untyped JSON and validated on the
//! receiving side. Delivery is best-effort with per-sender FIFO order and
//! never echoes back to the sender.

use crate::{DatabaseName, Result, UpdateRequest};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// A committed set of changes to one database
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageItemsChangeEvent {
    #[serde(default)]
    pub changed: HashMap<String, String>,
    #[serde(default)]
    pub deleted: HashSet<String>,
}

impl From<&UpdateRequest> for StorageItemsChangeEvent {
    fn from(request: &UpdateRequest) -> Self {
        Self {
            changed: request.insert.clone(),
            deleted: request.delete.clone(),
        }
    }
}

/// Check that an untyped payload has the shape of a change event
pub fn is_storage_items_change_event(value: &Value) -> bool {
    let Some(object) = value.as_object() else {
        return false;
    };

    let changed = object.get("changed");
    let deleted = object.get("deleted");
    if changed.is_none() && deleted.is_none() {
        return false;
    }

    let changed_ok = changed.map_or(true, |changed| {
        changed
            .as_object()
            .map_or(false, |map| map.values().all(Value::is_string))
    });
    let deleted_ok = deleted.map_or(true, |deleted| {
        deleted
            .as_array()
            .map_or(false, |keys| keys.iter().all(Value::is_string))
    });

    changed_ok && deleted_ok
}

/// What a member of a channel hears
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Changed(StorageItemsChangeEvent),
    /// This many events were overwritten before they were read; the
    /// listener's view of the database may be stale
    Missed(u64),
}

impl ChannelMessage {
    pub fn into_change(self) -> Option<StorageItemsChangeEvent> {
        match self {
            ChannelMessage::Changed(event) => Some(event),
            ChannelMessage::Missed(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Envelope {
    sender: u64,
    payload: Value,
}

/// Registry of named channels shared by every instance on one host
///
/// A channel lives as long as the hub; receivers see the end of a channel
/// only once the hub and every member are dropped.
pub struct BroadcastHub {
    capacity: usize,
    channels: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
    next_id: AtomicU64,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Join the channel named after `name`
    pub fn join(&self, name: &DatabaseName) -> Broadcaster {
        let sender = self
            .channels
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone();

        Broadcaster {
            channel: name.to_string(),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            sender,
        }
    }
}

/// One instance's membership in a named channel
pub struct Broadcaster {
    channel: String,
    id: u64,
    sender: broadcast::Sender<Envelope>,
}

impl Broadcaster {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Publish a change event to every other member of the channel
    pub fn post_data(&self, event: &StorageItemsChangeEvent) -> Result<()> {
        self.post_json(serde_json::to_value(event)?);
        Ok(())
    }

    /// Publish an arbitrary payload; receivers drop anything that does not
    /// validate as a change event
    pub fn post_json(&self, payload: Value) {
        let envelope = Envelope {
            sender: self.id,
            payload,
        };
        if self.sender.send(envelope).is_err() {
            debug!(channel = %self.channel, "no listeners for change event");
        }
    }

    /// Listen for events posted by other members
    pub fn subscribe(&self) -> BroadcastReceiver {
        BroadcastReceiver {
            channel: self.channel.clone(),
            id: self.id,
            receiver: self.sender.subscribe(),
        }
    }
}

/// Stream of validated change events from other members of a channel
pub struct BroadcastReceiver {
    channel: String,
    id: u64,
    receiver: broadcast::Receiver<Envelope>,
}

impl BroadcastReceiver {
    /// Wait for the next event from another member
    ///
    /// Returns `None` once the hub and every member of the channel are
    /// gone. Falling behind the channel capacity yields
    /// [`ChannelMessage::Missed`] before the next event.
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) if envelope.sender == self.id => continue,
                Ok(envelope) => {
                    if !is_storage_items_change_event(&envelope.payload) {
                        warn!(channel = %self.channel, "ignoring malformed change event");
                        continue;
                    }
                    match serde_json::from_value(envelope.payload) {
                        Ok(event) => return Some(ChannelMessage::Changed(event)),
                        Err(e) => {
                            warn!(channel = %self.channel, error = %e, "ignoring undecodable change event");
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.channel, skipped, "change events missed");
                    return Some(ChannelMessage::Missed(skipped));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
