//! Storage service owning the application, profile and workspace scopes

use crate::cache::Storage;
use crate::listeners::Listeners;
use crate::types::{
    can_switch_profile, StorageEvent, StorageScope, StorageTarget, UserDataProfile,
    WorkspaceIdentifier, IS_NEW_KEY, TARGET_KEY,
};
use futures::future::join_all;
use scopekv_storage::{
    ChannelMessage, DatabaseName, Result, ScopedDatabase, StorageError, StorageHost,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// One scope's storage plus the tasks that route its events
struct ScopeSlot {
    scope: StorageScope,
    storage: Arc<Storage>,
    /// Shares the application storage instead of owning a database
    aliased: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl ScopeSlot {
    fn database(&self) -> &Arc<ScopedDatabase> {
        self.storage.database()
    }
}

impl Drop for ScopeSlot {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

struct Scopes {
    application: ScopeSlot,
    profile: ScopeSlot,
    workspace: ScopeSlot,
}

impl Scopes {
    fn slot(&self, scope: StorageScope) -> &ScopeSlot {
        match scope {
            StorageScope::Application => &self.application,
            StorageScope::Profile => &self.profile,
            StorageScope::Workspace => &self.workspace,
        }
    }

    /// Each physical storage once, skipping an aliased profile
    fn owned(&self) -> Vec<&ScopeSlot> {
        let mut slots = vec![&self.application];
        if !self.profile.aliased {
            slots.push(&self.profile);
        }
        slots.push(&self.workspace);
        slots
    }
}

enum ServiceState {
    Uninitialized,
    Ready(Scopes),
    Closed,
}

/// Owner of the three scoped storages of one instance
///
/// Guarantees one open database per scope. A profile that uses default
/// storage is an alias of the application storage: its writes land in the
/// application database and its events are re-emitted tagged as profile.
pub struct StorageService {
    host: Arc<StorageHost>,
    profile: UserDataProfile,
    workspace: WorkspaceIdentifier,
    state: ServiceState,
    events: Arc<Listeners<StorageEvent>>,
}

impl StorageService {
    pub fn new(
        host: Arc<StorageHost>,
        profile: UserDataProfile,
        workspace: WorkspaceIdentifier,
    ) -> Self {
        Self {
            host,
            profile,
            workspace,
            state: ServiceState::Uninitialized,
            events: Arc::new(Listeners::new()),
        }
    }

    pub fn host(&self) -> &Arc<StorageHost> {
        &self.host
    }

    pub fn profile(&self) -> &UserDataProfile {
        &self.profile
    }

    pub fn workspace(&self) -> &WorkspaceIdentifier {
        &self.workspace
    }

    /// Every storage event from now on; nothing is dropped for a slow reader
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StorageEvent> {
        self.events.subscribe()
    }

    /// Open all three scopes
    ///
    /// A scope whose database cannot be opened or read runs on volatile
    /// in-memory storage; it never keeps the other scopes from starting.
    pub async fn initialize(&mut self) -> Result<()> {
        match self.state {
            ServiceState::Uninitialized => {}
            ServiceState::Ready(_) => return Ok(()),
            ServiceState::Closed => return Err(StorageError::NotReady("storage service is closed")),
        }

        let host = &self.host;
        let profile_name = profile_database_name(&self.profile);
        let (application, profile, workspace) = tokio::join!(
            open_storage(host, DatabaseName::application()),
            async {
                match &profile_name {
                    Some(name) => Some(open_storage(host, name.clone()).await),
                    None => None,
                }
            },
            open_storage(host, DatabaseName::workspace(&self.workspace.id)),
        );

        let application = make_slot(StorageScope::Application, application, false, &self.events);
        let profile = match profile {
            Some(storage) => make_slot(StorageScope::Profile, storage, false, &self.events),
            None => make_slot(
                StorageScope::Profile,
                Arc::clone(&application.storage),
                true,
                &self.events,
            ),
        };
        let workspace = make_slot(StorageScope::Workspace, workspace, false, &self.events);

        debug!(
            profile = %self.profile.id,
            workspace = %self.workspace.id,
            aliased = profile.aliased,
            "storage initialized"
        );
        self.state = ServiceState::Ready(Scopes {
            application,
            profile,
            workspace,
        });
        Ok(())
    }

    fn scopes(&self) -> Result<&Scopes> {
        match &self.state {
            ServiceState::Ready(scopes) => Ok(scopes),
            ServiceState::Uninitialized => Err(StorageError::NotReady("storage service is not initialized")),
            ServiceState::Closed => Err(StorageError::NotReady("storage service is closed")),
        }
    }

    /// The cache layer behind `scope`
    pub fn storage(&self, scope: StorageScope) -> Result<Arc<Storage>> {
        Ok(Arc::clone(&self.scopes()?.slot(scope).storage))
    }

    /// The database behind `scope`
    pub fn database(&self, scope: StorageScope) -> Result<Arc<ScopedDatabase>> {
        Ok(Arc::clone(self.scopes()?.slot(scope).database()))
    }

    /// Whether profile storage is the application storage
    pub fn is_profile_aliased(&self) -> bool {
        self.scopes().map(|scopes| scopes.profile.aliased).unwrap_or(false)
    }

    pub fn get(&self, key: &str, scope: StorageScope) -> Result<Option<String>> {
        Ok(self.scopes()?.slot(scope).storage.get(key))
    }

    pub fn get_bool(&self, key: &str, scope: StorageScope) -> Result<Option<bool>> {
        Ok(self.scopes()?.slot(scope).storage.get_bool(key))
    }

    /// Whether `scope` was initialized for the first time in this run
    pub fn is_new(&self, scope: StorageScope) -> Result<bool> {
        Ok(self.get_bool(IS_NEW_KEY, scope)? == Some(true))
    }

    pub fn store(
        &self,
        key: &str,
        value: impl Into<String>,
        scope: StorageScope,
        target: StorageTarget,
    ) -> Result<()> {
        let storage = &self.scopes()?.slot(scope).storage;
        let mut targets = read_targets(storage);
        if targets.get(key) != Some(&target) {
            targets.insert(key.to_string(), target);
            storage.set(TARGET_KEY, serde_json::to_string(&targets)?);
        }
        storage.set(key, value);
        Ok(())
    }

    pub fn remove(&self, key: &str, scope: StorageScope) -> Result<()> {
        let storage = &self.scopes()?.slot(scope).storage;
        let mut targets = read_targets(storage);
        if targets.remove(key).is_some() {
            storage.set(TARGET_KEY, serde_json::to_string(&targets)?);
        }
        storage.delete(key);
        Ok(())
    }

    /// Keys stored in `scope` for `target`, sorted
    pub fn keys(&self, scope: StorageScope, target: StorageTarget) -> Result<Vec<String>> {
        let storage = &self.scopes()?.slot(scope).storage;
        let mut keys: Vec<String> = read_targets(storage)
            .into_iter()
            .filter(|(key, key_target)| *key_target == target && storage.get(key).is_some())
            .map(|(key, _)| key)
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Move profile storage to `to`
    ///
    /// No-op when `to` does not change where profile state lives. Otherwise
    /// the old profile database is closed (unless it is the application
    /// database), the new one opened, and a change event emitted for every
    /// key whose value differs between the two.
    pub async fn switch_to_profile(&mut self, to: UserDataProfile) -> Result<()> {
        let scopes = match &mut self.state {
            ServiceState::Ready(scopes) => scopes,
            ServiceState::Uninitialized => {
                return Err(StorageError::NotReady("storage service is not initialized"))
            }
            ServiceState::Closed => return Err(StorageError::NotReady("storage service is closed")),
        };
        if !can_switch_profile(&self.profile, &to) {
            return Ok(());
        }

        let old = &scopes.profile;
        let old_items = old.storage.items();
        let old_targets = read_targets(&old.storage);
        if !old.aliased {
            if let Err(e) = old.storage.flush().await {
                error!(profile = %self.profile.id, error = %e, "failed to flush profile storage");
            }
            if let Err(e) = old.database().close().await {
                warn!(profile = %self.profile.id, error = %e, "failed to close profile storage");
            }
        }

        let profile = match profile_database_name(&to) {
            Some(name) => {
                let storage = open_storage(&self.host, name).await;
                make_slot(StorageScope::Profile, storage, false, &self.events)
            }
            None => make_slot(
                StorageScope::Profile,
                Arc::clone(&scopes.application.storage),
                true,
                &self.events,
            ),
        };
        let new_items = profile.storage.items();
        let new_targets = read_targets(&profile.storage);
        scopes.profile = profile;

        debug!(from = %self.profile.id, to = %to.id, "switched profile storage");
        self.profile = to;

        let keys: BTreeSet<&String> = old_items.keys().chain(new_items.keys()).collect();
        for key in keys {
            if key == IS_NEW_KEY || key == TARGET_KEY {
                continue;
            }
            if old_items.get(key) != new_items.get(key) {
                self.events.emit(StorageEvent::ValueChanged {
                    scope: StorageScope::Profile,
                    key: key.clone(),
                    external: true,
                });
            }
        }
        if old_targets != new_targets {
            self.events.emit(StorageEvent::TargetChanged {
                scope: StorageScope::Profile,
            });
        }
        Ok(())
    }

    /// Workspace storage identity is fixed for the lifetime of the process
    pub fn switch_to_workspace(&mut self, to: WorkspaceIdentifier) -> Result<()> {
        Err(StorageError::Unsupported(format!(
            "switching workspace storage from '{}' to '{}'",
            self.workspace.id, to.id
        )))
    }

    /// Write pending changes of every scope
    pub async fn flush(&self) -> Result<()> {
        let scopes = self.scopes()?;
        first_error(join_all(scopes.owned().into_iter().map(|slot| slot.storage.flush())).await)
    }

    /// Flush only when the window has focus and no write is in flight
    pub fn should_flush_when_idle(&self) -> bool {
        let Ok(scopes) = self.scopes() else {
            return false;
        };
        self.host.has_focus()
            && scopes
                .owned()
                .iter()
                .all(|slot| !slot.database().has_pending_update())
    }

    /// Returns whether a flush was performed
    pub async fn flush_when_idle(&self) -> Result<bool> {
        if !self.should_flush_when_idle() {
            return Ok(false);
        }
        self.flush().await?;
        Ok(true)
    }

    /// Compact the database behind `scope`
    pub async fn optimize(&self, scope: StorageScope) -> Result<()> {
        self.scopes()?.slot(scope).database().optimize().await
    }

    /// Delete everything in every scope
    ///
    /// Keys are deleted through the regular write path so other instances
    /// hear about it, then the databases are wiped.
    pub async fn clear(&self) -> Result<()> {
        let slots = self.scopes()?.owned();

        let deleted = join_all(slots.iter().map(|slot| async move {
            debug!(scope = %slot.scope, database = %slot.database().name(), "clearing storage");
            for key in slot.storage.items().into_keys() {
                slot.storage.delete(&key);
            }
            slot.storage.flush().await
        }))
        .await;

        let cleared = join_all(slots.iter().map(|slot| slot.database().clear())).await;
        first_error(deleted.into_iter().chain(cleared))
    }

    /// Flush and shut down
    ///
    /// Database connections are only closed explicitly when the host is
    /// configured to; otherwise they are released as the last handle drops.
    pub async fn close(&mut self) -> Result<()> {
        let ServiceState::Ready(scopes) = std::mem::replace(&mut self.state, ServiceState::Closed)
        else {
            return Ok(());
        };

        let slots = scopes.owned();
        let mut results = join_all(slots.iter().map(|slot| slot.storage.flush())).await;
        if self.host.config().close_connections_on_shutdown {
            results.extend(join_all(slots.iter().map(|slot| slot.database().close())).await);
        }
        drop(slots);
        drop(scopes);

        debug!(workspace = %self.workspace.id, "storage closed");
        first_error(results)
    }
}

fn profile_database_name(profile: &UserDataProfile) -> Option<DatabaseName> {
    if profile.uses_default_storage() {
        None
    } else {
        Some(DatabaseName::profile(&profile.id))
    }
}

/// Open and load one scope's storage, degrading to memory on failure
async fn open_storage(host: &Arc<StorageHost>, name: DatabaseName) -> Arc<Storage> {
    let database = ScopedDatabase::open(host, name.clone()).await;
    let storage = Arc::new(Storage::new(Arc::new(database)));
    if let Err(e) = storage.init().await {
        error!(database = %name, error = %e, "failed to load storage, using in-memory storage");
        return Arc::new(Storage::new(Arc::new(ScopedDatabase::in_memory(host, name))));
    }
    storage
}

fn make_slot(
    scope: StorageScope,
    storage: Arc<Storage>,
    aliased: bool,
    events: &Arc<Listeners<StorageEvent>>,
) -> ScopeSlot {
    if !aliased {
        mark_new(&storage);
    }

    let mut tasks = vec![forward_changes(scope, &storage, Arc::clone(events))];
    if !aliased {
        tasks.push(accept_external_changes(&storage));
    }

    ScopeSlot {
        scope,
        storage,
        aliased,
        tasks,
    }
}

fn mark_new(storage: &Storage) {
    match storage.get(IS_NEW_KEY).as_deref() {
        None => storage.set(IS_NEW_KEY, "true"),
        Some("true") => storage.set(IS_NEW_KEY, "false"),
        Some(_) => {}
    }
}

/// Re-emit cache changes tagged with the slot's scope
fn forward_changes(
    scope: StorageScope,
    storage: &Storage,
    events: Arc<Listeners<StorageEvent>>,
) -> JoinHandle<()> {
    let mut changes = storage.subscribe();
    tokio::spawn(async move {
        while let Some(change) = changes.recv().await {
            let event = if change.key == IS_NEW_KEY {
                continue;
            } else if change.key == TARGET_KEY {
                StorageEvent::TargetChanged { scope }
            } else {
                StorageEvent::ValueChanged {
                    scope,
                    key: change.key,
                    external: change.external,
                }
            };
            events.emit(event);
        }
    })
}

/// Feed other instances' committed changes into the cache
fn accept_external_changes(storage: &Arc<Storage>) -> JoinHandle<()> {
    let mut incoming = storage.database().subscribe();
    let storage = Arc::clone(storage);
    tokio::spawn(async move {
        while let Some(message) = incoming.recv().await {
            match message {
                ChannelMessage::Changed(event) => storage.accept_external(event),
                ChannelMessage::Missed(_) => {
                    if let Err(e) = storage.reload().await {
                        error!(database = %storage.database().name(), error = %e, "failed to reload storage");
                    }
                }
            }
        }
    })
}

fn read_targets(storage: &Storage) -> HashMap<String, StorageTarget> {
    let Some(raw) = storage.get(TARGET_KEY) else {
        return HashMap::new();
    };
    serde_json::from_str(&raw).unwrap_or_else(|e| {
        warn!(database = %storage.database().name(), error = %e, "ignoring unreadable target map");
        HashMap::new()
    })
}

fn first_error(results: impl IntoIterator<Item = Result<()>>) -> Result<()> {
    let mut first = None;
    for result in results {
        if let Err(e) = result {
            error!(error = %e, "storage operation failed");
            first.get_or_insert(e);
        }
    }
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
