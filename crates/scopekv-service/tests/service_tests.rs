//! Integration tests for the storage service lifecycle

use scopekv_service::{
    StorageEvent, StorageScope, StorageService, StorageTarget, UserDataProfile,
    WorkspaceIdentifier,
};
use scopekv_storage::{
    DatabaseName, DurableStore, HostConfig, ItemStore, StorageError, StorageHost, UpdateRequest,
};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::sync::mpsc;

fn host(dir: &TempDir) -> Arc<StorageHost> {
    StorageHost::new(HostConfig::with_root(dir.path()))
}

async fn service(host: &Arc<StorageHost>, profile: UserDataProfile) -> StorageService {
    let mut service = StorageService::new(Arc::clone(host), profile, WorkspaceIdentifier::new("ws-1"));
    service.initialize().await.expect("initialize");
    service
}

/// Collect every event that arrives within a short quiet period
async fn drain(events: &mut mpsc::UnboundedReceiver<StorageEvent>) -> Vec<StorageEvent> {
    let mut seen = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), events.recv()).await {
        seen.push(event);
    }
    seen
}

/// Poll until `check` holds or give up after a second
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

fn value_changed(scope: StorageScope, key: &str, external: bool) -> StorageEvent {
    StorageEvent::ValueChanged {
        scope,
        key: key.to_string(),
        external,
    }
}

#[tokio::test]
async fn test_is_new_marker_across_restarts() {
    let dir = tempdir().unwrap();
    let host = host(&dir);

    let mut first = service(&host, UserDataProfile::new("work")).await;
    for scope in StorageScope::ALL {
        assert!(first.is_new(scope).unwrap(), "{} should be new", scope);
    }
    first.close().await.unwrap();

    let second = service(&host, UserDataProfile::new("work")).await;
    for scope in StorageScope::ALL {
        assert!(!second.is_new(scope).unwrap(), "{} should not be new", scope);
    }
}

#[tokio::test]
async fn test_default_profile_aliases_application() {
    let dir = tempdir().unwrap();
    let host = host(&dir);
    let service = service(&host, UserDataProfile::default_profile()).await;

    assert!(service.is_profile_aliased());
    assert!(Arc::ptr_eq(
        &service.database(StorageScope::Profile).unwrap(),
        &service.database(StorageScope::Application).unwrap()
    ));
    // No second physical database for the profile
    assert_eq!(host.open_connections(&DatabaseName::application()), 1);
    assert_eq!(
        host.open_connections(&DatabaseName::profile(UserDataProfile::DEFAULT_ID)),
        0
    );

    let mut events = service.subscribe();
    service
        .store("k", "v", StorageScope::Profile, StorageTarget::User)
        .unwrap();
    service.flush().await.unwrap();

    let items = service
        .database(StorageScope::Application)
        .unwrap()
        .get_items()
        .await
        .unwrap();
    assert_eq!(items.get("k").map(String::as_str), Some("v"));
    assert_eq!(
        service.get("k", StorageScope::Application).unwrap().as_deref(),
        Some("v")
    );

    let seen = drain(&mut events).await;
    assert!(seen.contains(&value_changed(StorageScope::Profile, "k", false)));
    assert!(seen.contains(&value_changed(StorageScope::Application, "k", false)));
}

#[tokio::test]
async fn test_one_connection_per_scope() {
    let dir = tempdir().unwrap();
    let host = host(&dir);
    let service = service(&host, UserDataProfile::new("work")).await;

    assert!(!service.is_profile_aliased());
    assert_eq!(host.open_connections(&DatabaseName::application()), 1);
    assert_eq!(host.open_connections(&DatabaseName::profile("work")), 1);
    assert_eq!(host.open_connections(&DatabaseName::workspace("ws-1")), 1);
    for scope in StorageScope::ALL {
        assert!(service.database(scope).unwrap().is_durable());
    }
}

#[tokio::test]
async fn test_switch_to_same_profile_is_noop() {
    let dir = tempdir().unwrap();
    let host = host(&dir);
    let mut service = service(&host, UserDataProfile::new("work")).await;
    let before = service.database(StorageScope::Profile).unwrap();
    let mut events = service.subscribe();

    service
        .switch_to_profile(UserDataProfile::new("work"))
        .await
        .unwrap();

    assert!(Arc::ptr_eq(&before, &service.database(StorageScope::Profile).unwrap()));
    assert_eq!(host.open_connections(&DatabaseName::profile("work")), 1);
    assert!(drain(&mut events).await.is_empty());
}

#[tokio::test]
async fn test_switch_between_default_storage_profiles_is_noop() {
    let dir = tempdir().unwrap();
    let host = host(&dir);
    let mut service = service(&host, UserDataProfile::default_profile()).await;
    let mut events = service.subscribe();

    let shared = UserDataProfile {
        use_default_storage: true,
        ..UserDataProfile::new("shared")
    };
    service.switch_to_profile(shared).await.unwrap();

    assert_eq!(service.profile().id, UserDataProfile::DEFAULT_ID);
    assert!(service.is_profile_aliased());
    assert!(drain(&mut events).await.is_empty());
}

#[tokio::test]
async fn test_switch_profile_emits_diff() {
    let dir = tempdir().unwrap();
    let host = host(&dir);
    let mut service = service(&host, UserDataProfile::default_profile()).await;

    service
        .store("a", "1", StorageScope::Application, StorageTarget::User)
        .unwrap();
    service
        .store("b", "2", StorageScope::Application, StorageTarget::Machine)
        .unwrap();
    service.flush().await.unwrap();
    // Let the events of the writes above go by
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut events = service.subscribe();

    service
        .switch_to_profile(UserDataProfile::new("work"))
        .await
        .unwrap();

    assert!(!service.is_profile_aliased());
    assert_eq!(host.open_connections(&DatabaseName::profile("work")), 1);
    assert!(service.get("a", StorageScope::Profile).unwrap().is_none());
    assert_eq!(
        service.get("a", StorageScope::Application).unwrap().as_deref(),
        Some("1")
    );

    let seen = drain(&mut events).await;
    let changed: Vec<&StorageEvent> = seen
        .iter()
        .filter(|e| matches!(e, StorageEvent::ValueChanged { .. }))
        .collect();
    assert_eq!(
        changed,
        vec![
            &value_changed(StorageScope::Profile, "a", true),
            &value_changed(StorageScope::Profile, "b", true),
        ]
    );
    assert!(seen.contains(&StorageEvent::TargetChanged {
        scope: StorageScope::Profile
    }));

    // And back again: the profile database is released
    service
        .switch_to_profile(UserDataProfile::default_profile())
        .await
        .unwrap();
    assert!(service.is_profile_aliased());
    assert_eq!(host.open_connections(&DatabaseName::profile("work")), 0);
    assert_eq!(
        service.get("b", StorageScope::Profile).unwrap().as_deref(),
        Some("2")
    );
}

#[tokio::test]
async fn test_switch_workspace_is_unsupported() {
    let dir = tempdir().unwrap();
    let host = host(&dir);
    let mut service = service(&host, UserDataProfile::new("work")).await;

    let err = service
        .switch_to_workspace(WorkspaceIdentifier::new("ws-2"))
        .unwrap_err();
    assert!(matches!(err, StorageError::Unsupported(_)));
    assert_eq!(service.workspace().id, "ws-1");
}

#[tokio::test]
async fn test_clear_empties_every_scope() {
    let dir = tempdir().unwrap();
    let host = host(&dir);
    let service = service(&host, UserDataProfile::new("work")).await;

    for scope in StorageScope::ALL {
        service
            .store("key", scope.as_str(), scope, StorageTarget::User)
            .unwrap();
    }
    service.flush().await.unwrap();

    service.clear().await.unwrap();

    for scope in StorageScope::ALL {
        let database = service.database(scope).unwrap();
        assert!(database.get_items().await.unwrap().is_empty(), "{} not empty", scope);
        assert!(!database.has_pending_update());
        assert!(service.get("key", scope).unwrap().is_none());
    }
}

#[tokio::test]
async fn test_clear_with_aliased_profile() {
    let dir = tempdir().unwrap();
    let host = host(&dir);
    let service = service(&host, UserDataProfile::default_profile()).await;

    service
        .store("k", "v", StorageScope::Profile, StorageTarget::Machine)
        .unwrap();
    service.clear().await.unwrap();

    for scope in StorageScope::ALL {
        let database = service.database(scope).unwrap();
        assert!(database.get_items().await.unwrap().is_empty());
        assert!(!database.has_pending_update());
    }
}

#[tokio::test]
async fn test_keys_by_target() {
    let dir = tempdir().unwrap();
    let host = host(&dir);
    let service = service(&host, UserDataProfile::new("work")).await;

    service
        .store("u", "1", StorageScope::Workspace, StorageTarget::User)
        .unwrap();
    service
        .store("m", "2", StorageScope::Workspace, StorageTarget::Machine)
        .unwrap();

    assert_eq!(
        service.keys(StorageScope::Workspace, StorageTarget::User).unwrap(),
        vec!["u".to_string()]
    );
    assert_eq!(
        service.keys(StorageScope::Workspace, StorageTarget::Machine).unwrap(),
        vec!["m".to_string()]
    );

    // Changing a key's target moves it
    service
        .store("u", "1", StorageScope::Workspace, StorageTarget::Machine)
        .unwrap();
    assert!(service
        .keys(StorageScope::Workspace, StorageTarget::User)
        .unwrap()
        .is_empty());

    service.remove("m", StorageScope::Workspace).unwrap();
    assert_eq!(
        service.keys(StorageScope::Workspace, StorageTarget::Machine).unwrap(),
        vec!["u".to_string()]
    );
}

#[tokio::test]
async fn test_flush_when_idle_requires_focus() {
    let dir = tempdir().unwrap();
    let host = host(&dir);
    let service = service(&host, UserDataProfile::new("work")).await;

    service
        .store("k", "v", StorageScope::Workspace, StorageTarget::User)
        .unwrap();
    assert!(service.should_flush_when_idle());

    host.set_focused(false);
    assert!(!service.should_flush_when_idle());
    assert!(!service.flush_when_idle().await.unwrap());
    let storage = service.storage(StorageScope::Workspace).unwrap();
    assert!(storage.has_pending_changes());

    host.set_focused(true);
    assert!(service.flush_when_idle().await.unwrap());
    assert!(!storage.has_pending_changes());
}

#[tokio::test]
async fn test_fallback_when_host_denies_storage() {
    let dir = tempdir().unwrap();
    let host = StorageHost::new(HostConfig {
        persistent: false,
        ..HostConfig::with_root(dir.path())
    });

    let mut service = service(&host, UserDataProfile::new("work")).await;
    for scope in StorageScope::ALL {
        assert!(!service.database(scope).unwrap().is_durable());
    }

    // Same read-your-writes behavior as the durable backend
    service
        .store("k", "v", StorageScope::Profile, StorageTarget::User)
        .unwrap();
    service.flush().await.unwrap();
    assert_eq!(
        service.get("k", StorageScope::Profile).unwrap().as_deref(),
        Some("v")
    );
    service.close().await.unwrap();

    // Nothing survives a restart
    let service = self::service(&host, UserDataProfile::new("work")).await;
    assert!(service.get("k", StorageScope::Profile).unwrap().is_none());
    assert!(service.is_new(StorageScope::Profile).unwrap());
}

#[tokio::test]
async fn test_one_scope_failing_does_not_stop_the_others() {
    let dir = tempdir().unwrap();
    // A directory where the workspace database file should be
    std::fs::create_dir_all(dir.path().join(DatabaseName::workspace("ws-1").file_name())).unwrap();
    let host = host(&dir);

    let service = service(&host, UserDataProfile::new("work")).await;
    assert!(service.database(StorageScope::Application).unwrap().is_durable());
    assert!(service.database(StorageScope::Profile).unwrap().is_durable());
    assert!(!service.database(StorageScope::Workspace).unwrap().is_durable());

    service
        .store("k", "v", StorageScope::Workspace, StorageTarget::User)
        .unwrap();
    service.flush().await.unwrap();
    assert_eq!(
        service.get("k", StorageScope::Workspace).unwrap().as_deref(),
        Some("v")
    );
}

#[tokio::test]
async fn test_not_ready_before_initialize_and_after_close() {
    let dir = tempdir().unwrap();
    let host = host(&dir);
    let mut service = StorageService::new(
        Arc::clone(&host),
        UserDataProfile::new("work"),
        WorkspaceIdentifier::new("ws-1"),
    );

    assert!(matches!(
        service.get("k", StorageScope::Application),
        Err(StorageError::NotReady(_))
    ));
    assert!(!service.should_flush_when_idle());

    service.initialize().await.unwrap();
    service.close().await.unwrap();

    assert!(matches!(service.flush().await, Err(StorageError::NotReady(_))));
    assert!(matches!(
        service.initialize().await,
        Err(StorageError::NotReady(_))
    ));
}

#[tokio::test]
async fn test_close_releases_connections_when_configured() {
    let dir = tempdir().unwrap();
    let host = StorageHost::new(HostConfig {
        close_connections_on_shutdown: true,
        ..HostConfig::with_root(dir.path())
    });

    let mut service = service(&host, UserDataProfile::new("work")).await;
    service
        .store("k", "v", StorageScope::Application, StorageTarget::User)
        .unwrap();
    service.close().await.unwrap();

    assert_eq!(host.open_connections(&DatabaseName::application()), 0);
    assert_eq!(host.open_connections(&DatabaseName::profile("work")), 0);
    assert_eq!(host.open_connections(&DatabaseName::workspace("ws-1")), 0);

    let service = self::service(&host, UserDataProfile::new("work")).await;
    assert_eq!(
        service.get("k", StorageScope::Application).unwrap().as_deref(),
        Some("v")
    );
}

#[tokio::test]
async fn test_burst_of_stores_emits_every_change() {
    let dir = tempdir().unwrap();
    let host = host(&dir);
    let service = service(&host, UserDataProfile::new("work")).await;
    let mut events = service.subscribe();

    for i in 0..300 {
        service
            .store(&format!("key-{}", i), "v", StorageScope::Workspace, StorageTarget::User)
            .unwrap();
    }

    let keys: HashSet<String> = drain(&mut events)
        .await
        .into_iter()
        .filter_map(|event| match event {
            StorageEvent::ValueChanged {
                scope: StorageScope::Workspace,
                key,
                external: false,
            } => Some(key),
            _ => None,
        })
        .collect();
    assert_eq!(keys.len(), 300);
    assert!(keys.contains("key-0") && keys.contains("key-299"));
}

#[tokio::test]
async fn test_missed_broadcasts_reload_from_database() {
    let dir = tempdir().unwrap();
    let host = StorageHost::new(HostConfig {
        broadcast_capacity: 1,
        ..HostConfig::with_root(dir.path())
    });
    let service = service(&host, UserDataProfile::new("work")).await;
    service.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut events = service.subscribe();

    // Commit a write this instance never hears about
    let name = DatabaseName::workspace("ws-1");
    let writer = DurableStore::connect(&host, &name).await.unwrap();
    writer
        .update_items(&UpdateRequest::new().insert("k", "v"))
        .await
        .unwrap();

    // Overrun the channel so the listener falls behind
    let member = host.channels().join(&name);
    for _ in 0..3 {
        member.post_json(json!({ "deleted": ["absent"] }));
    }

    assert!(
        eventually(|| service.get("k", StorageScope::Workspace).unwrap().as_deref() == Some("v"))
            .await
    );
    assert!(drain(&mut events)
        .await
        .contains(&value_changed(StorageScope::Workspace, "k", true)));
    // Reloading only touched the cache
    assert!(!service.storage(StorageScope::Workspace).unwrap().has_pending_changes());
}
