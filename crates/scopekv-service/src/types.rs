//! Scope, target and identity types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Marker written once per scope on first initialization
pub const IS_NEW_KEY: &str = "__$__isNewStorageMarker";

/// JSON map from key to [`StorageTarget`], stored alongside the values
pub const TARGET_KEY: &str = "__$__targetStorageMarker";

/// Lifetime of a stored value
///
/// Application outlives profile, which outlives workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageScope {
    Application,
    Profile,
    Workspace,
}

impl StorageScope {
    pub const ALL: [StorageScope; 3] = [
        StorageScope::Application,
        StorageScope::Profile,
        StorageScope::Workspace,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageScope::Application => "application",
            StorageScope::Profile => "profile",
            StorageScope::Workspace => "workspace",
        }
    }
}

impl fmt::Display for StorageScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "application" | "app" => Ok(StorageScope::Application),
            "profile" => Ok(StorageScope::Profile),
            "workspace" => Ok(StorageScope::Workspace),
            other => Err(format!("unknown scope '{}'", other)),
        }
    }
}

/// Whether a value roams with the user or stays on this machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTarget {
    User,
    Machine,
}

impl fmt::Display for StorageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageTarget::User => f.write_str("user"),
            StorageTarget::Machine => f.write_str("machine"),
        }
    }
}

impl FromStr for StorageTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(StorageTarget::User),
            "machine" => Ok(StorageTarget::Machine),
            other => Err(format!("unknown target '{}'", other)),
        }
    }
}

/// A user profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDataProfile {
    pub id: String,

    /// The default (unconfigured) profile
    #[serde(default)]
    pub is_default: bool,

    /// A non-default profile that keeps its state in application storage
    #[serde(default)]
    pub use_default_storage: bool,
}

impl UserDataProfile {
    pub const DEFAULT_ID: &'static str = "__default__profile__";

    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_default: false,
            use_default_storage: false,
        }
    }

    pub fn default_profile() -> Self {
        Self {
            id: Self::DEFAULT_ID.to_string(),
            is_default: true,
            use_default_storage: false,
        }
    }

    /// Profile state lives in the application database
    pub fn uses_default_storage(&self) -> bool {
        self.is_default || self.use_default_storage
    }
}

/// Switching only happens between profiles with different storage
pub fn can_switch_profile(from: &UserDataProfile, to: &UserDataProfile) -> bool {
    if from.id == to.id {
        return false;
    }
    !(from.uses_default_storage() && to.uses_default_storage())
}

/// A workspace (window/session) identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkspaceIdentifier {
    pub id: String,
}

impl WorkspaceIdentifier {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Change notifications emitted by the storage service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageEvent {
    /// A value changed in `scope`; `external` when the change came from
    /// another instance or from a profile switch
    ValueChanged {
        scope: StorageScope,
        key: String,
        external: bool,
    },

    /// The key-to-target map of `scope` changed
    TargetChanged { scope: StorageScope },
}
