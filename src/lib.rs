//! scopekv - layered, multi-scope persistent key-value storage
//!
//! This is the root workspace crate that provides cross-crate integration
//! tests. The implementation lives in the workspace member crates.

// Re-export member crates for convenience
pub use scopekv_service as service;
pub use scopekv_storage as storage;

pub use scopekv_service::{
    Storage, StorageEvent, StorageScope, StorageService, StorageTarget, UserDataProfile,
    WorkspaceIdentifier,
};
pub use scopekv_storage::{DatabaseName, HostConfig, Result, StorageError, StorageHost};
