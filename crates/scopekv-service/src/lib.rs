//! scopekv service - application, profile and workspace storage
//!
//! This crate provides:
//! - The cache layer (`Storage`) kept in front of every scoped database
//! - Scope, target and identity types
//! - `StorageService`, which owns one storage per scope and drives
//!   initialization, profile switching, clearing and shutdown

mod cache;
mod listeners;
mod service;
mod types;

pub use cache::{Storage, StorageChange};
pub use service::StorageService;
pub use types::*;
