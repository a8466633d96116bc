//! stash-core - Core library for Stash
//!
//! A local-first sync engine for personal bookmark/note data: the
//! on-device store is authoritative, mutations commit locally first,
//! and a durable operation queue reconciles with the remote service
//! in the background. Shared by all Stash interfaces.

pub mod coordinator;
pub mod db;
pub mod error;
pub mod export;
pub mod models;
pub mod monitor;
pub mod service;
pub mod sync;

pub use error::{Error, Result};
pub use models::{Entity, EntityId, EntityKind, WorkspaceId};
pub use service::{SyncService, SyncStatus};
