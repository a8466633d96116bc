//! Data models shared across the sync core

mod entity;
mod metadata;
mod operation;

pub use entity::{now_ms, Entity, EntityId, EntityKind, WorkspaceId, WriteOrigin};
pub use metadata::{EntitySyncState, SyncMetadata, SyncPhase};
pub use operation::{OpKind, OpStatus, QueueOperation};
