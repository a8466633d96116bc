//! Per-workspace sync metadata

use serde::{Deserialize, Serialize};

use super::entity::WorkspaceId;

/// Durable sync bookkeeping for one workspace.
///
/// `last_pull_at` only moves forward and always carries the
/// server-reported time of the last change batch, never the client
/// clock. It resets only when the workspace's local data is cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub workspace: WorkspaceId,
    /// Server time of the last applied change batch (Unix ms)
    pub last_pull_at: i64,
    /// When a drain was last attempted (Unix ms, client clock)
    pub last_drain_attempt: i64,
}

impl SyncMetadata {
    #[must_use]
    pub const fn new(workspace: WorkspaceId) -> Self {
        Self {
            workspace,
            last_pull_at: 0,
            last_drain_attempt: 0,
        }
    }
}

/// Engine phase for one workspace.
///
/// `Offline` is absorbing: entered on connectivity loss and exited
/// only by an explicit reconnect. Local state is preserved across it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    #[default]
    Idle,
    Pulling,
    Draining,
    Offline,
}

/// Per-entity sync state as shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntitySyncState {
    /// No unsynced local change
    Synced,
    /// A pending operation exists for this entity
    Queued,
    /// The entity's operation is currently being transmitted
    Syncing,
    /// The entity's operation is parked and needs manual retry
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_starts_at_zero() {
        let meta = SyncMetadata::new(WorkspaceId::from("ws-1"));
        assert_eq!(meta.last_pull_at, 0);
        assert_eq!(meta.last_drain_attempt, 0);
    }
}
