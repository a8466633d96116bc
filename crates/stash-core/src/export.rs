//! Portable snapshots of a workspace
//!
//! A snapshot carries the full local dataset for one workspace: every
//! entity row (soft-deleted and dirty ones included), the undelivered
//! queue operations, and the sync cursor. Import replaces the
//! workspace's local data in one transaction, so a failed import
//! leaves the previous state intact.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::db::{Database, EntityStore, NewOperation, OperationQueue, SqliteEntityStore, SqliteOperationQueue};
use crate::error::{Error, Result};
use crate::models::{now_ms, Entity, EntityId, EntityKind, OpKind, WorkspaceId};

/// Format version written by this build
pub const SNAPSHOT_VERSION: u32 = 1;

/// A queued mutation in portable form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotOperation {
    pub entity_kind: EntityKind,
    pub entity_id: EntityId,
    pub op: OpKind,
    pub payload: Option<serde_json::Value>,
}

/// The full local dataset of one workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub workspace: WorkspaceId,
    /// When the snapshot was taken (Unix ms)
    pub exported_at: i64,
    pub entities: Vec<Entity>,
    pub operations: Vec<SnapshotOperation>,
    /// Server time of the last applied pull
    pub last_pull_at: i64,
}

/// Capture a workspace's local state
pub fn export_snapshot(db: &Database, workspace: &WorkspaceId) -> Result<Snapshot> {
    let store = SqliteEntityStore::new(db.connection());
    let queue = SqliteOperationQueue::new(db.connection());

    let entities = store.list_all(workspace)?;
    let operations = queue
        .all_operations(workspace)?
        .into_iter()
        .map(|op| SnapshotOperation {
            entity_kind: op.entity_kind,
            entity_id: op.entity_id,
            op: op.op,
            payload: op.payload,
        })
        .collect::<Vec<_>>();

    tracing::info!(
        workspace = %workspace,
        entities = entities.len(),
        operations = operations.len(),
        "exported snapshot"
    );
    Ok(Snapshot {
        version: SNAPSHOT_VERSION,
        workspace: workspace.clone(),
        exported_at: now_ms(),
        entities,
        operations,
        last_pull_at: store.metadata(workspace)?.last_pull_at,
    })
}

/// What an import put in place
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportStats {
    pub entities: usize,
    pub operations: usize,
}

/// Replace a workspace's local data with a snapshot. The target
/// workspace is the snapshot's own; existing rows for it are dropped
/// first. Runs in one transaction.
pub fn import_snapshot(db: &mut Database, snapshot: &Snapshot) -> Result<ImportStats> {
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(Error::UnsupportedSnapshot(snapshot.version));
    }
    for entity in &snapshot.entities {
        if entity.workspace != snapshot.workspace {
            return Err(Error::InvalidInput(format!(
                "snapshot entity {} belongs to workspace {}",
                entity.id, entity.workspace
            )));
        }
    }

    let tx = db.connection_mut().transaction()?;
    {
        let store = SqliteEntityStore::new(&tx);
        let queue = SqliteOperationQueue::new(&tx);

        store.clear_workspace(&snapshot.workspace)?;
        queue.clear_workspace(&snapshot.workspace)?;

        for entity in &snapshot.entities {
            store.restore(entity)?;
        }
        for op in &snapshot.operations {
            queue.enqueue(&NewOperation {
                workspace: snapshot.workspace.clone(),
                entity_kind: op.entity_kind,
                entity_id: op.entity_id.clone(),
                op: op.op,
                payload: op.payload.clone(),
            })?;
        }
        store.advance_pull_timestamp(&snapshot.workspace, snapshot.last_pull_at)?;
    }
    tx.commit()?;

    tracing::info!(
        workspace = %snapshot.workspace,
        entities = snapshot.entities.len(),
        operations = snapshot.operations.len(),
        "imported snapshot"
    );
    Ok(ImportStats {
        entities: snapshot.entities.len(),
        operations: snapshot.operations.len(),
    })
}

/// Write a snapshot as pretty JSON
pub fn write_snapshot_file(snapshot: &Snapshot, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(snapshot)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Read a snapshot from a JSON file
pub fn read_snapshot_file(path: &Path) -> Result<Snapshot> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
