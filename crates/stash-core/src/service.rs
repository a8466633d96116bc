//! Application-facing sync service
//!
//! One object owning the store, queue, engine, coordinator, and
//! monitor, injected into consumers instead of living in a global.
//! Mutations follow a two-phase contract: the local commit (store
//! write plus queue append, one transaction) is synchronous and
//! always succeeds offline; reconciliation with the remote happens
//! asynchronously and reports through status queries and events.

use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::coordinator::{BroadcastBus, TabCoordinator, TabId};
use crate::db::{
    EntityStore, NewOperation, OperationQueue, PutOutcome, SqliteEntityStore, SqliteOperationQueue,
};
use crate::error::{Error, Result};
use crate::export::{self, ImportStats, Snapshot};
use crate::models::{
    Entity, EntityId, EntityKind, EntitySyncState, OpKind, OpStatus, QueueOperation, SyncPhase,
    WorkspaceId, WriteOrigin,
};
use crate::monitor::{MonitorEvent, SyncMonitor};
use crate::sync::{
    BackoffPolicy, FullSyncOutcome, RemoteApi, RemoteEntity, SharedDatabase, SyncEngine, SyncEvent,
};

/// Point-in-time sync state for one workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub workspace: WorkspaceId,
    pub phase: SyncPhase,
    pub is_leader: bool,
    pub sync_enabled: bool,
    pub auth_required: bool,
    pub pending_operations: usize,
    pub parked_operations: usize,
    /// Entities with an unsynced local change
    pub dirty_entities: usize,
    /// Server time of the last applied pull (Unix ms, 0 = never)
    pub last_pull_at: i64,
    /// Client time of the last drain attempt (Unix ms, 0 = never)
    pub last_drain_attempt: i64,
}

/// The sync core as one injectable service
pub struct SyncService {
    db: SharedDatabase,
    engine: Arc<SyncEngine>,
    coordinator: Arc<TabCoordinator>,
    monitor: Arc<SyncMonitor>,
}

impl SyncService {
    pub fn new(
        db: SharedDatabase,
        remote: Arc<dyn RemoteApi>,
        bus: Arc<dyn BroadcastBus>,
        workspace: WorkspaceId,
    ) -> Self {
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&db),
            remote,
            BackoffPolicy::default(),
        ));
        let coordinator = Arc::new(TabCoordinator::new(TabId::generate(), bus));
        let monitor = Arc::new(SyncMonitor::new(
            Arc::clone(&engine),
            Arc::clone(&coordinator),
            workspace,
        ));
        Self {
            db,
            engine,
            coordinator,
            monitor,
        }
    }

    /// Spawn the coordinator and monitor loops. The handles stop when
    /// aborted or when the service is dropped and its channels close.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(&self.coordinator).run()),
            tokio::spawn(Arc::clone(&self.monitor).run()),
        ]
    }

    /// Enter the leader election for the current workspace
    pub fn claim_leadership(&self) -> Result<bool> {
        self.coordinator.claim(&self.workspace())
    }

    #[must_use]
    pub fn workspace(&self) -> WorkspaceId {
        self.monitor.workspace()
    }

    /// Push a lifecycle signal (connectivity, visibility, auth) into
    /// the monitor loop
    pub fn notify(&self, event: MonitorEvent) {
        let _ = self.monitor.events().send(event);
    }

    /// Subscribe to engine phase changes
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.engine.subscribe()
    }

    // Phase one of every mutation: local commit. Store write and
    // queue append land in the same transaction, so a crash between
    // them cannot strand an unsynced edit.

    /// Create an entity locally and queue its delivery
    pub fn create(&self, kind: EntityKind, payload: serde_json::Value) -> Result<Entity> {
        let workspace = self.workspace();
        let entity = Entity::new(workspace.clone(), kind, payload);

        let mut db = self.db.lock().unwrap();
        let tx = db.connection_mut().transaction()?;
        let stored = {
            let store = SqliteEntityStore::new(&tx);
            let queue = SqliteOperationQueue::new(&tx);
            let PutOutcome::Applied(stored) = store.put(&entity, WriteOrigin::Local)? else {
                unreachable!("local writes always apply");
            };
            queue.enqueue(&NewOperation {
                workspace,
                entity_kind: kind,
                entity_id: stored.id.clone(),
                op: OpKind::Create,
                payload: Some(serde_json::to_value(RemoteEntity::from_entity(&stored))?),
            })?;
            stored
        };
        tx.commit()?;
        Ok(stored)
    }

    /// Replace an entity's payload locally and queue the update
    pub fn update(
        &self,
        kind: EntityKind,
        id: &EntityId,
        payload: serde_json::Value,
    ) -> Result<Entity> {
        let workspace = self.workspace();

        let mut db = self.db.lock().unwrap();
        let tx = db.connection_mut().transaction()?;
        let stored = {
            let store = SqliteEntityStore::new(&tx);
            let queue = SqliteOperationQueue::new(&tx);

            let existing = store
                .get(&workspace, kind, id)?
                .filter(|entity| !entity.deleted)
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            let edited = Entity {
                payload,
                ..existing
            };
            let PutOutcome::Applied(stored) = store.put(&edited, WriteOrigin::Local)? else {
                unreachable!("local writes always apply");
            };
            // An unacknowledged create absorbs this via the merge
            // laws; otherwise it appends or merges an update
            queue.enqueue(&NewOperation {
                workspace,
                entity_kind: kind,
                entity_id: stored.id.clone(),
                op: OpKind::Update,
                payload: Some(serde_json::to_value(RemoteEntity::from_entity(&stored))?),
            })?;
            stored
        };
        tx.commit()?;
        Ok(stored)
    }

    /// Soft-delete an entity locally and queue the delete
    pub fn delete(&self, kind: EntityKind, id: &EntityId) -> Result<()> {
        let workspace = self.workspace();

        let mut db = self.db.lock().unwrap();
        let tx = db.connection_mut().transaction()?;
        {
            let store = SqliteEntityStore::new(&tx);
            let queue = SqliteOperationQueue::new(&tx);
            store.mark_deleted(&workspace, kind, id)?;
            queue.enqueue(&NewOperation {
                workspace,
                entity_kind: kind,
                entity_id: id.clone(),
                op: OpKind::Delete,
                payload: None,
            })?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get(&self, kind: EntityKind, id: &EntityId) -> Result<Option<Entity>> {
        let db = self.db.lock().unwrap();
        SqliteEntityStore::new(db.connection()).get(&self.workspace(), kind, id)
    }

    /// Live entities, newest first
    pub fn list(&self, kind: Option<EntityKind>) -> Result<Vec<Entity>> {
        let db = self.db.lock().unwrap();
        SqliteEntityStore::new(db.connection()).list(&self.workspace(), kind)
    }

    /// Per-entity sync state for status indicators
    pub fn entity_state(&self, kind: EntityKind, id: &EntityId) -> Result<EntitySyncState> {
        let workspace = self.workspace();
        let db = self.db.lock().unwrap();
        let queue = SqliteOperationQueue::new(db.connection());

        let ops = queue.operations_for_entity(&workspace, kind, id)?;
        if ops.iter().any(|op| op.status == OpStatus::Parked) {
            return Ok(EntitySyncState::Failed);
        }
        if ops.iter().any(|op| op.status == OpStatus::Active) {
            return Ok(EntitySyncState::Syncing);
        }
        if !ops.is_empty() {
            return Ok(EntitySyncState::Queued);
        }

        let store = SqliteEntityStore::new(db.connection());
        let dirty = store
            .get(&workspace, kind, id)?
            .is_some_and(|entity| entity.is_dirty());
        Ok(if dirty {
            EntitySyncState::Queued
        } else {
            EntitySyncState::Synced
        })
    }

    /// Current sync state of the workspace
    pub fn status(&self) -> Result<SyncStatus> {
        let workspace = self.workspace();
        let db = self.db.lock().unwrap();
        let store = SqliteEntityStore::new(db.connection());
        let queue = SqliteOperationQueue::new(db.connection());
        let metadata = store.metadata(&workspace)?;

        Ok(SyncStatus {
            phase: self.engine.phase(&workspace),
            is_leader: self.coordinator.is_leader(&workspace),
            sync_enabled: self.monitor.sync_enabled(),
            auth_required: self.engine.is_auth_required(),
            pending_operations: queue.pending_count(&workspace)?,
            parked_operations: queue.parked(&workspace)?.len(),
            dirty_entities: store.list_dirty(&workspace)?.len(),
            last_pull_at: metadata.last_pull_at,
            last_drain_attempt: metadata.last_drain_attempt,
            workspace,
        })
    }

    /// Run a pull and drain right now, bypassing the monitor's gate.
    /// Intended for one-shot callers that hold leadership.
    pub async fn sync_now(&self) -> Result<FullSyncOutcome> {
        self.engine.full_sync(&self.workspace()).await
    }

    /// Parked operations awaiting manual intervention
    pub fn parked_operations(&self) -> Result<Vec<QueueOperation>> {
        let db = self.db.lock().unwrap();
        SqliteOperationQueue::new(db.connection()).parked(&self.workspace())
    }

    /// Return all parked operations to pending. The next drain picks
    /// them up with a reset retry budget.
    pub fn retry_parked(&self) -> Result<usize> {
        let db = self.db.lock().unwrap();
        SqliteOperationQueue::new(db.connection()).retry_parked(&self.workspace())
    }

    /// Queue a create for every live entity (recovery after remote
    /// data loss)
    pub fn force_push(&self) -> Result<usize> {
        self.engine.force_push(&self.workspace())
    }

    pub fn set_sync_enabled(&self, enabled: bool) {
        self.monitor.set_sync_enabled(enabled);
    }

    pub fn set_auto_sync_on_reconnect(&self, enabled: bool) {
        self.monitor.set_auto_sync_on_reconnect(enabled);
    }

    /// Report fresh credentials; lifts a 401 pause
    pub fn set_auth_ready(&self) {
        self.engine.set_auth_ready();
    }

    /// Switch the service to a different workspace. Any in-flight
    /// drain for the old one is cancelled after its current operation.
    pub fn switch_workspace(&self, workspace: WorkspaceId) -> Result<bool> {
        self.monitor.set_workspace(workspace.clone());
        self.coordinator.claim(&workspace)
    }

    /// Export the workspace's full local dataset
    pub fn export_to(&self, path: &Path) -> Result<Snapshot> {
        let db = self.db.lock().unwrap();
        let snapshot = export::export_snapshot(&db, &self.workspace())?;
        export::write_snapshot_file(&snapshot, path)?;
        Ok(snapshot)
    }

    /// Import a snapshot file, replacing the snapshot workspace's data
    pub fn import_from(&self, path: &Path) -> Result<ImportStats> {
        let snapshot = export::read_snapshot_file(path)?;
        let mut db = self.db.lock().unwrap();
        export::import_snapshot(&mut db, &snapshot)
    }

    /// Drop all local data for the current workspace: entities, queued
    /// operations, and the pull cursor
    pub fn clear_local_data(&self) -> Result<()> {
        let workspace = self.workspace();
        let mut db = self.db.lock().unwrap();
        let tx = db.connection_mut().transaction()?;
        {
            SqliteEntityStore::new(&tx).clear_workspace(&workspace)?;
            SqliteOperationQueue::new(&tx).clear_workspace(&workspace)?;
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::InProcessBus;
    use crate::db::Database;
    use crate::models::now_ms;
    use crate::sync::remote::{ChangeBatch, RemoteError};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    /// Remote that accepts everything
    struct StubRemote;

    #[async_trait]
    impl RemoteApi for StubRemote {
        async fn changes_since(
            &self,
            _workspace: &WorkspaceId,
            _since: i64,
        ) -> std::result::Result<ChangeBatch, RemoteError> {
            Ok(ChangeBatch {
                server_time: now_ms(),
                entities: Vec::new(),
            })
        }

        async fn probe(
            &self,
            _workspace: &WorkspaceId,
            _since: i64,
        ) -> std::result::Result<bool, RemoteError> {
            Ok(false)
        }

        async fn create(
            &self,
            _workspace: &WorkspaceId,
            entity: &RemoteEntity,
            _idempotency_key: &str,
        ) -> std::result::Result<RemoteEntity, RemoteError> {
            Ok(entity.clone())
        }

        async fn update(
            &self,
            _workspace: &WorkspaceId,
            entity: &RemoteEntity,
        ) -> std::result::Result<RemoteEntity, RemoteError> {
            Ok(entity.clone())
        }

        async fn delete(
            &self,
            _workspace: &WorkspaceId,
            _kind: EntityKind,
            _id: &str,
        ) -> std::result::Result<(), RemoteError> {
            Ok(())
        }
    }

    fn service() -> SyncService {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        SyncService::new(
            db,
            Arc::new(StubRemote),
            Arc::new(InProcessBus::new()),
            WorkspaceId::from("ws-1"),
        )
    }

    #[test]
    fn test_create_commits_store_and_queue_together() {
        let svc = service();
        let card = svc.create(EntityKind::Card, json!({ "title": "A" })).unwrap();

        assert!(svc.get(EntityKind::Card, &card.id).unwrap().is_some());
        let status = svc.status().unwrap();
        assert_eq!(status.pending_operations, 1);
        assert_eq!(
            svc.entity_state(EntityKind::Card, &card.id).unwrap(),
            EntitySyncState::Queued
        );
    }

    #[test]
    fn test_update_requires_live_entity() {
        let svc = service();
        let missing = EntityId::generate();
        assert!(matches!(
            svc.update(EntityKind::Card, &missing, json!({})).unwrap_err(),
            Error::NotFound(_)
        ));

        let card = svc.create(EntityKind::Card, json!({ "title": "A" })).unwrap();
        svc.delete(EntityKind::Card, &card.id).unwrap();
        assert!(matches!(
            svc.update(EntityKind::Card, &card.id, json!({})).unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn test_create_then_edit_stays_one_queued_create() {
        let svc = service();
        let card = svc.create(EntityKind::Card, json!({ "title": "v1" })).unwrap();
        svc.update(EntityKind::Card, &card.id, json!({ "title": "v2" }))
            .unwrap();

        // Merge law: create + update collapses into the create
        let status = svc.status().unwrap();
        assert_eq!(status.pending_operations, 1);
        let fetched = svc.get(EntityKind::Card, &card.id).unwrap().unwrap();
        assert_eq!(fetched.payload["title"], "v2");
    }

    #[test]
    fn test_create_then_delete_leaves_nothing_queued() {
        let svc = service();
        let card = svc.create(EntityKind::Card, json!({})).unwrap();
        svc.delete(EntityKind::Card, &card.id).unwrap();

        assert_eq!(svc.status().unwrap().pending_operations, 0);
        // The soft-deleted row is out of the live listing
        assert!(svc.list(None).unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sync_now_delivers_and_settles() {
        let svc = service();
        let card = svc.create(EntityKind::Card, json!({ "title": "A" })).unwrap();
        assert_eq!(svc.status().unwrap().dirty_entities, 1);

        svc.sync_now().await.unwrap();

        let status = svc.status().unwrap();
        assert_eq!(status.pending_operations, 0);
        assert_eq!(status.dirty_entities, 0);
        assert_eq!(
            svc.entity_state(EntityKind::Card, &card.id).unwrap(),
            EntitySyncState::Synced
        );
        assert!(status.last_pull_at > 0);
        assert!(status.last_drain_attempt > 0);
    }

    #[test]
    fn test_clear_local_data_resets_workspace() {
        let svc = service();
        svc.create(EntityKind::Card, json!({})).unwrap();
        svc.clear_local_data().unwrap();

        let status = svc.status().unwrap();
        assert!(svc.list(None).unwrap().is_empty());
        assert_eq!(status.pending_operations, 0);
        assert_eq!(status.last_pull_at, 0);
    }

    #[test]
    fn test_switch_workspace_isolates_data() {
        let svc = service();
        svc.create(EntityKind::Card, json!({ "title": "first" })).unwrap();

        svc.switch_workspace(WorkspaceId::from("ws-2")).unwrap();
        assert!(svc.list(None).unwrap().is_empty());
        assert_eq!(svc.workspace(), WorkspaceId::from("ws-2"));

        svc.switch_workspace(WorkspaceId::from("ws-1")).unwrap();
        assert_eq!(svc.list(None).unwrap().len(), 1);
    }

    #[test]
    fn test_export_import_round_trip() {
        let svc = service();
        svc.create(EntityKind::Card, json!({ "title": "kept" })).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        let snapshot = svc.export_to(&path).unwrap();
        assert_eq!(snapshot.entities.len(), 1);

        svc.clear_local_data().unwrap();
        assert!(svc.list(None).unwrap().is_empty());

        let stats = svc.import_from(&path).unwrap();
        assert_eq!(stats.entities, 1);
        assert_eq!(svc.list(None).unwrap().len(), 1);
    }
}
