//! Sync engine: pull, merge, drain
//!
//! Orchestrates the two halves of a sync pass. Pull fetches remote
//! changes and merges them into the local store under last-write-wins;
//! drain delivers queued operations to the remote API, applying the
//! failure taxonomy (backoff retry, park, auth pause, not-found
//! convergence). A per-workspace guard rejects overlapping drains;
//! a watchdog returns operations stuck `active` (crash mid-flight)
//! to pending at the start of each pass.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;

use crate::db::{
    Database, EntityStore, NewOperation, OperationQueue, SqliteEntityStore, SqliteOperationQueue,
};
use crate::error::Result;
use crate::models::{
    now_ms, EntityId, EntityKind, OpKind, OpStatus, QueueOperation, SyncPhase, WorkspaceId,
    WriteOrigin,
};
use crate::sync::backoff::BackoffPolicy;
use crate::sync::remote::{ChangeBatch, RemoteApi, RemoteEntity, RemoteError};

/// Shared handle to the local database
pub type SharedDatabase = Arc<Mutex<Database>>;

/// Outcome of a pull pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    /// Changes were fetched and merged
    Applied {
        /// Remote entities that won the LWW comparison
        applied: usize,
        /// Remote entities older than the local copy, skipped
        ignored: usize,
    },
    /// The engine is offline; nothing was fetched
    Offline,
    /// The remote rejected our credentials; draining is paused too
    AuthRequired,
    /// The fetch failed for a transient reason
    Failed(String),
}

/// Counters for one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    /// Operations acknowledged by the remote
    pub delivered: usize,
    /// Operations parked on permanent failure
    pub parked: usize,
    /// Operations rescheduled after a transient failure
    pub deferred: usize,
}

/// Outcome of a drain pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The pass ran to completion (possibly delivering nothing)
    Completed(DrainStats),
    /// Another drain for this workspace is already in flight
    AlreadyRunning,
    /// The engine is offline
    Offline,
    /// A 401 stopped the pass; remaining operations stay pending and
    /// the drain resumes once auth is ready again
    AuthRequired(DrainStats),
    /// Cancellation was requested mid-pass; the in-flight operation
    /// finished first
    Cancelled(DrainStats),
}

/// Outcome of `full_sync` (pull followed by drain)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullSyncOutcome {
    pub pull: PullOutcome,
    pub drain: DrainOutcome,
}

/// Phase-change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEvent {
    pub workspace: WorkspaceId,
    pub phase: SyncPhase,
}

#[derive(Debug, Default)]
struct WorkspaceState {
    phase: SyncPhase,
    draining: bool,
    cancel_requested: bool,
}

/// Sync engine for one device
pub struct SyncEngine {
    db: SharedDatabase,
    remote: Arc<dyn RemoteApi>,
    backoff: BackoffPolicy,
    /// Active operations older than this are reclaimed by the watchdog
    stuck_timeout: Duration,
    offline: AtomicBool,
    auth_required: AtomicBool,
    states: Mutex<HashMap<WorkspaceId, WorkspaceState>>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncEngine {
    pub fn new(db: SharedDatabase, remote: Arc<dyn RemoteApi>, backoff: BackoffPolicy) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            db,
            remote,
            backoff,
            stuck_timeout: Duration::from_secs(60),
            offline: AtomicBool::new(false),
            auth_required: AtomicBool::new(false),
            states: Mutex::new(HashMap::new()),
            events,
        }
    }

    #[must_use]
    pub fn with_stuck_timeout(mut self, timeout: Duration) -> Self {
        self.stuck_timeout = timeout;
        self
    }

    /// Subscribe to phase-change events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Current phase for a workspace
    pub fn phase(&self, workspace: &WorkspaceId) -> SyncPhase {
        if self.offline.load(Ordering::SeqCst) {
            return SyncPhase::Offline;
        }
        self.states
            .lock()
            .unwrap()
            .get(workspace)
            .map_or(SyncPhase::Idle, |state| state.phase)
    }

    /// Connectivity lost: enter the absorbing offline state. Queued
    /// and local state is preserved.
    pub fn set_offline(&self) {
        if !self.offline.swap(true, Ordering::SeqCst) {
            tracing::info!("sync engine offline");
        }
    }

    /// Connectivity restored: leave offline, back to idle
    pub fn set_online(&self) {
        if self.offline.swap(false, Ordering::SeqCst) {
            tracing::info!("sync engine online");
        }
    }

    #[must_use]
    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Whether draining is paused waiting for fresh credentials
    #[must_use]
    pub fn is_auth_required(&self) -> bool {
        self.auth_required.load(Ordering::SeqCst)
    }

    /// The caller reports that authentication is ready again; the next
    /// sync trigger resumes draining where it stopped.
    pub fn set_auth_ready(&self) {
        if self.auth_required.swap(false, Ordering::SeqCst) {
            tracing::info!("auth ready, drain unpaused");
        }
    }

    /// Ask an in-flight drain to stop after its current operation
    pub fn request_cancel(&self, workspace: &WorkspaceId) {
        let mut states = self.states.lock().unwrap();
        let state = states.entry(workspace.clone()).or_default();
        if state.draining {
            state.cancel_requested = true;
        }
    }

    fn set_phase(&self, workspace: &WorkspaceId, phase: SyncPhase) {
        {
            let mut states = self.states.lock().unwrap();
            states.entry(workspace.clone()).or_default().phase = phase;
        }
        let _ = self.events.send(SyncEvent {
            workspace: workspace.clone(),
            phase,
        });
    }

    /// Fetch remote changes since the last pull and merge them under
    /// last-write-wins. Advances the pull cursor to the batch's
    /// server time.
    pub async fn pull(&self, workspace: &WorkspaceId) -> Result<PullOutcome> {
        if self.is_offline() {
            return Ok(PullOutcome::Offline);
        }

        let since = {
            let db = self.db.lock().unwrap();
            SqliteEntityStore::new(db.connection())
                .metadata(workspace)?
                .last_pull_at
        };

        // The pull is one unit to subscribers: Idle is not published
        // until the fetched batch has been merged
        self.set_phase(workspace, SyncPhase::Pulling);
        let outcome = match self.remote.changes_since(workspace, since).await {
            Ok(batch) => self.merge_batch(workspace, batch),
            Err(RemoteError::AuthRequired) => {
                self.auth_required.store(true, Ordering::SeqCst);
                Ok(PullOutcome::AuthRequired)
            }
            Err(error) => {
                tracing::warn!(workspace = %workspace, %error, "pull failed");
                Ok(PullOutcome::Failed(error.to_string()))
            }
        };
        self.set_phase(workspace, SyncPhase::Idle);
        outcome
    }

    /// Merge a change batch under last-write-wins and advance the
    /// pull cursor to the batch's server time
    fn merge_batch(&self, workspace: &WorkspaceId, batch: ChangeBatch) -> Result<PullOutcome> {
        let db = self.db.lock().unwrap();
        let store = SqliteEntityStore::new(db.connection());
        let mut applied = 0;
        let mut ignored = 0;
        for remote_entity in batch.entities {
            let entity = remote_entity.into_entity(workspace);
            match store.put(&entity, WriteOrigin::Remote)? {
                crate::db::PutOutcome::Applied(_) => applied += 1,
                crate::db::PutOutcome::IgnoredStale => ignored += 1,
            }
        }
        store.advance_pull_timestamp(workspace, batch.server_time)?;
        tracing::debug!(workspace = %workspace, applied, ignored, "pull merged");
        Ok(PullOutcome::Applied { applied, ignored })
    }

    /// Deliver queued operations until the queue has no eligible entry
    pub async fn drain(&self, workspace: &WorkspaceId) -> Result<DrainOutcome> {
        if self.is_offline() {
            return Ok(DrainOutcome::Offline);
        }
        if self.is_auth_required() {
            return Ok(DrainOutcome::AuthRequired(DrainStats::default()));
        }
        if !self.try_begin_drain(workspace) {
            return Ok(DrainOutcome::AlreadyRunning);
        }

        self.set_phase(workspace, SyncPhase::Draining);
        let result = self.drain_loop(workspace).await;
        self.end_drain(workspace);
        self.set_phase(workspace, SyncPhase::Idle);
        result
    }

    /// Pull followed by drain
    pub async fn full_sync(&self, workspace: &WorkspaceId) -> Result<FullSyncOutcome> {
        let pull = self.pull(workspace).await?;
        let drain = self.drain(workspace).await?;
        Ok(FullSyncOutcome { pull, drain })
    }

    /// Ask the remote whether anything changed since our pull cursor.
    /// Errors count as "maybe", so a full sync still runs.
    pub async fn remote_has_changes(&self, workspace: &WorkspaceId) -> Result<bool> {
        let since = {
            let db = self.db.lock().unwrap();
            SqliteEntityStore::new(db.connection())
                .metadata(workspace)?
                .last_pull_at
        };
        Ok(self.remote.probe(workspace, since).await.unwrap_or(true))
    }

    /// Number of operations awaiting delivery
    pub fn pending_operations(&self, workspace: &WorkspaceId) -> Result<usize> {
        let db = self.db.lock().unwrap();
        SqliteOperationQueue::new(db.connection()).pending_count(workspace)
    }

    /// Re-enqueue a create for every live local entity. This is the
    /// recovery path after remote data loss: the local store is
    /// authoritative, and idempotent creates converge the server back
    /// to the local snapshot.
    pub fn force_push(&self, workspace: &WorkspaceId) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let store = SqliteEntityStore::new(db.connection());
        let queue = SqliteOperationQueue::new(db.connection());

        let entities = store.list(workspace, None)?;
        let mut enqueued = 0;
        for entity in &entities {
            queue.enqueue(&NewOperation {
                workspace: workspace.clone(),
                entity_kind: entity.kind,
                entity_id: entity.id.clone(),
                op: OpKind::Create,
                payload: Some(serde_json::to_value(RemoteEntity::from_entity(entity))?),
            })?;
            enqueued += 1;
        }
        tracing::info!(workspace = %workspace, enqueued, "force push queued");
        Ok(enqueued)
    }

    fn try_begin_drain(&self, workspace: &WorkspaceId) -> bool {
        let mut states = self.states.lock().unwrap();
        let state = states.entry(workspace.clone()).or_default();
        if state.draining {
            return false;
        }
        state.draining = true;
        state.cancel_requested = false;
        true
    }

    fn end_drain(&self, workspace: &WorkspaceId) {
        let mut states = self.states.lock().unwrap();
        if let Some(state) = states.get_mut(workspace) {
            state.draining = false;
            state.cancel_requested = false;
        }
    }

    fn cancel_requested(&self, workspace: &WorkspaceId) -> bool {
        self.states
            .lock()
            .unwrap()
            .get(workspace)
            .is_some_and(|state| state.cancel_requested)
    }

    async fn drain_loop(&self, workspace: &WorkspaceId) -> Result<DrainOutcome> {
        let mut stats = DrainStats::default();

        {
            let now = now_ms();
            let cutoff =
                now.saturating_sub(i64::try_from(self.stuck_timeout.as_millis()).unwrap_or(i64::MAX));
            let db = self.db.lock().unwrap();
            SqliteEntityStore::new(db.connection()).record_drain_attempt(workspace, now)?;
            SqliteOperationQueue::new(db.connection()).reclaim_stuck(workspace, cutoff)?;
        }

        loop {
            if self.cancel_requested(workspace) {
                tracing::info!(workspace = %workspace, "drain cancelled");
                return Ok(DrainOutcome::Cancelled(stats));
            }
            if self.is_offline() {
                return Ok(DrainOutcome::Offline);
            }

            let op = {
                let db = self.db.lock().unwrap();
                SqliteOperationQueue::new(db.connection()).next_ready(workspace, now_ms())?
            };
            let Some(op) = op else {
                break;
            };

            tracing::debug!(
                op_id = op.id,
                op = %op.op,
                entity = %op.entity_id,
                retry = op.retry_count,
                "transmitting operation"
            );
            let result = self.transmit(workspace, &op).await;

            match self.settle(workspace, &op, result, &mut stats)? {
                Settled::Continue => {}
                Settled::AuthPause => return Ok(DrainOutcome::AuthRequired(stats)),
            }
        }

        tracing::debug!(
            workspace = %workspace,
            delivered = stats.delivered,
            parked = stats.parked,
            deferred = stats.deferred,
            "drain pass complete"
        );
        Ok(DrainOutcome::Completed(stats))
    }

    /// Send one operation to the remote. No database lock is held here.
    async fn transmit(
        &self,
        workspace: &WorkspaceId,
        op: &QueueOperation,
    ) -> std::result::Result<Option<RemoteEntity>, RemoteError> {
        match op.op {
            OpKind::Create => {
                let entity = snapshot_for(op)?;
                // The key is stable across retries of the same queue
                // entry, letting the server deduplicate lost responses
                let idempotency_key = format!("{}-{}", workspace.as_str(), op.id);
                match self.remote.create(workspace, &entity, &idempotency_key).await {
                    Ok(created) => Ok(Some(created)),
                    // Duplicate create is success: the first response
                    // was lost, the entity is already there
                    Err(RemoteError::AlreadyExists(existing)) => Ok(Some(existing)),
                    Err(error) => Err(error),
                }
            }
            OpKind::Update => {
                let entity = snapshot_for(op)?;
                self.remote.update(workspace, &entity).await.map(Some)
            }
            OpKind::Delete => self
                .remote
                .delete(workspace, op.entity_kind, op.entity_id.as_str())
                .await
                .map(|()| None),
        }
    }

    /// Apply a transmit result to the queue and store
    fn settle(
        &self,
        workspace: &WorkspaceId,
        op: &QueueOperation,
        result: std::result::Result<Option<RemoteEntity>, RemoteError>,
        stats: &mut DrainStats,
    ) -> Result<Settled> {
        let db = self.db.lock().unwrap();
        let store = SqliteEntityStore::new(db.connection());
        let queue = SqliteOperationQueue::new(db.connection());

        match result {
            Ok(remote_entity) => {
                queue.ack(op.id)?;
                stats.delivered += 1;
                self.apply_ack(&store, &queue, workspace, op, remote_entity)?;
            }
            Err(RemoteError::AuthRequired) => {
                // Not a failure of the operation itself: no retry
                // bump, nothing parked, drain pauses until auth is
                // reported ready again
                queue.release(op.id)?;
                self.auth_required.store(true, Ordering::SeqCst);
                tracing::warn!(workspace = %workspace, "drain paused: auth required");
                return Ok(Settled::AuthPause);
            }
            Err(RemoteError::NotFound) => {
                // Already reconciled remotely; converge local state
                queue.ack(op.id)?;
                stats.delivered += 1;
                match op.op {
                    OpKind::Delete => {
                        store.hard_delete(workspace, op.entity_kind, &op.entity_id)?;
                    }
                    _ => {
                        // A create queued behind this op (a force push
                        // over a pending update) is about to restore
                        // the remote copy; converging to deleted would
                        // hide the row it recreates
                        let recreate_queued = queue
                            .operations_for_entity(workspace, op.entity_kind, &op.entity_id)?
                            .iter()
                            .any(|queued| queued.op == OpKind::Create);
                        if !recreate_queued {
                            store.converge_deleted(workspace, op.entity_kind, &op.entity_id)?;
                        }
                    }
                }
            }
            Err(RemoteError::Validation { status, detail }) => {
                queue.park(op.id, &format!("validation ({status}): {detail}"))?;
                stats.parked += 1;
            }
            Err(RemoteError::AlreadyExists(_)) => {
                // Only reachable for non-create ops; the payload was
                // rejected for a state conflict we cannot fix by retry
                queue.park(op.id, "conflict: already exists")?;
                stats.parked += 1;
            }
            Err(RemoteError::Transient(reason)) => {
                let retry_at = self.backoff.next_attempt_at(now_ms(), op.retry_count);
                match queue.fail_transient(op.id, retry_at, self.backoff.max_retries, &reason)? {
                    OpStatus::Parked => stats.parked += 1,
                    _ => stats.deferred += 1,
                }
            }
        }
        Ok(Settled::Continue)
    }

    /// Post-ack bookkeeping: canonical id adoption, flag clearing,
    /// hard delete after a confirmed delete
    fn apply_ack(
        &self,
        store: &SqliteEntityStore<'_>,
        queue: &SqliteOperationQueue<'_>,
        workspace: &WorkspaceId,
        op: &QueueOperation,
        remote_entity: Option<RemoteEntity>,
    ) -> Result<()> {
        if op.op == OpKind::Delete {
            // Confirmed by the remote; the soft-deleted row can go
            store.hard_delete(workspace, op.entity_kind, &op.entity_id)?;
            return Ok(());
        }

        let Some(remote_entity) = remote_entity else {
            return Ok(());
        };

        let mut entity_id = op.entity_id.clone();
        if remote_entity.id != entity_id.as_str() {
            let canonical = EntityId::new(remote_entity.id.clone());
            store.rewrite_id(workspace, op.entity_kind, &entity_id, &canonical)?;
            queue.rewrite_entity_id(workspace, op.entity_kind, &entity_id, &canonical)?;
            entity_id = canonical;
        }

        // Only clear the dirty flags if no later edit queued behind
        // this operation while it was in flight
        let remaining = queue.operations_for_entity(workspace, op.entity_kind, &entity_id)?;
        if remaining.is_empty() {
            store.mark_synced(workspace, op.entity_kind, &entity_id, remote_entity.updated_at)?;
        }
        Ok(())
    }
}

enum Settled {
    Continue,
    AuthPause,
}

/// Decode the entity snapshot carried by a queue operation
fn snapshot_for(op: &QueueOperation) -> std::result::Result<RemoteEntity, RemoteError> {
    let payload = op.payload.as_ref().ok_or_else(|| RemoteError::Validation {
        status: 0,
        detail: "operation has no payload".to_string(),
    })?;
    let mut entity: RemoteEntity =
        serde_json::from_value(payload.clone()).map_err(|error| RemoteError::Validation {
            status: 0,
            detail: format!("invalid operation payload: {error}"),
        })?;
    // The queue entry's id wins: a canonical-id rewrite repoints the
    // operation but not its stored snapshot
    entity.id = op.entity_id.to_string();
    Ok(entity)
}
