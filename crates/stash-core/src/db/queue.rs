//! Durable operation queue
//!
//! An ordered log of pending mutations awaiting delivery. The SQLite
//! rowid is the monotonic sequence; FIFO order holds per entity key,
//! with merge-on-enqueue collapsing redundant intermediate states so
//! the queue holds at most one pending entry per entity.

use crate::error::{Error, Result};
use crate::models::{
    now_ms, EntityId, EntityKind, OpKind, OpStatus, QueueOperation, WorkspaceId,
};
use rusqlite::{params, Connection, OptionalExtension};

/// A mutation to append to the queue
#[derive(Debug, Clone)]
pub struct NewOperation {
    pub workspace: WorkspaceId,
    pub entity_kind: EntityKind,
    pub entity_id: EntityId,
    pub op: OpKind,
    /// Entity snapshot (absent for deletes)
    pub payload: Option<serde_json::Value>,
}

/// What `enqueue` did with the new operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended as a new queue entry
    Appended(i64),
    /// Folded into an existing pending entry (id of that entry)
    Merged(i64),
    /// The operation and its predecessor cancelled each other out
    /// (create + delete before transmission)
    Cancelled,
}

/// Trait for queue storage operations
pub trait OperationQueue {
    /// Append a mutation, merging against the newest still-pending
    /// operation for the same entity (see module docs)
    fn enqueue(&self, op: &NewOperation) -> Result<EnqueueOutcome>;

    /// Claim the earliest eligible pending operation and mark it
    /// active. Skips parked entries, entries waiting out a backoff
    /// delay, and entities that already have an active operation.
    fn next_ready(&self, workspace: &WorkspaceId, now: i64) -> Result<Option<QueueOperation>>;

    /// Successful delivery: remove the operation
    fn ack(&self, op_id: i64) -> Result<()>;

    /// Transient failure: bump the retry count and either reschedule
    /// the attempt or park at the retry cap. Returns the new status.
    fn fail_transient(
        &self,
        op_id: i64,
        retry_at: i64,
        max_retries: u32,
        error: &str,
    ) -> Result<OpStatus>;

    /// Permanent failure: park immediately with the error detail
    fn park(&self, op_id: i64, error: &str) -> Result<()>;

    /// Return an active operation to pending without a retry bump
    /// (used when a drain pass stops for reasons unrelated to the
    /// operation itself, e.g. an auth pause)
    fn release(&self, op_id: i64) -> Result<()>;

    /// Watchdog: return active operations dispatched before `cutoff`
    /// to pending. Covers a crash mid-transmission.
    fn reclaim_stuck(&self, workspace: &WorkspaceId, cutoff: i64) -> Result<usize>;

    /// All parked operations, oldest first
    fn parked(&self, workspace: &WorkspaceId) -> Result<Vec<QueueOperation>>;

    /// Move all parked operations back to pending for a fresh attempt
    fn retry_parked(&self, workspace: &WorkspaceId) -> Result<usize>;

    /// Number of pending + active operations
    fn pending_count(&self, workspace: &WorkspaceId) -> Result<usize>;

    /// All not-yet-delivered operations, in queue order (for snapshots)
    fn all_operations(&self, workspace: &WorkspaceId) -> Result<Vec<QueueOperation>>;

    /// Operations targeting one entity, in queue order
    fn operations_for_entity(
        &self,
        workspace: &WorkspaceId,
        kind: EntityKind,
        id: &EntityId,
    ) -> Result<Vec<QueueOperation>>;

    /// Repoint queued operations after a canonical-id rewrite
    fn rewrite_entity_id(
        &self,
        workspace: &WorkspaceId,
        kind: EntityKind,
        old_id: &EntityId,
        new_id: &EntityId,
    ) -> Result<()>;

    /// Drop every operation for a workspace
    fn clear_workspace(&self, workspace: &WorkspaceId) -> Result<()>;
}

/// `SQLite` implementation of `OperationQueue`
pub struct SqliteOperationQueue<'a> {
    conn: &'a Connection,
}

const SELECT_COLUMNS: &str = "id, workspace_id, entity_kind, entity_id, op, payload,
     enqueued_at, retry_count, status, next_attempt_at, last_error";

impl<'a> SqliteOperationQueue<'a> {
    /// Create a new queue with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_op(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueOperation> {
        let payload: Option<String> = row.get(5)?;
        Ok(QueueOperation {
            id: row.get(0)?,
            workspace: WorkspaceId::new(row.get::<_, String>(1)?),
            entity_kind: row
                .get::<_, String>(2)?
                .parse()
                .map_err(|_| rusqlite::Error::InvalidQuery)?,
            entity_id: EntityId::new(row.get::<_, String>(3)?),
            op: row
                .get::<_, String>(4)?
                .parse()
                .map_err(|_| rusqlite::Error::InvalidQuery)?,
            payload: payload
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .map_err(|_| rusqlite::Error::InvalidQuery)?,
            enqueued_at: row.get(6)?,
            retry_count: row.get(7)?,
            status: row
                .get::<_, String>(8)?
                .parse()
                .map_err(|_| rusqlite::Error::InvalidQuery)?,
            next_attempt_at: row.get(9)?,
            last_error: row.get(10)?,
        })
    }

    /// Newest operation for the entity in the given status
    fn latest_for_entity(
        &self,
        op: &NewOperation,
        status: OpStatus,
    ) -> Result<Option<QueueOperation>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM queue_ops
                     WHERE workspace_id = ?1 AND entity_kind = ?2 AND entity_id = ?3
                       AND status = ?4
                     ORDER BY id DESC LIMIT 1"
                ),
                params![
                    op.workspace.as_str(),
                    op.entity_kind.as_str(),
                    op.entity_id.as_str(),
                    status.as_str(),
                ],
                Self::parse_op,
            )
            .optional()
            .map_err(Error::from)
    }

    fn remove(&self, op_id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM queue_ops WHERE id = ?1", params![op_id])?;
        Ok(())
    }

    fn replace_payload(&self, op_id: i64, payload: Option<&serde_json::Value>) -> Result<()> {
        let raw = payload.map(serde_json::to_string).transpose()?;
        self.conn.execute(
            "UPDATE queue_ops SET payload = ?1 WHERE id = ?2",
            params![raw, op_id],
        )?;
        Ok(())
    }

    fn append(&self, op: &NewOperation) -> Result<i64> {
        let raw = op.payload.as_ref().map(serde_json::to_string).transpose()?;
        self.conn.execute(
            "INSERT INTO queue_ops
                 (workspace_id, entity_kind, entity_id, op, payload, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                op.workspace.as_str(),
                op.entity_kind.as_str(),
                op.entity_id.as_str(),
                op.op.as_str(),
                raw,
                now_ms(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// A later delete supersedes a parked operation for the same
    /// entity. Removes it; reports whether it was a parked create
    /// (meaning nothing ever reached the remote).
    fn cancel_parked_for_delete(&self, op: &NewOperation) -> Result<bool> {
        let Some(parked) = self.latest_for_entity(op, OpStatus::Parked)? else {
            return Ok(false);
        };
        tracing::info!(
            op_id = parked.id,
            entity = %parked.entity_id,
            "cancelling parked operation superseded by delete"
        );
        self.remove(parked.id)?;
        Ok(parked.op == OpKind::Create)
    }
}

impl OperationQueue for SqliteOperationQueue<'_> {
    fn enqueue(&self, op: &NewOperation) -> Result<EnqueueOutcome> {
        // Open question resolution: a delete cancels a parked op for
        // the same entity. A parked create never reached the remote,
        // so the delete itself is unnecessary too.
        if op.op == OpKind::Delete && self.cancel_parked_for_delete(op)? {
            return Ok(EnqueueOutcome::Cancelled);
        }

        let Some(prev) = self.latest_for_entity(op, OpStatus::Pending)? else {
            return Ok(EnqueueOutcome::Appended(self.append(op)?));
        };

        match (prev.op, op.op) {
            // update + update: newest payload, earliest queue position
            (OpKind::Update, OpKind::Update) => {
                self.replace_payload(prev.id, op.payload.as_ref())?;
                Ok(EnqueueOutcome::Merged(prev.id))
            }
            // create + update: still a single create carrying the
            // latest snapshot
            (OpKind::Create, OpKind::Update) => {
                self.replace_payload(prev.id, op.payload.as_ref())?;
                Ok(EnqueueOutcome::Merged(prev.id))
            }
            // create + delete before transmission: nothing to do
            // remotely, cancel both
            (OpKind::Create, OpKind::Delete) => {
                self.remove(prev.id)?;
                Ok(EnqueueOutcome::Cancelled)
            }
            // update + delete: shipping the update would be wasted work
            (OpKind::Update, OpKind::Delete) => {
                self.remove(prev.id)?;
                Ok(EnqueueOutcome::Appended(self.append(op)?))
            }
            // Anything else (delete followed by a re-create, a second
            // create, ...) keeps its own queue entry
            _ => Ok(EnqueueOutcome::Appended(self.append(op)?)),
        }
    }

    fn next_ready(&self, workspace: &WorkspaceId, now: i64) -> Result<Option<QueueOperation>> {
        // At most one active operation per entity: a pending op is not
        // eligible while an earlier one for the same entity is in
        // flight (covers a delete queued behind an active create).
        let candidate = self
            .conn
            .query_row(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM queue_ops q
                     WHERE q.workspace_id = ?1
                       AND q.status = 'pending'
                       AND q.next_attempt_at <= ?2
                       AND NOT EXISTS (
                           SELECT 1 FROM queue_ops a
                           WHERE a.workspace_id = q.workspace_id
                             AND a.entity_kind = q.entity_kind
                             AND a.entity_id = q.entity_id
                             AND a.status = 'active'
                       )
                     ORDER BY q.id ASC LIMIT 1"
                ),
                params![workspace.as_str(), now],
                Self::parse_op,
            )
            .optional()?;

        let Some(mut op) = candidate else {
            return Ok(None);
        };

        self.conn.execute(
            "UPDATE queue_ops SET status = 'active', dispatched_at = ?1 WHERE id = ?2",
            params![now, op.id],
        )?;
        op.status = OpStatus::Active;
        Ok(Some(op))
    }

    fn ack(&self, op_id: i64) -> Result<()> {
        self.remove(op_id)
    }

    fn fail_transient(
        &self,
        op_id: i64,
        retry_at: i64,
        max_retries: u32,
        error: &str,
    ) -> Result<OpStatus> {
        let retry_count: u32 = self.conn.query_row(
            "SELECT retry_count FROM queue_ops WHERE id = ?1",
            params![op_id],
            |row| row.get(0),
        )?;
        let retry_count = retry_count + 1;

        if retry_count >= max_retries {
            self.conn.execute(
                "UPDATE queue_ops
                 SET status = 'parked', retry_count = ?1, last_error = ?2,
                     dispatched_at = NULL
                 WHERE id = ?3",
                params![retry_count, error, op_id],
            )?;
            tracing::warn!(op_id, retry_count, error, "parking operation at retry cap");
            return Ok(OpStatus::Parked);
        }

        self.conn.execute(
            "UPDATE queue_ops
             SET status = 'pending', retry_count = ?1, next_attempt_at = ?2,
                 last_error = ?3, dispatched_at = NULL
             WHERE id = ?4",
            params![retry_count, retry_at, error, op_id],
        )?;
        Ok(OpStatus::Pending)
    }

    fn park(&self, op_id: i64, error: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE queue_ops
             SET status = 'parked', last_error = ?1, dispatched_at = NULL
             WHERE id = ?2",
            params![error, op_id],
        )?;
        tracing::warn!(op_id, error, "parked operation");
        Ok(())
    }

    fn release(&self, op_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE queue_ops
             SET status = 'pending', dispatched_at = NULL
             WHERE id = ?1 AND status = 'active'",
            params![op_id],
        )?;
        Ok(())
    }

    fn reclaim_stuck(&self, workspace: &WorkspaceId, cutoff: i64) -> Result<usize> {
        let reclaimed = self.conn.execute(
            "UPDATE queue_ops
             SET status = 'pending', dispatched_at = NULL
             WHERE workspace_id = ?1 AND status = 'active' AND dispatched_at < ?2",
            params![workspace.as_str(), cutoff],
        )?;
        if reclaimed > 0 {
            tracing::warn!(
                workspace = %workspace,
                reclaimed,
                "watchdog returned stuck active operations to pending"
            );
        }
        Ok(reclaimed)
    }

    fn parked(&self, workspace: &WorkspaceId) -> Result<Vec<QueueOperation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM queue_ops
             WHERE workspace_id = ?1 AND status = 'parked'
             ORDER BY id ASC"
        ))?;
        let ops = stmt
            .query_map(params![workspace.as_str()], Self::parse_op)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ops)
    }

    fn retry_parked(&self, workspace: &WorkspaceId) -> Result<usize> {
        let retried = self.conn.execute(
            "UPDATE queue_ops
             SET status = 'pending', retry_count = 0, next_attempt_at = 0, last_error = NULL
             WHERE workspace_id = ?1 AND status = 'parked'",
            params![workspace.as_str()],
        )?;
        if retried > 0 {
            tracing::info!(workspace = %workspace, retried, "manual retry of parked operations");
        }
        Ok(retried)
    }

    fn pending_count(&self, workspace: &WorkspaceId) -> Result<usize> {
        let count: usize = self.conn.query_row(
            "SELECT COUNT(*) FROM queue_ops
             WHERE workspace_id = ?1 AND status IN ('pending', 'active')",
            params![workspace.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn all_operations(&self, workspace: &WorkspaceId) -> Result<Vec<QueueOperation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM queue_ops
             WHERE workspace_id = ?1
             ORDER BY id ASC"
        ))?;
        let ops = stmt
            .query_map(params![workspace.as_str()], Self::parse_op)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ops)
    }

    fn operations_for_entity(
        &self,
        workspace: &WorkspaceId,
        kind: EntityKind,
        id: &EntityId,
    ) -> Result<Vec<QueueOperation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM queue_ops
             WHERE workspace_id = ?1 AND entity_kind = ?2 AND entity_id = ?3
             ORDER BY id ASC"
        ))?;
        let ops = stmt
            .query_map(
                params![workspace.as_str(), kind.as_str(), id.as_str()],
                Self::parse_op,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ops)
    }

    fn rewrite_entity_id(
        &self,
        workspace: &WorkspaceId,
        kind: EntityKind,
        old_id: &EntityId,
        new_id: &EntityId,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE queue_ops SET entity_id = ?1
             WHERE workspace_id = ?2 AND entity_kind = ?3 AND entity_id = ?4",
            params![
                new_id.as_str(),
                workspace.as_str(),
                kind.as_str(),
                old_id.as_str()
            ],
        )?;
        Ok(())
    }

    fn clear_workspace(&self, workspace: &WorkspaceId) -> Result<()> {
        self.conn.execute(
            "DELETE FROM queue_ops WHERE workspace_id = ?1",
            params![workspace.as_str()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn workspace() -> WorkspaceId {
        WorkspaceId::from("ws-1")
    }

    fn new_op(id: &str, op: OpKind, payload: serde_json::Value) -> NewOperation {
        NewOperation {
            workspace: workspace(),
            entity_kind: EntityKind::Card,
            entity_id: EntityId::from(id),
            op,
            payload: Some(payload),
        }
    }

    fn delete_op(id: &str) -> NewOperation {
        NewOperation {
            workspace: workspace(),
            entity_kind: EntityKind::Card,
            entity_id: EntityId::from(id),
            op: OpKind::Delete,
            payload: None,
        }
    }

    #[test]
    fn test_update_update_collapses_to_latest_payload() {
        let db = setup();
        let queue = SqliteOperationQueue::new(db.connection());

        let first = queue
            .enqueue(&new_op("a", OpKind::Update, json!({ "title": "X" })))
            .unwrap();
        let EnqueueOutcome::Appended(first_id) = first else {
            panic!("first op should append");
        };

        let second = queue
            .enqueue(&new_op("a", OpKind::Update, json!({ "title": "Y" })))
            .unwrap();
        assert_eq!(second, EnqueueOutcome::Merged(first_id));

        let ops = queue.all_operations(&workspace()).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op, OpKind::Update);
        assert_eq!(ops[0].payload.as_ref().unwrap()["title"], "Y");
        // Queue position (and enqueue time) of the first op survives
        assert_eq!(ops[0].id, first_id);
    }

    #[test]
    fn test_create_update_stays_a_single_create() {
        let db = setup();
        let queue = SqliteOperationQueue::new(db.connection());

        queue
            .enqueue(&new_op("a", OpKind::Create, json!({ "title": "X" })))
            .unwrap();
        queue
            .enqueue(&new_op("a", OpKind::Update, json!({ "title": "Y" })))
            .unwrap();

        let ops = queue.all_operations(&workspace()).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op, OpKind::Create);
        assert_eq!(ops[0].payload.as_ref().unwrap()["title"], "Y");
    }

    #[test]
    fn test_create_delete_before_transmission_cancels_both() {
        let db = setup();
        let queue = SqliteOperationQueue::new(db.connection());

        queue
            .enqueue(&new_op("a", OpKind::Create, json!({})))
            .unwrap();
        let outcome = queue.enqueue(&delete_op("a")).unwrap();

        assert_eq!(outcome, EnqueueOutcome::Cancelled);
        assert!(queue.all_operations(&workspace()).unwrap().is_empty());
    }

    #[test]
    fn test_delete_after_active_create_queues_behind_it() {
        let db = setup();
        let queue = SqliteOperationQueue::new(db.connection());

        queue
            .enqueue(&new_op("a", OpKind::Create, json!({})))
            .unwrap();
        // Create goes in flight
        let active = queue.next_ready(&workspace(), now_ms()).unwrap().unwrap();
        assert_eq!(active.op, OpKind::Create);

        let outcome = queue.enqueue(&delete_op("a")).unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Appended(_)));

        // The delete is not eligible while the create is active
        assert!(queue.next_ready(&workspace(), now_ms()).unwrap().is_none());

        // Once the create acks, the delete becomes eligible
        queue.ack(active.id).unwrap();
        let next = queue.next_ready(&workspace(), now_ms()).unwrap().unwrap();
        assert_eq!(next.op, OpKind::Delete);
    }

    #[test]
    fn test_update_delete_drops_the_update() {
        let db = setup();
        let queue = SqliteOperationQueue::new(db.connection());

        queue
            .enqueue(&new_op("a", OpKind::Update, json!({ "title": "X" })))
            .unwrap();
        queue.enqueue(&delete_op("a")).unwrap();

        let ops = queue.all_operations(&workspace()).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op, OpKind::Delete);
    }

    #[test]
    fn test_delete_cancels_parked_update() {
        let db = setup();
        let queue = SqliteOperationQueue::new(db.connection());

        queue
            .enqueue(&new_op("a", OpKind::Update, json!({})))
            .unwrap();
        let op = queue.next_ready(&workspace(), now_ms()).unwrap().unwrap();
        queue.park(op.id, "validation failed").unwrap();

        let outcome = queue.enqueue(&delete_op("a")).unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Appended(_)));

        let ops = queue.all_operations(&workspace()).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op, OpKind::Delete);
    }

    #[test]
    fn test_delete_cancels_parked_create_entirely() {
        let db = setup();
        let queue = SqliteOperationQueue::new(db.connection());

        queue
            .enqueue(&new_op("a", OpKind::Create, json!({})))
            .unwrap();
        let op = queue.next_ready(&workspace(), now_ms()).unwrap().unwrap();
        queue.park(op.id, "validation failed").unwrap();

        // The parked create never reached the remote, so there is
        // nothing to delete either
        let outcome = queue.enqueue(&delete_op("a")).unwrap();
        assert_eq!(outcome, EnqueueOutcome::Cancelled);
        assert!(queue.all_operations(&workspace()).unwrap().is_empty());
    }

    #[test]
    fn test_fifo_order_across_entities() {
        let db = setup();
        let queue = SqliteOperationQueue::new(db.connection());

        queue
            .enqueue(&new_op("a", OpKind::Update, json!({})))
            .unwrap();
        queue
            .enqueue(&new_op("b", OpKind::Update, json!({})))
            .unwrap();

        let first = queue.next_ready(&workspace(), now_ms()).unwrap().unwrap();
        assert_eq!(first.entity_id.as_str(), "a");
        let second = queue.next_ready(&workspace(), now_ms()).unwrap().unwrap();
        assert_eq!(second.entity_id.as_str(), "b");
    }

    #[test]
    fn test_backoff_delay_defers_eligibility() {
        let db = setup();
        let queue = SqliteOperationQueue::new(db.connection());

        queue
            .enqueue(&new_op("a", OpKind::Update, json!({})))
            .unwrap();
        let now = now_ms();
        let op = queue.next_ready(&workspace(), now).unwrap().unwrap();

        let status = queue
            .fail_transient(op.id, now + 1_000, 5, "timeout")
            .unwrap();
        assert_eq!(status, OpStatus::Pending);

        // Not eligible until the backoff elapses
        assert!(queue.next_ready(&workspace(), now + 500).unwrap().is_none());
        assert!(queue
            .next_ready(&workspace(), now + 1_000)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_parks_after_max_retries() {
        let db = setup();
        let queue = SqliteOperationQueue::new(db.connection());

        queue
            .enqueue(&new_op("a", OpKind::Update, json!({})))
            .unwrap();

        let max_retries = 3;
        for attempt in 1..=max_retries {
            let op = queue.next_ready(&workspace(), i64::MAX - 1).unwrap().unwrap();
            let status = queue.fail_transient(op.id, 0, max_retries, "timeout").unwrap();
            if attempt < max_retries {
                assert_eq!(status, OpStatus::Pending);
            } else {
                assert_eq!(status, OpStatus::Parked);
            }
        }

        // Parked ops are skipped by the drain loop but remain queryable
        assert!(queue.next_ready(&workspace(), i64::MAX - 1).unwrap().is_none());
        let parked = queue.parked(&workspace()).unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].retry_count, max_retries);
        assert_eq!(parked[0].last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_parked_does_not_block_other_entities() {
        let db = setup();
        let queue = SqliteOperationQueue::new(db.connection());

        queue
            .enqueue(&new_op("poison", OpKind::Update, json!({})))
            .unwrap();
        queue
            .enqueue(&new_op("healthy", OpKind::Update, json!({})))
            .unwrap();

        let op = queue.next_ready(&workspace(), now_ms()).unwrap().unwrap();
        queue.park(op.id, "bad payload").unwrap();

        let next = queue.next_ready(&workspace(), now_ms()).unwrap().unwrap();
        assert_eq!(next.entity_id.as_str(), "healthy");
    }

    #[test]
    fn test_release_keeps_retry_count() {
        let db = setup();
        let queue = SqliteOperationQueue::new(db.connection());

        queue
            .enqueue(&new_op("a", OpKind::Update, json!({})))
            .unwrap();
        let op = queue.next_ready(&workspace(), now_ms()).unwrap().unwrap();
        queue.release(op.id).unwrap();

        let ops = queue.all_operations(&workspace()).unwrap();
        assert_eq!(ops[0].status, OpStatus::Pending);
        assert_eq!(ops[0].retry_count, 0);
    }

    #[test]
    fn test_retry_parked_resets_state() {
        let db = setup();
        let queue = SqliteOperationQueue::new(db.connection());

        queue
            .enqueue(&new_op("a", OpKind::Update, json!({})))
            .unwrap();
        let op = queue.next_ready(&workspace(), now_ms()).unwrap().unwrap();
        queue.park(op.id, "bad payload").unwrap();

        assert_eq!(queue.retry_parked(&workspace()).unwrap(), 1);
        let ops = queue.all_operations(&workspace()).unwrap();
        assert_eq!(ops[0].status, OpStatus::Pending);
        assert_eq!(ops[0].retry_count, 0);
        assert!(ops[0].last_error.is_none());
    }

    #[test]
    fn test_reclaim_stuck_active_ops() {
        let db = setup();
        let queue = SqliteOperationQueue::new(db.connection());

        queue
            .enqueue(&new_op("a", OpKind::Update, json!({})))
            .unwrap();
        let now = now_ms();
        let op = queue.next_ready(&workspace(), now).unwrap().unwrap();
        assert_eq!(op.status, OpStatus::Active);

        // Not yet stuck
        assert_eq!(queue.reclaim_stuck(&workspace(), now).unwrap(), 0);
        // Past the watchdog cutoff
        assert_eq!(queue.reclaim_stuck(&workspace(), now + 1).unwrap(), 1);

        let reclaimed = queue.next_ready(&workspace(), now).unwrap().unwrap();
        assert_eq!(reclaimed.id, op.id);
    }

    #[test]
    fn test_rewrite_entity_id_repoints_queued_ops() {
        let db = setup();
        let queue = SqliteOperationQueue::new(db.connection());

        queue
            .enqueue(&new_op("tmp-1", OpKind::Update, json!({})))
            .unwrap();
        queue
            .rewrite_entity_id(
                &workspace(),
                EntityKind::Card,
                &EntityId::from("tmp-1"),
                &EntityId::from("srv-9"),
            )
            .unwrap();

        let ops = queue.all_operations(&workspace()).unwrap();
        assert_eq!(ops[0].entity_id.as_str(), "srv-9");
    }

    #[test]
    fn test_workspace_isolation() {
        let db = setup();
        let queue = SqliteOperationQueue::new(db.connection());

        queue
            .enqueue(&new_op("a", OpKind::Update, json!({})))
            .unwrap();

        let other = WorkspaceId::from("ws-2");
        assert_eq!(queue.pending_count(&other).unwrap(), 0);
        assert!(queue.next_ready(&other, now_ms()).unwrap().is_none());
    }
}
