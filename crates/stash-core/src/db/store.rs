//! Local entity store
//!
//! The on-device store is the authoritative copy of user data. Writes
//! with a `Local` origin always succeed and mark the row dirty; writes
//! with a `Remote` origin apply last-write-wins and never regress a
//! newer local row.

use crate::error::{Error, Result};
use crate::models::{
    now_ms, Entity, EntityId, EntityKind, SyncMetadata, WorkspaceId, WriteOrigin,
};
use rusqlite::{params, Connection, OptionalExtension};

/// Outcome of a store write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// The row was written; carries the stored state
    Applied(Entity),
    /// A remote write was older than the stored row and was ignored
    IgnoredStale,
}

/// Trait for entity and sync-metadata storage operations
pub trait EntityStore {
    /// Get an entity by key. Soft-deleted rows are returned with
    /// `deleted = true`; they exist until the remote confirms.
    fn get(&self, workspace: &WorkspaceId, kind: EntityKind, id: &EntityId)
        -> Result<Option<Entity>>;

    /// Write an entity. `Local` bumps `updated_at` and sets dirty
    /// flags; `Remote` overwrites only strictly-newer rows and clears
    /// them.
    fn put(&self, entity: &Entity, origin: WriteOrigin) -> Result<PutOutcome>;

    /// Soft-delete: mark the row deleted and dirty, never remove it
    fn mark_deleted(&self, workspace: &WorkspaceId, kind: EntityKind, id: &EntityId)
        -> Result<Entity>;

    /// List live (not soft-deleted) entities, newest first
    fn list(&self, workspace: &WorkspaceId, kind: Option<EntityKind>) -> Result<Vec<Entity>>;

    /// All entities with unsynced local state, including soft-deleted ones
    fn list_dirty(&self, workspace: &WorkspaceId) -> Result<Vec<Entity>>;

    /// Every row for the workspace, soft-deleted included (snapshots)
    fn list_all(&self, workspace: &WorkspaceId) -> Result<Vec<Entity>>;

    /// Write a row verbatim, flags and timestamps untouched (snapshot
    /// restore)
    fn restore(&self, entity: &Entity) -> Result<()>;

    /// Clear dirty flags after the remote acknowledged this entity
    fn mark_synced(
        &self,
        workspace: &WorkspaceId,
        kind: EntityKind,
        id: &EntityId,
        server_version: i64,
    ) -> Result<()>;

    /// Adopt the server-assigned canonical id after a create ack
    fn rewrite_id(
        &self,
        workspace: &WorkspaceId,
        kind: EntityKind,
        old_id: &EntityId,
        new_id: &EntityId,
    ) -> Result<()>;

    /// Mark a row deleted without dirtying it. Used when the remote
    /// reports the entity gone; there is nothing left to push.
    fn converge_deleted(&self, workspace: &WorkspaceId, kind: EntityKind, id: &EntityId)
        -> Result<()>;

    /// Remove a row outright. Only valid after a confirmed delete.
    fn hard_delete(&self, workspace: &WorkspaceId, kind: EntityKind, id: &EntityId) -> Result<()>;

    /// Drop all entities and sync metadata for a workspace
    fn clear_workspace(&self, workspace: &WorkspaceId) -> Result<()>;

    /// Read the workspace's sync metadata (zeroed row if absent)
    fn metadata(&self, workspace: &WorkspaceId) -> Result<SyncMetadata>;

    /// Advance `last_pull_at` to the server-reported batch time.
    /// Moves forward only; an older value is ignored.
    fn advance_pull_timestamp(&self, workspace: &WorkspaceId, server_time: i64) -> Result<()>;

    /// Record that a drain was attempted now
    fn record_drain_attempt(&self, workspace: &WorkspaceId, at: i64) -> Result<()>;
}

/// `SQLite` implementation of `EntityStore`
pub struct SqliteEntityStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteEntityStore<'a> {
    /// Create a new store with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse an entity from a database row
    fn parse_entity(row: &rusqlite::Row<'_>) -> rusqlite::Result<Entity> {
        let payload: String = row.get(3)?;
        Ok(Entity {
            workspace: WorkspaceId::new(row.get::<_, String>(0)?),
            kind: row
                .get::<_, String>(1)?
                .parse()
                .map_err(|_| rusqlite::Error::InvalidQuery)?,
            id: EntityId::new(row.get::<_, String>(2)?),
            payload: serde_json::from_str(&payload)
                .map_err(|_| rusqlite::Error::InvalidQuery)?,
            updated_at: row.get(4)?,
            deleted: row.get::<_, i32>(5)? != 0,
            locally_modified: row.get::<_, i32>(6)? != 0,
            locally_created: row.get::<_, i32>(7)? != 0,
            server_version: row.get(8)?,
        })
    }

    fn put_local(&self, entity: &Entity) -> Result<Entity> {
        let existing = self.get(&entity.workspace, entity.kind, &entity.id)?;
        let now = now_ms();

        // A row the remote never acknowledged stays locally_created
        // through further edits; an acknowledged one does not.
        let locally_created = existing
            .as_ref()
            .map_or(true, |stored| stored.locally_created);
        let server_version = existing.as_ref().and_then(|stored| stored.server_version);

        let stored = Entity {
            updated_at: now,
            locally_modified: true,
            locally_created,
            server_version,
            ..entity.clone()
        };
        self.upsert(&stored)?;
        Ok(stored)
    }

    fn put_remote(&self, entity: &Entity) -> Result<PutOutcome> {
        if let Some(stored) = self.get(&entity.workspace, entity.kind, &entity.id)? {
            // LWW guard: out-of-order pull replies and in-flight local
            // edits both lose only to a strictly newer remote write.
            if entity.updated_at <= stored.updated_at {
                tracing::debug!(
                    entity = %entity.id,
                    remote = entity.updated_at,
                    local = stored.updated_at,
                    "skipping stale remote write"
                );
                return Ok(PutOutcome::IgnoredStale);
            }
        }

        let stored = Entity {
            locally_modified: false,
            locally_created: false,
            server_version: Some(entity.updated_at),
            ..entity.clone()
        };
        self.upsert(&stored)?;
        Ok(PutOutcome::Applied(stored))
    }

    fn upsert(&self, entity: &Entity) -> Result<()> {
        self.conn.execute(
            "INSERT INTO entities
                 (workspace_id, kind, id, payload, updated_at, is_deleted,
                  locally_modified, locally_created, server_version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(workspace_id, kind, id) DO UPDATE SET
                 payload = excluded.payload,
                 updated_at = excluded.updated_at,
                 is_deleted = excluded.is_deleted,
                 locally_modified = excluded.locally_modified,
                 locally_created = excluded.locally_created,
                 server_version = excluded.server_version",
            params![
                entity.workspace.as_str(),
                entity.kind.as_str(),
                entity.id.as_str(),
                serde_json::to_string(&entity.payload)?,
                entity.updated_at,
                i32::from(entity.deleted),
                i32::from(entity.locally_modified),
                i32::from(entity.locally_created),
                entity.server_version,
            ],
        )?;
        Ok(())
    }
}

impl EntityStore for SqliteEntityStore<'_> {
    fn get(
        &self,
        workspace: &WorkspaceId,
        kind: EntityKind,
        id: &EntityId,
    ) -> Result<Option<Entity>> {
        self.conn
            .query_row(
                "SELECT workspace_id, kind, id, payload, updated_at, is_deleted,
                        locally_modified, locally_created, server_version
                 FROM entities
                 WHERE workspace_id = ?1 AND kind = ?2 AND id = ?3",
                params![workspace.as_str(), kind.as_str(), id.as_str()],
                Self::parse_entity,
            )
            .optional()
            .map_err(Error::from)
    }

    fn put(&self, entity: &Entity, origin: WriteOrigin) -> Result<PutOutcome> {
        match origin {
            WriteOrigin::Local => self.put_local(entity).map(PutOutcome::Applied),
            WriteOrigin::Remote => self.put_remote(entity),
        }
    }

    fn mark_deleted(
        &self,
        workspace: &WorkspaceId,
        kind: EntityKind,
        id: &EntityId,
    ) -> Result<Entity> {
        let now = now_ms();
        let rows = self.conn.execute(
            "UPDATE entities
             SET is_deleted = 1, updated_at = ?1, locally_modified = 1
             WHERE workspace_id = ?2 AND kind = ?3 AND id = ?4",
            params![now, workspace.as_str(), kind.as_str(), id.as_str()],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        self.get(workspace, kind, id)?
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    fn list(&self, workspace: &WorkspaceId, kind: Option<EntityKind>) -> Result<Vec<Entity>> {
        let mut stmt = self.conn.prepare(
            "SELECT workspace_id, kind, id, payload, updated_at, is_deleted,
                    locally_modified, locally_created, server_version
             FROM entities
             WHERE workspace_id = ?1
               AND is_deleted = 0
               AND (?2 IS NULL OR kind = ?2)
             ORDER BY updated_at DESC",
        )?;

        let entities = stmt
            .query_map(
                params![workspace.as_str(), kind.map(EntityKind::as_str)],
                Self::parse_entity,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entities)
    }

    fn list_dirty(&self, workspace: &WorkspaceId) -> Result<Vec<Entity>> {
        let mut stmt = self.conn.prepare(
            "SELECT workspace_id, kind, id, payload, updated_at, is_deleted,
                    locally_modified, locally_created, server_version
             FROM entities
             WHERE workspace_id = ?1
               AND (locally_modified = 1 OR locally_created = 1)
             ORDER BY updated_at ASC",
        )?;

        let entities = stmt
            .query_map(params![workspace.as_str()], Self::parse_entity)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entities)
    }

    fn list_all(&self, workspace: &WorkspaceId) -> Result<Vec<Entity>> {
        let mut stmt = self.conn.prepare(
            "SELECT workspace_id, kind, id, payload, updated_at, is_deleted,
                    locally_modified, locally_created, server_version
             FROM entities
             WHERE workspace_id = ?1
             ORDER BY kind ASC, id ASC",
        )?;

        let entities = stmt
            .query_map(params![workspace.as_str()], Self::parse_entity)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entities)
    }

    fn restore(&self, entity: &Entity) -> Result<()> {
        self.upsert(entity)
    }

    fn mark_synced(
        &self,
        workspace: &WorkspaceId,
        kind: EntityKind,
        id: &EntityId,
        server_version: i64,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE entities
             SET locally_modified = 0, locally_created = 0, server_version = ?1
             WHERE workspace_id = ?2 AND kind = ?3 AND id = ?4",
            params![
                server_version,
                workspace.as_str(),
                kind.as_str(),
                id.as_str()
            ],
        )?;
        Ok(())
    }

    fn rewrite_id(
        &self,
        workspace: &WorkspaceId,
        kind: EntityKind,
        old_id: &EntityId,
        new_id: &EntityId,
    ) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE entities SET id = ?1
             WHERE workspace_id = ?2 AND kind = ?3 AND id = ?4",
            params![
                new_id.as_str(),
                workspace.as_str(),
                kind.as_str(),
                old_id.as_str()
            ],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(old_id.to_string()));
        }
        tracing::debug!(old = %old_id, new = %new_id, "adopted canonical entity id");
        Ok(())
    }

    fn converge_deleted(
        &self,
        workspace: &WorkspaceId,
        kind: EntityKind,
        id: &EntityId,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE entities
             SET is_deleted = 1, locally_modified = 0, locally_created = 0
             WHERE workspace_id = ?1 AND kind = ?2 AND id = ?3",
            params![workspace.as_str(), kind.as_str(), id.as_str()],
        )?;
        Ok(())
    }

    fn hard_delete(&self, workspace: &WorkspaceId, kind: EntityKind, id: &EntityId) -> Result<()> {
        self.conn.execute(
            "DELETE FROM entities
             WHERE workspace_id = ?1 AND kind = ?2 AND id = ?3",
            params![workspace.as_str(), kind.as_str(), id.as_str()],
        )?;
        Ok(())
    }

    fn clear_workspace(&self, workspace: &WorkspaceId) -> Result<()> {
        self.conn.execute(
            "DELETE FROM entities WHERE workspace_id = ?1",
            params![workspace.as_str()],
        )?;
        self.conn.execute(
            "DELETE FROM sync_meta WHERE workspace_id = ?1",
            params![workspace.as_str()],
        )?;
        tracing::info!(workspace = %workspace, "cleared local workspace data");
        Ok(())
    }

    fn metadata(&self, workspace: &WorkspaceId) -> Result<SyncMetadata> {
        let row = self
            .conn
            .query_row(
                "SELECT last_pull_at, last_drain_attempt
                 FROM sync_meta WHERE workspace_id = ?1",
                params![workspace.as_str()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        let mut meta = SyncMetadata::new(workspace.clone());
        if let Some((last_pull_at, last_drain_attempt)) = row {
            meta.last_pull_at = last_pull_at;
            meta.last_drain_attempt = last_drain_attempt;
        }
        Ok(meta)
    }

    fn advance_pull_timestamp(&self, workspace: &WorkspaceId, server_time: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_meta (workspace_id, last_pull_at) VALUES (?1, ?2)
             ON CONFLICT(workspace_id) DO UPDATE SET
                 last_pull_at = MAX(last_pull_at, excluded.last_pull_at)",
            params![workspace.as_str(), server_time],
        )?;
        Ok(())
    }

    fn record_drain_attempt(&self, workspace: &WorkspaceId, at: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_meta (workspace_id, last_drain_attempt) VALUES (?1, ?2)
             ON CONFLICT(workspace_id) DO UPDATE SET
                 last_drain_attempt = excluded.last_drain_attempt",
            params![workspace.as_str(), at],
        )?;
        Ok(())
    }
}
