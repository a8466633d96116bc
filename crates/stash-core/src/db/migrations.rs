//! Database migrations

use crate::error::Result;
use rusqlite::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 1;

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get::<_, i32>(0).map(|v| v != 0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    Ok(version)
}

/// Migration to version 1: Initial schema
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "BEGIN;

        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        -- Syncable entities, one row per (workspace, kind, id).
        -- Rows are only soft-deleted until the remote confirms:
        -- a queued delete must survive process restarts.
        CREATE TABLE IF NOT EXISTS entities (
            workspace_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            id TEXT NOT NULL,
            payload TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            locally_modified INTEGER NOT NULL DEFAULT 0,
            locally_created INTEGER NOT NULL DEFAULT 0,
            server_version INTEGER,
            PRIMARY KEY (workspace_id, kind, id)
        );
        CREATE INDEX IF NOT EXISTS idx_entities_dirty
            ON entities(workspace_id, locally_modified, locally_created);
        CREATE INDEX IF NOT EXISTS idx_entities_updated
            ON entities(workspace_id, updated_at DESC);

        -- Ordered durable log of pending mutations. The rowid is the
        -- monotonic sequence that defines FIFO order per workspace.
        CREATE TABLE IF NOT EXISTS queue_ops (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            workspace_id TEXT NOT NULL,
            entity_kind TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            op TEXT NOT NULL,
            payload TEXT,
            enqueued_at INTEGER NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            next_attempt_at INTEGER NOT NULL DEFAULT 0,
            dispatched_at INTEGER,
            last_error TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_queue_ops_drain
            ON queue_ops(workspace_id, status, next_attempt_at, id);
        CREATE INDEX IF NOT EXISTS idx_queue_ops_entity
            ON queue_ops(workspace_id, entity_kind, entity_id);

        -- One metadata row per workspace
        CREATE TABLE IF NOT EXISTS sync_meta (
            workspace_id TEXT PRIMARY KEY,
            last_pull_at INTEGER NOT NULL DEFAULT 0,
            last_drain_attempt INTEGER NOT NULL DEFAULT 0
        );

        INSERT INTO schema_version (version) VALUES (1);

        COMMIT;",
    )?;

    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_migrations() {
        let conn = setup();
        run(&conn).unwrap();

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_idempotent() {
        let conn = setup();
        run(&conn).unwrap();
        run(&conn).unwrap(); // Should not fail

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migration_creates_queue_table() {
        let conn = setup();
        run(&conn).unwrap();

        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM sqlite_master
                    WHERE type = 'table' AND name = 'queue_ops'
                )",
                [],
                |row| row.get::<_, i32>(0).map(|v| v != 0),
            )
            .unwrap();

        assert!(exists);
    }
}
