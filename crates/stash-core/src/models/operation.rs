//! Queued sync operation model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::entity::{EntityId, EntityKind, WorkspaceId};

/// Kind of a pending mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Create,
    Update,
    Delete,
}

impl OpKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(format!("unknown op kind: {other}")),
        }
    }
}

/// Delivery state of a queued operation.
///
/// Success removes the row, so there is no stored terminal-success
/// state. `Parked` is terminal until a manual retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpStatus {
    /// Awaiting delivery (possibly waiting out a backoff delay)
    Pending,
    /// Currently being transmitted
    Active,
    /// Permanent failure; skipped by the drain loop, kept for
    /// inspection and manual retry
    Parked,
}

impl OpStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Parked => "parked",
        }
    }
}

impl fmt::Display for OpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "parked" => Ok(Self::Parked),
            other => Err(format!("unknown op status: {other}")),
        }
    }
}

/// One pending mutation awaiting delivery to the remote service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOperation {
    /// Monotonic sequence number (SQLite rowid)
    pub id: i64,
    /// Workspace the operation belongs to
    pub workspace: WorkspaceId,
    /// Kind of the target entity
    pub entity_kind: EntityKind,
    /// Target entity id
    pub entity_id: EntityId,
    /// Mutation kind
    pub op: OpKind,
    /// Entity snapshot at enqueue time (absent for deletes)
    pub payload: Option<serde_json::Value>,
    /// When this operation was first queued (Unix ms)
    pub enqueued_at: i64,
    /// Number of transient failures so far
    pub retry_count: u32,
    /// Delivery state
    pub status: OpStatus,
    /// Earliest time the next attempt may run (Unix ms, backoff)
    pub next_attempt_at: i64,
    /// Last failure detail, if any
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_kind_round_trip() {
        for op in [OpKind::Create, OpKind::Update, OpKind::Delete] {
            assert_eq!(op.as_str().parse::<OpKind>().unwrap(), op);
        }
    }

    #[test]
    fn test_op_status_round_trip() {
        for status in [OpStatus::Pending, OpStatus::Active, OpStatus::Parked] {
            assert_eq!(status.as_str().parse::<OpStatus>().unwrap(), status);
        }
        assert!("failed".parse::<OpStatus>().is_err());
    }
}
