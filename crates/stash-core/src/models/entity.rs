//! Syncable entity model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of the workspace scoping all entities and sync state.
///
/// Sync never crosses workspace boundaries; every store, queue, and
/// engine operation is keyed by this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkspaceId(String);

impl WorkspaceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkspaceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A unique identifier for an entity.
///
/// Client-generated ids use UUID v7 (time-sortable); the server may
/// assign a different canonical id on create, in which case the local
/// row is rewritten to the canonical one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(String);

impl EntityId {
    /// Generate a new client-side id using UUID v7
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::generate()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Kind of a syncable domain object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// A bookmark/note card
    Card,
    /// A collection of cards
    Collection,
    /// A calendar event
    Event,
}

impl EntityKind {
    /// Stable lowercase wire/storage name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Card => "card",
            Self::Collection => "collection",
            Self::Event => "event",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "card" => Ok(Self::Card),
            "collection" => Ok(Self::Collection),
            "event" => Ok(Self::Event),
            other => Err(format!("unknown entity kind: {other}")),
        }
    }
}

/// Where a store write originated; controls flag/timestamp handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    /// A local user mutation: bumps `updated_at`, sets dirty flags
    Local,
    /// A pull from the remote: overwrites only if strictly newer,
    /// clears dirty flags
    Remote,
}

/// A syncable entity in the local store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Unique identifier (client-generated until the server confirms)
    pub id: EntityId,
    /// Workspace this entity belongs to
    pub workspace: WorkspaceId,
    /// Kind of domain object
    pub kind: EntityKind,
    /// Opaque domain fields (title, url, notes, ...)
    pub payload: serde_json::Value,
    /// Last-write-wins timestamp (Unix ms)
    pub updated_at: i64,
    /// Soft delete flag; rows survive until the remote confirms
    pub deleted: bool,
    /// An unsynced local change exists
    pub locally_modified: bool,
    /// Not yet acknowledged by the remote
    pub locally_created: bool,
    /// Last known remote `updated_at`, for conflict comparison
    pub server_version: Option<i64>,
}

impl Entity {
    /// Create a new locally-authored entity with the given payload
    #[must_use]
    pub fn new(workspace: WorkspaceId, kind: EntityKind, payload: serde_json::Value) -> Self {
        Self {
            id: EntityId::generate(),
            workspace,
            kind,
            payload,
            updated_at: now_ms(),
            deleted: false,
            locally_modified: true,
            locally_created: true,
            server_version: None,
        }
    }

    /// Whether this entity has unsynced local state
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.locally_modified || self.locally_created
    }
}

/// Current Unix timestamp in milliseconds
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
