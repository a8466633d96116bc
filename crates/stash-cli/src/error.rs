//! CLI error type

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] stash_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("No title provided")]
    EmptyTitle,
    #[error("Item ID cannot be empty")]
    EmptyItemId,
    #[error("Edited payload must be a JSON object")]
    InvalidEditedPayload,
    #[error("Item not found for id/prefix: {0}")]
    ItemNotFound(String),
    #[error("{0}")]
    AmbiguousItemId(String),
    #[error("Editor command failed: {0}")]
    EditorFailed(String),
    #[error(
        "Sync is not configured. Set STASH_SERVER_URL (and STASH_AUTH_TOKEN) to enable `stash sync`."
    )]
    SyncNotConfigured,
    #[error("Refusing to clear local data without --yes")]
    ClearNotConfirmed,
}
