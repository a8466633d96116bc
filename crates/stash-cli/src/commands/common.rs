//! Shared plumbing for CLI commands

use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use stash_core::coordinator::InProcessBus;
use stash_core::db::Database;
use stash_core::models::Entity;
use stash_core::sync::remote::{ChangeBatch, RemoteApi, RemoteEntity, RemoteError};
use stash_core::sync::HttpRemote;
use stash_core::{EntityKind, SyncService, WorkspaceId};

use crate::error::CliError;

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("STASH_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stash")
        .join("stash.db")
}

pub fn resolve_workspace(cli_workspace: Option<String>) -> WorkspaceId {
    let name = cli_workspace
        .or_else(|| env::var("STASH_WORKSPACE").ok())
        .unwrap_or_else(|| "default".to_string());
    WorkspaceId::new(name)
}

/// Remote endpoint from the environment, when sync is configured
pub fn remote_from_env() -> Result<Option<Arc<HttpRemote>>, CliError> {
    let Ok(url) = env::var("STASH_SERVER_URL") else {
        return Ok(None);
    };
    if url.is_empty() {
        return Ok(None);
    }
    let remote = HttpRemote::new(url).map_err(|error| {
        CliError::Io(io::Error::new(io::ErrorKind::InvalidInput, error.to_string()))
    })?;
    if let Ok(token) = env::var("STASH_AUTH_TOKEN") {
        if !token.is_empty() {
            remote.set_token(Some(token));
        }
    }
    tracing::info!("Remote sync configured via STASH_SERVER_URL");
    Ok(Some(Arc::new(remote)))
}

/// Placeholder remote for local-only invocations; commands that never
/// drain the queue never call it
pub struct UnconfiguredRemote;

#[async_trait]
impl RemoteApi for UnconfiguredRemote {
    async fn changes_since(
        &self,
        _workspace: &WorkspaceId,
        _since: i64,
    ) -> Result<ChangeBatch, RemoteError> {
        Err(RemoteError::Transient("sync is not configured".to_string()))
    }

    async fn probe(&self, _workspace: &WorkspaceId, _since: i64) -> Result<bool, RemoteError> {
        Err(RemoteError::Transient("sync is not configured".to_string()))
    }

    async fn create(
        &self,
        _workspace: &WorkspaceId,
        _entity: &RemoteEntity,
        _idempotency_key: &str,
    ) -> Result<RemoteEntity, RemoteError> {
        Err(RemoteError::Transient("sync is not configured".to_string()))
    }

    async fn update(
        &self,
        _workspace: &WorkspaceId,
        _entity: &RemoteEntity,
    ) -> Result<RemoteEntity, RemoteError> {
        Err(RemoteError::Transient("sync is not configured".to_string()))
    }

    async fn delete(
        &self,
        _workspace: &WorkspaceId,
        _kind: EntityKind,
        _id: &str,
    ) -> Result<(), RemoteError> {
        Err(RemoteError::Transient("sync is not configured".to_string()))
    }
}

/// Open the service for a local-only command; a configured remote is
/// used when present but not required
pub fn open_service(db_path: &Path, workspace: WorkspaceId) -> Result<SyncService, CliError> {
    let remote = remote_from_env()?
        .map_or_else(|| Arc::new(UnconfiguredRemote) as Arc<dyn RemoteApi>, |remote| remote as Arc<dyn RemoteApi>);
    open_service_with(db_path, workspace, remote)
}

/// Open the service for a sync command; fails without a configured
/// remote
pub fn open_sync_service(db_path: &Path, workspace: WorkspaceId) -> Result<SyncService, CliError> {
    let remote = remote_from_env()?.ok_or(CliError::SyncNotConfigured)?;
    open_service_with(db_path, workspace, remote as Arc<dyn RemoteApi>)
}

fn open_service_with(
    db_path: &Path,
    workspace: WorkspaceId,
    remote: Arc<dyn RemoteApi>,
) -> Result<SyncService, CliError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    tracing::debug!("Opening database at {}", db_path.display());
    let db = Arc::new(Mutex::new(Database::open(db_path)?));
    Ok(SyncService::new(
        db,
        remote,
        Arc::new(InProcessBus::new()),
        workspace,
    ))
}

/// Resolve an item by full id or unique id prefix across all kinds
pub fn resolve_item(service: &SyncService, query: &str) -> Result<Entity, CliError> {
    let trimmed = normalize_item_identifier(query)?;

    let mut matches: Vec<Entity> = service
        .list(None)
        .map_err(CliError::Core)?
        .into_iter()
        .filter(|entity| entity.id.as_str().starts_with(&trimmed))
        .collect();

    match matches.len() {
        0 => Err(CliError::ItemNotFound(trimmed)),
        1 => Ok(matches.remove(0)),
        _ => {
            let options = matches
                .iter()
                .take(3)
                .map(|entity| short_id(entity.id.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            Err(CliError::AmbiguousItemId(format!(
                "ID prefix '{trimmed}' is ambiguous; matches: {options}"
            )))
        }
    }
}

pub fn normalize_item_identifier(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyItemId)
    } else {
        Ok(trimmed.to_string())
    }
}

pub fn normalize_title(title: &str) -> Option<String> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.split_whitespace().collect::<Vec<_>>().join(" "))
    }
}

#[must_use]
pub fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

/// One listing row: short id, kind, title preview, relative age
#[must_use]
pub fn format_entity_line(entity: &Entity, now_ms: i64) -> String {
    let short = short_id(entity.id.as_str());
    let title = entity
        .payload
        .get("title")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("(untitled)");
    let preview = preview_text(title, 40);
    let age = format_relative_time(entity.updated_at, now_ms);
    format!("{short:<8}  {:<10}  {preview:<40}  {age}", entity.kind)
}

#[must_use]
pub fn preview_text(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = collapsed.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

#[must_use]
pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}

/// Open `$EDITOR` with the given text; `None` when the result is blank
pub fn capture_editor_input_with_initial(initial_content: &str) -> Result<Option<String>, CliError> {
    let editor = preferred_editor();
    let temp_file = create_temp_edit_file_path();
    std::fs::write(&temp_file, initial_content)?;

    let launch_result = launch_editor(&editor, &temp_file);
    let edited = std::fs::read_to_string(&temp_file)?;
    let _ = std::fs::remove_file(&temp_file);

    launch_result?;
    let trimmed = edited.trim();
    if trimmed.is_empty() {
        Ok(None)
    } else {
        Ok(Some(trimmed.to_string()))
    }
}

fn launch_editor(editor: &str, file_path: &Path) -> Result<(), CliError> {
    match Command::new(editor).arg(file_path).status() {
        Ok(status) => {
            if status.success() {
                Ok(())
            } else {
                Err(CliError::EditorFailed(format!(
                    "`{editor}` exited with status {status}"
                )))
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            // Fallback for editor commands with args, e.g. "code --wait"
            let mut parts = editor.split_whitespace();
            let Some(program) = parts.next() else {
                return Err(CliError::EditorFailed("empty EDITOR command".into()));
            };

            let mut command = Command::new(program);
            command.args(parts).arg(file_path);

            let status = command.status()?;
            if status.success() {
                Ok(())
            } else {
                Err(CliError::EditorFailed(format!(
                    "`{editor}` exited with status {status}"
                )))
            }
        }
        Err(err) => Err(CliError::Io(err)),
    }
}

fn preferred_editor() -> String {
    env::var("VISUAL")
        .or_else(|_| env::var("EDITOR"))
        .unwrap_or_else(|_| default_editor().to_string())
}

pub const fn default_editor() -> &'static str {
    if cfg!(windows) {
        "notepad"
    } else {
        "vi"
    }
}

fn create_temp_edit_file_path() -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_nanos());
    env::temp_dir().join(format!("stash-edit-{}-{now}.json", std::process::id()))
}
