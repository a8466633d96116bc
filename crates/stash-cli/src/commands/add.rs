//! `stash add`

use std::path::Path;

use serde_json::json;
use stash_core::EntityKind;

use crate::commands::common::{normalize_title, open_service, resolve_workspace};
use crate::error::CliError;

pub fn run_add(
    title_parts: &[String],
    url: Option<&str>,
    notes: Option<&str>,
    kind: EntityKind,
    db_path: &Path,
    workspace: Option<String>,
) -> Result<(), CliError> {
    let title = normalize_title(&title_parts.join(" ")).ok_or(CliError::EmptyTitle)?;

    let mut payload = json!({ "title": title });
    if let Some(url) = url {
        payload["url"] = json!(url);
    }
    if let Some(notes) = notes {
        payload["notes"] = json!(notes);
    }

    let service = open_service(db_path, resolve_workspace(workspace))?;
    let entity = service.create(kind, payload)?;
    println!("{}", entity.id);
    Ok(())
}
