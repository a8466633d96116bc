//! `stash list` and `stash show`

use std::path::Path;

use serde::Serialize;
use stash_core::models::{now_ms, EntitySyncState};
use stash_core::EntityKind;

use crate::commands::common::{format_entity_line, open_service, resolve_item, resolve_workspace};
use crate::error::CliError;

#[derive(Debug, Serialize)]
struct ListItem {
    id: String,
    kind: String,
    payload: serde_json::Value,
    updated_at: i64,
    sync_state: EntitySyncState,
}

pub fn run_list(
    limit: usize,
    kind: Option<EntityKind>,
    as_json: bool,
    db_path: &Path,
    workspace: Option<String>,
) -> Result<(), CliError> {
    let service = open_service(db_path, resolve_workspace(workspace))?;
    let entities = service.list(kind)?;
    let entities = &entities[..entities.len().min(limit)];

    if as_json {
        let items = entities
            .iter()
            .map(|entity| {
                Ok(ListItem {
                    id: entity.id.to_string(),
                    kind: entity.kind.to_string(),
                    payload: entity.payload.clone(),
                    updated_at: entity.updated_at,
                    sync_state: service.entity_state(entity.kind, &entity.id)?,
                })
            })
            .collect::<Result<Vec<_>, stash_core::Error>>()?;
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else {
        let now = now_ms();
        for entity in entities {
            println!("{}", format_entity_line(entity, now));
        }
    }
    Ok(())
}

pub fn run_show(id: &str, db_path: &Path, workspace: Option<String>) -> Result<(), CliError> {
    let service = open_service(db_path, resolve_workspace(workspace))?;
    let entity = resolve_item(&service, id)?;
    let state = service.entity_state(entity.kind, &entity.id)?;

    let item = ListItem {
        id: entity.id.to_string(),
        kind: entity.kind.to_string(),
        payload: entity.payload,
        updated_at: entity.updated_at,
        sync_state: state,
    };
    println!("{}", serde_json::to_string_pretty(&item)?);
    Ok(())
}
