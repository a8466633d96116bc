//! `stash edit` and `stash delete`

use std::path::Path;

use crate::commands::common::{
    capture_editor_input_with_initial, open_service, resolve_item, resolve_workspace,
};
use crate::error::CliError;

pub fn run_edit(id: &str, db_path: &Path, workspace: Option<String>) -> Result<(), CliError> {
    let service = open_service(db_path, resolve_workspace(workspace))?;
    let entity = resolve_item(&service, id)?;

    let initial = serde_json::to_string_pretty(&entity.payload)?;
    let Some(edited) = capture_editor_input_with_initial(&initial)? else {
        return Err(CliError::InvalidEditedPayload);
    };

    let payload: serde_json::Value = serde_json::from_str(&edited)?;
    if !payload.is_object() {
        return Err(CliError::InvalidEditedPayload);
    }
    if payload == entity.payload {
        println!("{}", entity.id);
        return Ok(());
    }

    let updated = service.update(entity.kind, &entity.id, payload)?;
    println!("{}", updated.id);
    Ok(())
}

pub fn run_delete(id: &str, db_path: &Path, workspace: Option<String>) -> Result<(), CliError> {
    let service = open_service(db_path, resolve_workspace(workspace))?;
    let entity = resolve_item(&service, id)?;
    service.delete(entity.kind, &entity.id)?;
    println!("{}", entity.id);
    Ok(())
}
