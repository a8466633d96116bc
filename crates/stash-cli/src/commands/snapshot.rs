//! `stash export`, `stash import`, `stash clear`

use std::path::Path;

use crate::commands::common::{open_service, resolve_workspace};
use crate::error::CliError;

pub fn run_export(
    output: Option<&Path>,
    db_path: &Path,
    workspace: Option<String>,
) -> Result<(), CliError> {
    let service = open_service(db_path, resolve_workspace(workspace))?;

    if let Some(path) = output {
        let snapshot = service.export_to(path)?;
        println!(
            "wrote {} entities and {} queued operation(s) to {}",
            snapshot.entities.len(),
            snapshot.operations.len(),
            path.display()
        );
    } else {
        // No path: print the snapshot itself
        let dir = std::env::temp_dir();
        let tmp = dir.join(format!("stash-export-{}.json", std::process::id()));
        service.export_to(&tmp)?;
        let raw = std::fs::read_to_string(&tmp)?;
        let _ = std::fs::remove_file(&tmp);
        println!("{raw}");
    }
    Ok(())
}

pub fn run_import(path: &Path, db_path: &Path, workspace: Option<String>) -> Result<(), CliError> {
    let service = open_service(db_path, resolve_workspace(workspace))?;
    let stats = service.import_from(path)?;
    println!(
        "imported {} entities and {} queued operation(s)",
        stats.entities, stats.operations
    );
    Ok(())
}

pub fn run_clear(yes: bool, db_path: &Path, workspace: Option<String>) -> Result<(), CliError> {
    if !yes {
        return Err(CliError::ClearNotConfirmed);
    }
    let service = open_service(db_path, resolve_workspace(workspace))?;
    service.clear_local_data()?;
    println!("cleared local data for workspace {}", service.workspace());
    Ok(())
}
