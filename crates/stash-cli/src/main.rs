//! Stash CLI - keep bookmarks and notes locally, sync when connected
//!
//! Every mutation commits to the local database immediately; `stash
//! sync` reconciles with the configured remote service.

mod cli;
mod commands;
mod error;

use clap::Parser;

use crate::cli::{Cli, Commands, SyncAction};
use crate::commands::common::resolve_db_path;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("stash=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);
    let workspace = cli.workspace;

    match cli.command {
        Commands::Add {
            title,
            url,
            notes,
            kind,
        } => commands::add::run_add(
            &title,
            url.as_deref(),
            notes.as_deref(),
            kind.into(),
            &db_path,
            workspace,
        )?,
        Commands::List { limit, kind, json } => {
            commands::list::run_list(limit, kind.map(Into::into), json, &db_path, workspace)?;
        }
        Commands::Show { id } => commands::list::run_show(&id, &db_path, workspace)?,
        Commands::Edit { id } => commands::edit::run_edit(&id, &db_path, workspace)?,
        Commands::Delete { id } => commands::edit::run_delete(&id, &db_path, workspace)?,
        Commands::Sync { action } => match action.unwrap_or(SyncAction::Now) {
            SyncAction::Now => commands::sync::run_sync_now(&db_path, workspace).await?,
            SyncAction::Status { json } => {
                commands::sync::run_sync_status(json, &db_path, workspace)?;
            }
            SyncAction::Retry => commands::sync::run_sync_retry(&db_path, workspace).await?,
            SyncAction::Push => commands::sync::run_sync_push(&db_path, workspace).await?,
        },
        Commands::Export { output } => {
            commands::snapshot::run_export(output.as_deref(), &db_path, workspace)?;
        }
        Commands::Import { path } => {
            commands::snapshot::run_import(&path, &db_path, workspace)?;
        }
        Commands::Clear { yes } => commands::snapshot::run_clear(yes, &db_path, workspace)?,
    }

    Ok(())
}
