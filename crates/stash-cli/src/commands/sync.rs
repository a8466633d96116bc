//! `stash sync` subcommands

use std::path::Path;

use stash_core::sync::{DrainOutcome, FullSyncOutcome, PullOutcome};

use crate::commands::common::{open_service, open_sync_service, resolve_workspace};
use crate::error::CliError;

pub async fn run_sync_now(db_path: &Path, workspace: Option<String>) -> Result<(), CliError> {
    let service = open_sync_service(db_path, resolve_workspace(workspace))?;
    // A one-shot process is alone on its bus, so the claim is granted
    service.claim_leadership()?;

    let outcome = service.sync_now().await?;
    print_outcome(&outcome);

    let status = service.status()?;
    if status.parked_operations > 0 {
        println!(
            "{} operation(s) are parked; run `stash sync retry` to try them again",
            status.parked_operations
        );
    }
    Ok(())
}

pub fn run_sync_status(
    as_json: bool,
    db_path: &Path,
    workspace: Option<String>,
) -> Result<(), CliError> {
    let service = open_service(db_path, resolve_workspace(workspace))?;
    let status = service.status()?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("workspace:      {}", status.workspace);
    println!("phase:          {:?}", status.phase);
    println!("pending ops:    {}", status.pending_operations);
    println!("parked ops:     {}", status.parked_operations);
    println!("dirty entities: {}", status.dirty_entities);
    println!("sync enabled:   {}", status.sync_enabled);
    println!("auth required:  {}", status.auth_required);
    println!("last pull:      {}", format_timestamp(status.last_pull_at));
    println!(
        "last drain try: {}",
        format_timestamp(status.last_drain_attempt)
    );
    Ok(())
}

pub async fn run_sync_retry(db_path: &Path, workspace: Option<String>) -> Result<(), CliError> {
    let service = open_sync_service(db_path, resolve_workspace(workspace))?;
    service.claim_leadership()?;

    let retried = service.retry_parked()?;
    println!("moved {retried} parked operation(s) back to pending");

    let outcome = service.sync_now().await?;
    print_outcome(&outcome);
    Ok(())
}

pub async fn run_sync_push(db_path: &Path, workspace: Option<String>) -> Result<(), CliError> {
    let service = open_sync_service(db_path, resolve_workspace(workspace))?;
    service.claim_leadership()?;

    let queued = service.force_push()?;
    println!("queued {queued} item(s) for delivery");

    let outcome = service.sync_now().await?;
    print_outcome(&outcome);
    Ok(())
}

fn print_outcome(outcome: &FullSyncOutcome) {
    match &outcome.pull {
        PullOutcome::Applied { applied, ignored } => {
            println!("pulled {applied} change(s), skipped {ignored} stale");
        }
        PullOutcome::Offline => println!("pull skipped: offline"),
        PullOutcome::AuthRequired => println!("pull skipped: authentication required"),
        PullOutcome::Failed(reason) => println!("pull failed: {reason}"),
    }
    match &outcome.drain {
        DrainOutcome::Completed(stats) => {
            println!(
                "delivered {} operation(s), deferred {}, parked {}",
                stats.delivered, stats.deferred, stats.parked
            );
        }
        DrainOutcome::AlreadyRunning => println!("drain skipped: already in progress"),
        DrainOutcome::Offline => println!("drain skipped: offline"),
        DrainOutcome::AuthRequired(stats) => {
            println!(
                "drain paused: authentication required ({} delivered first)",
                stats.delivered
            );
        }
        DrainOutcome::Cancelled(stats) => {
            println!("drain cancelled ({} delivered first)", stats.delivered);
        }
    }
}

fn format_timestamp(timestamp_ms: i64) -> String {
    if timestamp_ms == 0 {
        return "never".to_string();
    }
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || "invalid".to_string(),
        |when| when.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}
