//! Command-line argument definitions

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "stash")]
#[command(about = "Keep bookmarks and notes locally, sync in the background")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to the local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Workspace to operate on
    #[arg(long, global = true, value_name = "NAME")]
    pub workspace: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Add a card (bookmark/note)
    #[command(alias = "new")]
    Add {
        /// Title of the card
        title: Vec<String>,
        /// URL to attach
        #[arg(long)]
        url: Option<String>,
        /// Free-form notes
        #[arg(long)]
        notes: Option<String>,
        /// What kind of item to create
        #[arg(long, value_enum, default_value_t = KindArg::Card)]
        kind: KindArg,
    },
    /// List items
    List {
        /// Number of items to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Only this kind
        #[arg(long, value_enum)]
        kind: Option<KindArg>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one item in full
    Show {
        /// Item ID or unique ID prefix
        id: String,
    },
    /// Edit an item's fields in $EDITOR
    Edit {
        /// Item ID or unique ID prefix
        id: String,
    },
    /// Delete an item
    Delete {
        /// Item ID or unique ID prefix
        id: String,
    },
    /// Synchronize with the remote service
    Sync {
        #[command(subcommand)]
        action: Option<SyncAction>,
    },
    /// Export the workspace to a snapshot file
    Export {
        /// Output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Import a snapshot file, replacing local data
    Import {
        /// Snapshot file to import
        path: PathBuf,
    },
    /// Drop all local data for the workspace
    Clear {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
pub enum SyncAction {
    /// Pull and drain right now (default)
    Now,
    /// Show sync status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Move parked operations back into the queue and sync
    Retry,
    /// Re-queue every local item for delivery (recovery after remote
    /// data loss)
    Push,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum KindArg {
    Card,
    Collection,
    Event,
}

impl From<KindArg> for stash_core::EntityKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Card => Self::Card,
            KindArg::Collection => Self::Collection,
            KindArg::Event => Self::Event,
        }
    }
}
