//! Sync engine, remote API client, and retry policy

pub mod backoff;
pub mod engine;
pub mod remote;

pub use backoff::BackoffPolicy;
pub use engine::{
    DrainOutcome, DrainStats, FullSyncOutcome, PullOutcome, SharedDatabase, SyncEngine, SyncEvent,
};
pub use remote::{ChangeBatch, HttpRemote, RemoteApi, RemoteEntity, RemoteError};
