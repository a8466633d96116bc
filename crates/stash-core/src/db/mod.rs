//! Database layer: connection management, migrations, and the
//! workspace-scoped entity store and operation queue

mod connection;
mod migrations;
mod queue;
mod store;

pub use connection::Database;
pub use queue::{EnqueueOutcome, NewOperation, OperationQueue, SqliteOperationQueue};
pub use store::{EntityStore, PutOutcome, SqliteEntityStore};
