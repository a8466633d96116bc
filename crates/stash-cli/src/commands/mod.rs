pub mod add;
pub mod common;
pub mod edit;
pub mod list;
pub mod snapshot;
pub mod sync;
