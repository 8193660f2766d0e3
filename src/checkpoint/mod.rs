//! Durable record of finished trajectories.
//!
//! The checkpoint log is the source of truth for resume: a task with a
//! record is never dispatched again.

pub mod lock;
pub mod record;
pub mod store;

pub use lock::RunLock;
pub use record::CheckpointRecord;
pub use store::{AppendOutcome, CheckpointStore, JsonlCheckpointStore, MemoryCheckpointStore};
