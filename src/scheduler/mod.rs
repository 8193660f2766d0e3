//! Bounded-concurrency execution of the sampled work queue.
//!
//! - **WorkerPool**: fixed set of workers draining a shared queue
//! - **ShutdownSignal**: run-wide cancellation handle
//! - **ProgressMonitor**: periodic progress logging
//! - **RunSummary**: end-of-run accounting
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │  SamplePlan  │
//!                      └──────┬───────┘
//!                             │ resume filter (checkpoint store)
//!                      ┌──────▼───────┐
//!                      │ Shared queue │
//!                      └──────┬───────┘
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         └───────────────────┼───────────────────┘
//!                      ┌──────▼───────┐
//!                      │  Checkpoint  │
//!                      │     log      │
//!                      └──────────────┘
//! ```
//!
//! # Reliability Features
//!
//! - **Durable before free**: a worker takes its next task only after the
//!   previous trajectory's record has been synced to disk
//! - **Graceful shutdown**: workers finish their current external call,
//!   drop the unfinished trajectory and stop
//! - **Crash recovery**: unfinished tasks have no record and are dispatched
//!   again on resume

pub mod progress;
pub mod shutdown;
pub mod summary;
pub mod worker_pool;

pub use progress::{ProgressCounters, ProgressMonitor, ProgressSnapshot};
pub use shutdown::ShutdownSignal;
pub use summary::{CheckpointStats, RunSummary};
pub use worker_pool::{PoolError, WorkerPool, WorkerPoolConfig};
