//! Multi-turn trajectory generation.
//!
//! A trajectory is produced by alternating model turns and tool turns until
//! the model answers in plain text, the turn budget runs out, or an
//! unrecoverable error occurs.
//!
//! # Overview
//!
//! - **types**: the recorded data (turns, tool calls, status, usage)
//! - **machine**: the pure protocol state machine
//! - **retry**: backoff policy for transient completion failures
//! - **driver**: async runner executing the machine's effects
//!
//! # Usage
//!
//! ```rust,ignore
//! use trajforge::trajectory::{RolloutSettings, TrajectoryDriver};
//!
//! let driver = TrajectoryDriver::new(client, tools, budget, RolloutSettings::default());
//! let outcome = driver.run(&task, "unweighted", &[], &shutdown).await;
//! if outcome.is_finished() {
//!     store.append(CheckpointRecord::from_trajectory(&task, outcome.into_trajectory())?).await?;
//! }
//! ```

pub mod driver;
pub mod machine;
pub mod retry;
pub mod types;

pub use driver::{RolloutOutcome, RolloutSettings, TrajectoryDriver, DEFAULT_COMPLETION_TIMEOUT_SECS};
pub use machine::{transition, Effect, Event, Limits, MachineState, ModelReply, Transition};
pub use retry::RetryPolicy;
pub use types::{TokenUsage, ToolCall, ToolResult, Trajectory, TrajectoryStatus, Turn};
