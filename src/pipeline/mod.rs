//! Run configuration and orchestration.
//!
//! - **RunConfig**: layered configuration (defaults, YAML, environment, flags)
//! - **Orchestrator**: load, sample, resume-filter, dispatch, summarize
//!
//! # Example
//!
//! ```rust,ignore
//! use trajforge::pipeline::{Orchestrator, RunConfig};
//!
//! let config = RunConfig::new()
//!     .with_dataset_path("prompts.jsonl")
//!     .with_model("openai/gpt-4o-mini")
//!     .with_workers(8)
//!     .with_resume(true);
//!
//! let summary = Orchestrator::new(config).run().await?;
//! println!("completed={} failed={}", summary.completed, summary.failed);
//! ```

pub mod config;
pub mod orchestrator;

pub use config::{DistributionSource, RunConfig, DEFAULT_CHECKPOINT_PATH};
pub use orchestrator::{Orchestrator, PipelineError, PreparedRun};
