//! trajforge: multi-turn tool-calling trajectory generator.
//!
//! This library turns a dataset of prompts and a weighted category
//! distribution into concurrently executed, checkpointed agent rollouts.

pub mod checkpoint;
pub mod cli;
pub mod dataset;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod scheduler;
pub mod tools;
pub mod trajectory;

// Re-export commonly used error types
pub use error::{
    CheckpointError, CompletionError, CompletionErrorKind, ConfigError, DatasetError, ToolError,
    TrajectoryError,
};
