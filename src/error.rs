//! Error types for trajforge operations.
//!
//! Defines the error taxonomy shared by every subsystem:
//! - Run configuration (fatal at startup, aborts before any dispatch)
//! - Dataset loading
//! - Completion endpoint failures (transient vs. fatal)
//! - Tool execution failures (surfaced to the model, never escalated)
//! - Terminal trajectory errors (contained to one task)
//! - Checkpoint persistence

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors in the run configuration. Any of these aborts the whole run.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing configuration value: {0}")]
    Missing(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("Category '{category}' has no weight and no fallback bucket is configured")]
    UnweightedCategory { category: String },

    #[error("Unknown toolset '{toolset}' referenced by category '{category}'")]
    UnknownToolset { category: String, toolset: String },

    #[error("Checkpoint log {path} already holds {records} records; pass --resume or choose another path")]
    CheckpointExists { path: String, records: usize },

    #[error("Checkpoint log is locked by running process {pid} ({path})")]
    Locked { path: String, pid: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors that can occur while loading the input dataset.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Dataset file not found: {0}")]
    NotFound(String),

    #[error("Malformed record on line {line}: {message}")]
    MalformedRecord { line: usize, message: String },

    #[error("Record on line {line} has an empty prompt")]
    EmptyPrompt { line: usize },

    #[error("Duplicate task id '{0}'")]
    DuplicateId(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure category reported by the completion endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionErrorKind {
    /// HTTP 429 or an equivalent provider signal.
    RateLimited,
    /// The per-call timeout elapsed.
    Timeout,
    /// Connection failures and 5xx responses.
    Transport,
    /// The endpoint answered with something that is not a valid assistant turn.
    InvalidResponse,
    /// Authentication, bad request and anything else that will not heal on retry.
    Fatal,
}

impl CompletionErrorKind {
    /// Whether a failure of this kind is retried with backoff.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            CompletionErrorKind::RateLimited
                | CompletionErrorKind::Timeout
                | CompletionErrorKind::Transport
        )
    }
}

impl fmt::Display for CompletionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionErrorKind::RateLimited => write!(f, "rate_limited"),
            CompletionErrorKind::Timeout => write!(f, "timeout"),
            CompletionErrorKind::Transport => write!(f, "transport"),
            CompletionErrorKind::InvalidResponse => write!(f, "invalid_response"),
            CompletionErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}

/// A failed completion request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct CompletionError {
    pub kind: CompletionErrorKind,
    pub message: String,
}

impl CompletionError {
    pub fn new(kind: CompletionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(CompletionErrorKind::RateLimited, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(CompletionErrorKind::Timeout, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(CompletionErrorKind::Transport, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(CompletionErrorKind::InvalidResponse, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(CompletionErrorKind::Fatal, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Errors raised by a tool implementation.
///
/// These never end a trajectory; the invoker turns them into a tool-result
/// turn the model sees on its next request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("Unknown tool '{0}'")]
    NotFound(String),

    #[error("Invalid arguments for '{tool}': {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("Tool '{tool}' timed out after {seconds}s")]
    Timeout { tool: String, seconds: u64 },

    #[error("Tool execution failed: {0}")]
    ExecutionFailed(String),
}

/// Terminal error recorded on a failed trajectory.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum TrajectoryError {
    #[error("Completion failed after {attempts} attempts ({kind}): {message}")]
    RetriesExhausted {
        kind: CompletionErrorKind,
        attempts: u32,
        message: String,
    },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Fatal completion error: {0}")]
    Fatal(String),
}

/// Errors that can occur while reading or writing checkpoints.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt checkpoint record on line {line}: {message}")]
    Corrupt { line: usize, message: String },

    #[error("Refusing to checkpoint non-terminal trajectory for task '{0}'")]
    NotTerminal(String),

    #[error("Checkpoint log {0} could not be rolled back after a failed write")]
    Unwritable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_kinds() {
        assert!(CompletionErrorKind::RateLimited.is_transient());
        assert!(CompletionErrorKind::Timeout.is_transient());
        assert!(CompletionErrorKind::Transport.is_transient());
        assert!(!CompletionErrorKind::InvalidResponse.is_transient());
        assert!(!CompletionErrorKind::Fatal.is_transient());
    }

    #[test]
    fn test_completion_error_display() {
        let err = CompletionError::rate_limited("slow down");
        assert_eq!(err.to_string(), "rate_limited: slow down");
        assert!(err.is_transient());
    }

    #[test]
    fn test_trajectory_error_serialization() {
        let err = TrajectoryError::RetriesExhausted {
            kind: CompletionErrorKind::Timeout,
            attempts: 3,
            message: "deadline".to_string(),
        };
        let json = serde_json::to_string(&err).expect("serialization should work");
        assert!(json.contains("retries_exhausted"));
        assert!(json.contains("timeout"));

        let back: TrajectoryError = serde_json::from_str(&json).expect("roundtrip should work");
        assert_eq!(back, err);
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::UnweightedCategory {
            category: "vision".to_string(),
        };
        assert!(err.to_string().contains("vision"));

        let err = ConfigError::CheckpointExists {
            path: "run.jsonl".to_string(),
            records: 12,
        };
        assert!(err.to_string().contains("--resume"));
    }
}
