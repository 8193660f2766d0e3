//! Terminal tool: runs a shell command on the host.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;
use tokio::time::timeout;

use super::{truncate_output, Tool, MAX_OUTPUT_CHARS};
use crate::error::ToolError;

/// Default timeout for command execution in seconds.
const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Upper bound on a caller-requested timeout.
const MAX_TIMEOUT_SECONDS: u64 = 600;

#[derive(Debug, Deserialize)]
struct ShellParams {
    command: String,
    #[serde(default)]
    timeout_seconds: Option<u64>,
}

/// Tool for executing shell commands via `sh -c`.
#[derive(Debug, Clone, Default)]
pub struct ShellTool {
    working_dir: Option<PathBuf>,
}

impl ShellTool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs commands inside `dir` instead of the current directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "terminal"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return its combined output. Use for running programs, inspecting files and checking system state."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout_seconds": {
                    "type": "integer",
                    "description": "Timeout in seconds (default: 30)"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let params: ShellParams = serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments {
            tool: self.name().to_string(),
            message: e.to_string(),
        })?;

        if params.command.trim().is_empty() {
            return Err(ToolError::InvalidArguments {
                tool: self.name().to_string(),
                message: "command must not be empty".to_string(),
            });
        }

        let seconds = params
            .timeout_seconds
            .unwrap_or(DEFAULT_TIMEOUT_SECONDS)
            .clamp(1, MAX_TIMEOUT_SECONDS);

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&params.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let output = timeout(Duration::from_secs(seconds), command.output())
            .await
            .map_err(|_| ToolError::Timeout {
                tool: self.name().to_string(),
                seconds,
            })?
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to spawn shell: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let mut text = stdout.into_owned();
        if !stderr.is_empty() {
            if !text.is_empty() {
                text.push_str("\n--- stderr ---\n");
            }
            text.push_str(&stderr);
        }
        let text = truncate_output(&text, MAX_OUTPUT_CHARS);

        if output.status.success() {
            Ok(text)
        } else {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            Err(ToolError::ExecutionFailed(format!(
                "command exited with code {}\n{}",
                code, text
            )))
        }
    }
}
