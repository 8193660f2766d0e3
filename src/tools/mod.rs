//! Tool definitions and the invoker the trajectory driver calls.
//!
//! A [`Tool`] is one callable capability with a declared JSON schema. Tools
//! are grouped into named toolsets inside a [`ToolRegistry`], which is the
//! [`ToolInvoker`] implementation used for real runs. The invoker contract is
//! that every call produces a [`ToolResult`]; failures become error results
//! the model sees on its next turn.

pub mod registry;
pub mod shell;
pub mod web;

pub use registry::ToolRegistry;
pub use shell::ShellTool;
pub use web::WebFetchTool;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ToolError;
use crate::llm::ToolSchema;
use crate::trajectory::{ToolCall, ToolResult};

/// Maximum characters of tool output returned to the model.
pub const MAX_OUTPUT_CHARS: usize = 16_000;

/// Trait for tools that can be called by the model.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Returns the unique name of the tool.
    fn name(&self) -> &str;

    /// Returns a description of what the tool does.
    fn description(&self) -> &str;

    /// Returns the JSON schema for the tool's parameters.
    fn parameters_schema(&self) -> Value;

    /// Schema entry offered to the model.
    fn schema(&self) -> ToolSchema {
        ToolSchema::new(self.name(), self.description(), self.parameters_schema())
    }

    /// Runs the tool and returns its textual output.
    async fn execute(&self, args: Value) -> Result<String, ToolError>;
}

/// Executes tool calls on behalf of a trajectory.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Schemas of the tools in `toolsets`, or of every tool when empty.
    fn catalog(&self, toolsets: &[String]) -> Vec<ToolSchema>;

    /// Runs one call. Never fails; errors are reported in the result.
    async fn invoke(&self, call: &ToolCall) -> ToolResult;
}

/// Cuts `text` to at most `max_chars` characters, marking the cut.
pub fn truncate_output(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((byte_idx, _)) => {
            let omitted = text[byte_idx..].chars().count();
            format!("{}\n[... {} characters truncated]", &text[..byte_idx], omitted)
        }
    }
}
