//! Registry of tools grouped into named toolsets.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use super::{ShellTool, Tool, ToolInvoker, WebFetchTool};
use crate::error::ToolError;
use crate::llm::ToolSchema;
use crate::trajectory::{ToolCall, ToolResult};

/// Default per-call tool timeout in seconds.
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 60;

/// Registry for managing available tools.
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
    /// Toolset name -> tool names.
    toolsets: BTreeMap<String, BTreeSet<String>>,
    call_timeout: Duration,
}

impl ToolRegistry {
    /// Create a new empty tool registry.
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
            toolsets: BTreeMap::new(),
            call_timeout: Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECS),
        }
    }

    /// Registry with the built-in `terminal` and `web` toolsets.
    pub fn with_builtin_tools() -> Self {
        let mut registry = Self::new();
        registry.register("terminal", Arc::new(ShellTool::new()));
        registry.register("web", Arc::new(WebFetchTool::new()));
        registry
    }

    /// Sets the timeout applied to every call.
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Registers `tool` as a member of `toolset`.
    pub fn register(&mut self, toolset: &str, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.toolsets
            .entry(toolset.to_string())
            .or_default()
            .insert(name.clone());
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Names of all toolsets.
    pub fn toolset_names(&self) -> BTreeSet<String> {
        self.toolsets.keys().cloned().collect()
    }

    /// Tool names reachable from `toolsets`, or all tools when empty.
    pub fn tool_names(&self, toolsets: &[String]) -> BTreeSet<String> {
        if toolsets.is_empty() {
            return self.tools.keys().cloned().collect();
        }
        toolsets
            .iter()
            .filter_map(|set| self.toolsets.get(set))
            .flat_map(|names| names.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    async fn execute(&self, call: &ToolCall) -> Result<String, ToolError> {
        let tool = self
            .get(&call.name)
            .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;

        timeout(self.call_timeout, tool.execute(call.arguments.clone()))
            .await
            .map_err(|_| ToolError::Timeout {
                tool: call.name.clone(),
                seconds: self.call_timeout.as_secs(),
            })?
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolInvoker for ToolRegistry {
    fn catalog(&self, toolsets: &[String]) -> Vec<ToolSchema> {
        self.tool_names(toolsets)
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.schema())
            .collect()
    }

    async fn invoke(&self, call: &ToolCall) -> ToolResult {
        match self.execute(call).await {
            Ok(output) => ToolResult::success(call, output),
            Err(err) => {
                tracing::debug!(tool = %call.name, call_id = %call.id, error = %err, "Tool call failed");
                ToolResult::failure(call, err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the text argument"
        }

        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }

        async fn execute(&self, args: Value) -> Result<String, ToolError> {
            args.get("text")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| ToolError::InvalidArguments {
                    tool: "echo".to_string(),
                    message: "missing text".to_string(),
                })
        }
    }

    struct SleepyTool;

    #[async_trait]
    impl Tool for SleepyTool {
        fn name(&self) -> &str {
            "sleepy"
        }

        fn description(&self) -> &str {
            "Never finishes in time"
        }

        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(&self, _args: Value) -> Result<String, ToolError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new().with_call_timeout(Duration::from_millis(50));
        registry.register("basic", Arc::new(EchoTool));
        registry.register("slow", Arc::new(SleepyTool));
        registry
    }

    #[test]
    fn test_builtin_toolsets() {
        let registry = ToolRegistry::with_builtin_tools();
        let sets = registry.toolset_names();
        assert!(sets.contains("terminal"));
        assert!(sets.contains("web"));
        assert!(registry.get("terminal").is_some());
        assert!(registry.get("web_fetch").is_some());
    }

    #[test]
    fn test_catalog_filters_by_toolset() {
        let registry = registry();
        let all = registry.catalog(&[]);
        assert_eq!(all.len(), 2);

        let basic = registry.catalog(&["basic".to_string()]);
        assert_eq!(basic.len(), 1);
        assert_eq!(basic[0].name, "echo");
    }

    #[tokio::test]
    async fn test_invoke_success() {
        let registry = registry();
        let call = ToolCall::new("c1", "echo", json!({"text": "hi"}));
        let result = registry.invoke(&call).await;
        assert!(!result.is_error);
        assert_eq!(result.content, "hi");
        assert_eq!(result.call_id, "c1");
    }

    #[tokio::test]
    async fn test_invoke_errors_become_results() {
        let registry = registry();

        let result = registry.invoke(&ToolCall::new("c1", "echo", json!({}))).await;
        assert!(result.is_error);
        assert!(result.content.contains("missing text"));

        let result = registry.invoke(&ToolCall::new("c2", "nope", json!({}))).await;
        assert!(result.is_error);
        assert!(result.content.contains("Unknown tool"));
    }

    #[tokio::test]
    async fn test_invoke_timeout() {
        let registry = registry();
        let result = registry.invoke(&ToolCall::new("c1", "sleepy", json!({}))).await;
        assert!(result.is_error);
        assert!(result.content.contains("timed out"));
    }
}
