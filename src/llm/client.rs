//! Completion client abstraction.
//!
//! The orchestrator talks to the model through [`CompletionClient`], which
//! takes the conversation so far plus the tool catalog and returns either
//! one assistant turn or a classified [`CompletionError`]. Implementations
//! do not retry; retry policy belongs to the trajectory state machine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CompletionError;
use crate::trajectory::{ModelReply, TokenUsage, ToolCall, Turn};

/// A tool the model may call, in JSON-schema form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: serde_json::Value,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Everything needed for one completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    /// Optional system prompt placed ahead of the conversation.
    pub system_prompt: Option<String>,
    /// Conversation so far.
    pub turns: Vec<Turn>,
    /// Tool catalog offered for this call.
    pub tools: Vec<ToolSchema>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, turns: Vec<Turn>) -> Self {
        Self {
            model: model.into(),
            system_prompt: None,
            turns,
            tools: Vec::new(),
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSchema>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f64>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// One assistant turn returned by the endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
    /// Provider finish reason, e.g. `stop` or `tool_calls`.
    pub finish_reason: Option<String>,
}

impl CompletionResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Default::default()
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }
}

impl From<CompletionResponse> for ModelReply {
    fn from(response: CompletionResponse) -> Self {
        ModelReply {
            content: response.content,
            tool_calls: response.tool_calls,
            usage: response.usage,
        }
    }
}

/// Trait for endpoints that produce assistant turns.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Requests the next assistant turn for `request`.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, CompletionError>;
}
