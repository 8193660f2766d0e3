//! OpenAI-compatible chat completions client.
//!
//! Works against any endpoint that speaks the `/chat/completions` protocol
//! with function tools (OpenAI, OpenRouter, vLLM, LiteLLM proxies).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::client::{CompletionClient, CompletionRequest, CompletionResponse, ToolSchema};
use crate::error::CompletionError;
use crate::trajectory::{TokenUsage, ToolCall, Turn};

/// Default API endpoint.
pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Default request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Client for OpenAI-compatible chat completion APIs.
pub struct OpenAiClient {
    client: Client,
    api_key: Option<String>,
    base_url: String,
}

impl OpenAiClient {
    /// Creates a client for `base_url` with the default timeout.
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self, CompletionError> {
        Self::with_timeout(base_url, api_key, Duration::from_secs(REQUEST_TIMEOUT_SECS))
    }

    /// Creates a client whose HTTP requests give up after `timeout`.
    pub fn with_timeout(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, CompletionError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CompletionError::fatal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Get the API key (for debugging, returns masked value).
    pub fn api_key_masked(&self) -> String {
        match &self.api_key {
            None => "<none>".to_string(),
            Some(key) if key.len() <= 8 => "*".repeat(key.len()),
            Some(key) => format!("{}...{}", &key[..4], &key[key.len() - 4..]),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn execute_request(&self, request: &ApiRequest) -> Result<CompletionResponse, CompletionError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("X-Title", "trajforge");
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let http_response = builder.json(request).send().await.map_err(classify_reqwest_error)?;

        let status = http_response.status();
        if !status.is_success() {
            let error_text = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            let message = serde_json::from_str::<ApiErrorResponse>(&error_text)
                .map(|e| e.error.message)
                .unwrap_or(error_text);
            return Err(classify_status(status.as_u16(), message));
        }

        let body = http_response.text().await.map_err(classify_reqwest_error)?;
        parse_response(&body)
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, CompletionError> {
        let api_request = ApiRequest::from_request(&request)?;

        tracing::debug!(
            model = %api_request.model,
            messages = api_request.messages.len(),
            tools = api_request.tools.len(),
            "Sending completion request"
        );

        self.execute_request(&api_request).await
    }
}

/// Maps an HTTP error status onto a completion error kind.
pub fn classify_status(status: u16, message: impl Into<String>) -> CompletionError {
    let message = format!("HTTP {}: {}", status, message.into());
    match status {
        429 => CompletionError::rate_limited(message),
        408 => CompletionError::timeout(message),
        500..=599 => CompletionError::transport(message),
        _ => CompletionError::fatal(message),
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> CompletionError {
    if err.is_timeout() {
        CompletionError::timeout(err.to_string())
    } else if err.is_decode() {
        CompletionError::invalid_response(err.to_string())
    } else {
        CompletionError::transport(err.to_string())
    }
}

/// Parses a successful response body into one assistant turn.
pub fn parse_response(body: &str) -> Result<CompletionResponse, CompletionError> {
    let api_response: ApiResponse = serde_json::from_str(body)
        .map_err(|e| CompletionError::invalid_response(format!("failed to parse API response: {}", e)))?;

    let choice = api_response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| CompletionError::invalid_response("response has no choices"))?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| {
            let arguments = if call.function.arguments.trim().is_empty() {
                serde_json::Value::Object(serde_json::Map::new())
            } else {
                serde_json::from_str(&call.function.arguments).map_err(|e| {
                    CompletionError::invalid_response(format!(
                        "tool call '{}' has malformed arguments: {}",
                        call.id, e
                    ))
                })?
            };
            Ok(ToolCall::new(call.id, call.function.name, arguments))
        })
        .collect::<Result<Vec<_>, CompletionError>>()?;

    let usage = api_response
        .usage
        .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
        .unwrap_or_default();

    Ok(CompletionResponse {
        content: choice.message.content,
        tool_calls,
        usage,
        finish_reason: choice.finish_reason,
    })
}

/// Request body for `/chat/completions`.
#[derive(Debug, Clone, Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

impl ApiRequest {
    fn from_request(request: &CompletionRequest) -> Result<Self, CompletionError> {
        let mut messages = Vec::with_capacity(request.turns.len() + 1);
        if let Some(system) = &request.system_prompt {
            messages.push(ApiMessage::plain("system", system.clone()));
        }

        for turn in &request.turns {
            messages.push(match turn {
                Turn::User { content } => ApiMessage::plain("user", content.clone()),
                Turn::Model {
                    content, tool_calls, ..
                } => ApiMessage {
                    role: "assistant".to_string(),
                    content: content.clone(),
                    tool_calls: if tool_calls.is_empty() {
                        None
                    } else {
                        Some(
                            tool_calls
                                .iter()
                                .map(ApiToolCall::from_call)
                                .collect::<Result<Vec<_>, _>>()?,
                        )
                    },
                    tool_call_id: None,
                },
                Turn::Tool(result) => ApiMessage {
                    role: "tool".to_string(),
                    content: Some(result.content.clone()),
                    tool_calls: None,
                    tool_call_id: Some(result.call_id.clone()),
                },
            });
        }

        Ok(Self {
            model: request.model.clone(),
            messages,
            tools: request.tools.iter().map(ApiTool::from_schema).collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl ApiMessage {
    fn plain(role: &str, content: String) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    kind: String,
    function: ApiFunctionCall,
}

impl ApiToolCall {
    fn from_call(call: &ToolCall) -> Result<Self, CompletionError> {
        let arguments = serde_json::to_string(&call.arguments)
            .map_err(|e| CompletionError::invalid_response(format!("unserializable arguments: {}", e)))?;
        Ok(Self {
            id: call.id.clone(),
            kind: function_type(),
            function: ApiFunctionCall {
                name: call.name.clone(),
                arguments,
            },
        })
    }
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiFunctionCall {
    name: String,
    /// JSON-encoded arguments object.
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Clone, Serialize)]
struct ApiTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: ApiFunctionSpec,
}

impl ApiTool {
    fn from_schema(schema: &ToolSchema) -> Self {
        Self {
            kind: "function",
            function: ApiFunctionSpec {
                name: schema.name.clone(),
                description: schema.description.clone(),
                parameters: schema.parameters.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ApiFunctionSpec {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompletionErrorKind;
    use crate::trajectory::ToolResult;
    use serde_json::json;

    #[test]
    fn test_api_key_masked() {
        let client = OpenAiClient::new(DEFAULT_API_BASE, Some("sk-1234567890abcdef".to_string()))
            .expect("client should build");
        assert_eq!(client.api_key_masked(), "sk-1...cdef");

        let client = OpenAiClient::new(DEFAULT_API_BASE, Some("abc".to_string())).expect("client should build");
        assert_eq!(client.api_key_masked(), "***");
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = OpenAiClient::new("http://localhost:8000/v1/", None).expect("client should build");
        assert_eq!(client.base_url(), "http://localhost:8000/v1");
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(429, "slow").kind, CompletionErrorKind::RateLimited);
        assert_eq!(classify_status(503, "down").kind, CompletionErrorKind::Transport);
        assert_eq!(classify_status(408, "late").kind, CompletionErrorKind::Timeout);
        assert_eq!(classify_status(401, "nope").kind, CompletionErrorKind::Fatal);
        assert_eq!(classify_status(400, "bad").kind, CompletionErrorKind::Fatal);
    }

    #[test]
    fn test_parse_text_response() {
        let body = r#"{
            "id": "x",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hello"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }"#;
        let response = parse_response(body).expect("should parse");
        assert_eq!(response.content.as_deref(), Some("Hello"));
        assert!(response.tool_calls.is_empty());
        assert_eq!(response.usage.total_tokens, 15);
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_parse_tool_call_response() {
        let body = r#"{
            "choices": [{"message": {"role": "assistant", "content": null, "tool_calls": [
                {"id": "call_1", "type": "function", "function": {"name": "terminal", "arguments": "{\"command\":\"ls\"}"}}
            ]}, "finish_reason": "tool_calls"}]
        }"#;
        let response = parse_response(body).expect("should parse");
        assert!(response.content.is_none());
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "terminal");
        assert_eq!(response.tool_calls[0].arguments, json!({"command": "ls"}));
        assert_eq!(response.usage, TokenUsage::default());
    }

    #[test]
    fn test_parse_malformed_arguments() {
        let body = r#"{"choices": [{"message": {"tool_calls": [
            {"id": "c", "type": "function", "function": {"name": "terminal", "arguments": "{not json"}}
        ]}}]}"#;
        let err = parse_response(body).expect_err("should fail");
        assert_eq!(err.kind, CompletionErrorKind::InvalidResponse);
    }

    #[test]
    fn test_parse_no_choices() {
        let err = parse_response(r#"{"choices": []}"#).expect_err("should fail");
        assert_eq!(err.kind, CompletionErrorKind::InvalidResponse);

        let err = parse_response("<html>").expect_err("should fail");
        assert_eq!(err.kind, CompletionErrorKind::InvalidResponse);
    }

    #[test]
    fn test_request_serialization() {
        let call = ToolCall::new("c1", "terminal", json!({"command": "ls"}));
        let request = CompletionRequest::new(
            "gpt-4o",
            vec![
                Turn::User {
                    content: "list files".to_string(),
                },
                Turn::Model {
                    turn: 1,
                    content: None,
                    tool_calls: vec![call.clone()],
                },
                Turn::Tool(ToolResult::success(&call, "a.txt")),
            ],
        )
        .with_system_prompt(Some("sys".to_string()))
        .with_tools(vec![ToolSchema::new("terminal", "Run a command", json!({"type": "object"}))]);

        let api_request = ApiRequest::from_request(&request).expect("should convert");
        let json = serde_json::to_value(&api_request).expect("serialization should succeed");

        let messages = json["messages"].as_array().expect("messages array");
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[2]["tool_calls"][0]["function"]["arguments"], "{\"command\":\"ls\"}");
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "c1");
        assert_eq!(json["tools"][0]["type"], "function");
        assert!(json.get("temperature").is_none());
    }

    #[tokio::test]
    async fn test_connection_error_is_transport() {
        let client = OpenAiClient::new("http://127.0.0.1:9", None).expect("client should build");
        let request = CompletionRequest::new(
            "test-model",
            vec![Turn::User {
                content: "test".to_string(),
            }],
        );
        let err = client.complete(request).await.expect_err("should fail");
        assert!(err.is_transient());
    }
}
