//! Web tool: fetches a URL over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use super::{truncate_output, Tool, MAX_OUTPUT_CHARS};
use crate::error::ToolError;

/// Request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct FetchParams {
    url: String,
}

/// Tool for fetching web pages with HTTP GET.
pub struct WebFetchTool {
    client: Option<Client>,
}

impl WebFetchTool {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent("trajforge/0.1")
            .build()
            .ok();
        Self { client }
    }
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a web page by URL and return the response body as text."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "Absolute http(s) URL to fetch"
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let params: FetchParams = serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments {
            tool: self.name().to_string(),
            message: e.to_string(),
        })?;

        if !(params.url.starts_with("http://") || params.url.starts_with("https://")) {
            return Err(ToolError::InvalidArguments {
                tool: self.name().to_string(),
                message: format!("unsupported URL '{}'", params.url),
            });
        }

        let client = self
            .client
            .as_ref()
            .ok_or_else(|| ToolError::ExecutionFailed("HTTP client not available".to_string()))?;

        let response = client.get(&params.url).send().await.map_err(|e| {
            if e.is_timeout() {
                ToolError::Timeout {
                    tool: self.name().to_string(),
                    seconds: REQUEST_TIMEOUT_SECS,
                }
            } else {
                ToolError::ExecutionFailed(format!("request failed: {}", e))
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to read body: {}", e)))?;

        if !status.is_success() {
            return Err(ToolError::ExecutionFailed(format!(
                "HTTP {}: {}",
                status.as_u16(),
                truncate_output(&body, 500)
            )));
        }

        Ok(truncate_output(&body, MAX_OUTPUT_CHARS))
    }
}
