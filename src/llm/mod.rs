//! Completion endpoint integration.
//!
//! - [`CompletionClient`]: the boundary the trajectory driver calls
//! - [`OpenAiClient`]: HTTP implementation for OpenAI-compatible endpoints
//! - [`RunBudget`]: request pacing and the run-wide token budget
//!
//! ```ignore
//! use trajforge::llm::{CompletionClient, CompletionRequest, OpenAiClient};
//!
//! let client = OpenAiClient::new("https://openrouter.ai/api/v1", Some(key))?;
//! let response = client.complete(CompletionRequest::new("openai/gpt-4o", turns)).await?;
//! ```

pub mod budget;
pub mod client;
pub mod openai;

pub use budget::RunBudget;
pub use client::{CompletionClient, CompletionRequest, CompletionResponse, ToolSchema};
pub use openai::{OpenAiClient, DEFAULT_API_BASE};
