//! Trajectory data types for multi-turn tool-calling rollouts.
//!
//! A trajectory is the ordered list of turns produced for one task: the user
//! prompt, model turns (text plus zero or more tool calls), and one
//! tool-result turn per tool call.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TrajectoryError;

/// Lifecycle status of a trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrajectoryStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Truncated,
}

impl TrajectoryStatus {
    /// Whether the trajectory has reached an end state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TrajectoryStatus::Completed | TrajectoryStatus::Failed | TrajectoryStatus::Truncated
        )
    }
}

impl fmt::Display for TrajectoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrajectoryStatus::Pending => write!(f, "pending"),
            TrajectoryStatus::InProgress => write!(f, "in_progress"),
            TrajectoryStatus::Completed => write!(f, "completed"),
            TrajectoryStatus::Failed => write!(f, "failed"),
            TrajectoryStatus::Truncated => write!(f, "truncated"),
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned id, echoed back on the result turn.
    pub id: String,
    /// Name of the tool to call.
    pub name: String,
    /// Structured arguments.
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Outcome of one tool call, as shown to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Id of the call this result answers.
    pub call_id: String,
    /// Name of the tool that ran.
    pub name: String,
    /// Result payload or error description.
    pub content: String,
    /// Whether the tool failed.
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn failure(call: &ToolCall, error: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            content: error.into(),
            is_error: true,
        }
    }
}

/// One recorded turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Turn {
    /// The task prompt.
    User { content: String },
    /// A model response.
    Model {
        /// 1-based model turn number.
        turn: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    /// The result of one tool call.
    Tool(ToolResult),
}

impl Turn {
    pub fn is_model(&self) -> bool {
        matches!(self, Turn::Model { .. })
    }
}

/// Token usage statistics for a trajectory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Number of tokens in the prompts.
    pub prompt_tokens: u32,

    /// Number of tokens in the completions.
    pub completion_tokens: u32,

    /// Total number of tokens used.
    pub total_tokens: u32,
}

impl TokenUsage {
    /// Creates a new TokenUsage with the specified values.
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Adds another TokenUsage to this one.
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// The accumulating record for one task.
///
/// Owned by the worker executing it until it reaches a terminal status,
/// then handed to the checkpoint store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    /// Unique identifier for this rollout.
    pub id: Uuid,

    /// Identifier of the task being executed.
    pub task_id: String,

    /// Distribution bucket the task was sampled from.
    pub category: String,

    /// Model used for the rollout.
    pub model: String,

    /// Tools offered to the model.
    pub tools: Vec<String>,

    /// Recorded turns, in order.
    pub turns: Vec<Turn>,

    pub status: TrajectoryStatus,

    /// Number of model turns taken.
    pub model_turns: u32,

    /// Completion retries spent across all model turns.
    pub retries: u32,

    pub token_usage: TokenUsage,

    /// Terminal error for failed trajectories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TrajectoryError>,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Trajectory {
    /// Creates an empty, pending trajectory.
    pub fn new(task_id: impl Into<String>, category: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: task_id.into(),
            category: category.into(),
            model: model.into(),
            tools: Vec::new(),
            turns: Vec::new(),
            status: TrajectoryStatus::Pending,
            model_turns: 0,
            retries: 0,
            token_usage: TokenUsage::default(),
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Sets the offered tool names.
    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    /// Returns tool calls that have no result turn before the next model turn.
    pub fn dangling_tool_calls(&self) -> Vec<&ToolCall> {
        let mut dangling = Vec::new();
        let mut open: Vec<&ToolCall> = Vec::new();

        for turn in &self.turns {
            match turn {
                Turn::Model { tool_calls, .. } => {
                    dangling.append(&mut open);
                    open = tool_calls.iter().collect();
                }
                Turn::Tool(result) => {
                    if let Some(pos) = open.iter().position(|c| c.id == result.call_id) {
                        open.remove(pos);
                    }
                }
                Turn::User { .. } => {}
            }
        }

        dangling.append(&mut open);
        dangling
    }

    /// Wall-clock duration in milliseconds, once finished.
    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_token_usage_add() {
        let mut usage = TokenUsage::new(100, 50);
        usage.add(&TokenUsage::new(200, 100));
        assert_eq!(usage.prompt_tokens, 300);
        assert_eq!(usage.completion_tokens, 150);
        assert_eq!(usage.total_tokens, 450);
    }

    #[test]
    fn test_status_terminal() {
        assert!(!TrajectoryStatus::Pending.is_terminal());
        assert!(!TrajectoryStatus::InProgress.is_terminal());
        assert!(TrajectoryStatus::Completed.is_terminal());
        assert!(TrajectoryStatus::Failed.is_terminal());
        assert!(TrajectoryStatus::Truncated.is_terminal());
        assert_eq!(TrajectoryStatus::InProgress.to_string(), "in_progress");
    }

    #[test]
    fn test_turn_serialization_tags_role() {
        let turn = Turn::Model {
            turn: 1,
            content: Some("Searching".to_string()),
            tool_calls: vec![ToolCall::new("c1", "web_search", json!({"q": "rust"}))],
        };
        let json = serde_json::to_string(&turn).expect("serialization should work");
        assert!(json.contains("\"role\":\"model\""));
        assert!(json.contains("web_search"));
    }

    #[test]
    fn test_dangling_tool_calls() {
        let call_a = ToolCall::new("a", "terminal", json!({}));
        let call_b = ToolCall::new("b", "terminal", json!({}));

        let mut trajectory = Trajectory::new("t", "unweighted", "m");
        trajectory.turns = vec![
            Turn::User {
                content: "go".to_string(),
            },
            Turn::Model {
                turn: 1,
                content: None,
                tool_calls: vec![call_a.clone(), call_b.clone()],
            },
            Turn::Tool(ToolResult::success(&call_a, "ok")),
        ];
        assert_eq!(trajectory.dangling_tool_calls(), vec![&call_b]);

        trajectory.turns.push(Turn::Tool(ToolResult::failure(&call_b, "boom")));
        assert!(trajectory.dangling_tool_calls().is_empty());
    }
}
