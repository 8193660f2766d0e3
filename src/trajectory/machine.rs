//! Per-task protocol state machine.
//!
//! The machine is a pure function from `(state, event)` to the next state,
//! the turns to record, and the effect the driver must perform next. It
//! never performs I/O, which keeps the turn-budget and retry-exhaustion edges
//! testable without a runtime.
//!
//! ```text
//! Init ──Start──► AwaitingModel ──reply(text)──────► Completed
//!                   │  ▲   │
//!                   │  │   └──reply(tool calls)──► ExecutingTools ──all results──► AwaitingModel
//!                   │  └──transient failure, attempts left (backoff)                     │
//!                   └──fatal / protocol / attempts exhausted──► Failed                   │
//!                                            turn budget reached after results ──► Truncated
//! ```

use std::collections::HashSet;
use std::time::Duration;

use crate::error::{CompletionError, CompletionErrorKind, TrajectoryError};

use super::retry::RetryPolicy;
use super::types::{TokenUsage, ToolCall, ToolResult, TrajectoryStatus, Turn};

/// Limits applied to every transition.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Maximum number of model turns before truncation.
    pub max_turns: u32,
    pub retry: RetryPolicy,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_turns: 10,
            retry: RetryPolicy::default(),
        }
    }
}

/// Protocol state of one trajectory.
#[derive(Debug, Clone, PartialEq)]
pub enum MachineState {
    Init,
    /// A completion request is outstanding.
    AwaitingModel {
        /// Model turns completed so far.
        turn: u32,
        /// 1-based number of the attempt in flight for the next turn.
        attempt: u32,
    },
    /// Tool calls from model turn `turn` still await results.
    ExecutingTools { turn: u32, pending: Vec<ToolCall> },
    Completed { turns: u32 },
    Truncated { turns: u32 },
    Failed { turns: u32, error: TrajectoryError },
}

impl MachineState {
    pub fn status(&self) -> TrajectoryStatus {
        match self {
            MachineState::Init => TrajectoryStatus::Pending,
            MachineState::AwaitingModel { .. } | MachineState::ExecutingTools { .. } => {
                TrajectoryStatus::InProgress
            }
            MachineState::Completed { .. } => TrajectoryStatus::Completed,
            MachineState::Truncated { .. } => TrajectoryStatus::Truncated,
            MachineState::Failed { .. } => TrajectoryStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Model turns taken so far.
    pub fn turns(&self) -> u32 {
        match self {
            MachineState::Init => 0,
            MachineState::AwaitingModel { turn, .. } | MachineState::ExecutingTools { turn, .. } => {
                *turn
            }
            MachineState::Completed { turns }
            | MachineState::Truncated { turns }
            | MachineState::Failed { turns, .. } => *turns,
        }
    }
}

/// A successful completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelReply {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
}

impl ModelReply {
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
}

/// Input to the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Begin the rollout with the task prompt.
    Start { prompt: String },
    ModelResponded(ModelReply),
    ModelFailed(CompletionError),
    ToolFinished(ToolResult),
}

/// What the driver must do after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Send the conversation to the completion endpoint.
    RequestCompletion { attempt: u32 },
    /// Sleep, then send the conversation again.
    RetryAfter { retry: u32, delay: Duration },
    /// Run every listed call and feed back one `ToolFinished` per call.
    InvokeTools(Vec<ToolCall>),
    /// More tool results are still expected for the current model turn.
    AwaitToolResults,
    /// The trajectory is terminal.
    Finish,
}

/// Result of applying one event.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: MachineState,
    pub turns: Vec<Turn>,
    pub effect: Effect,
}

impl Transition {
    fn new(state: MachineState, turns: Vec<Turn>, effect: Effect) -> Self {
        Self {
            state,
            turns,
            effect,
        }
    }

    fn fail(turns: u32, error: TrajectoryError) -> Self {
        Self::new(MachineState::Failed { turns, error }, Vec::new(), Effect::Finish)
    }
}

/// Applies `event` to `state`.
pub fn transition(state: &MachineState, event: Event, limits: &Limits) -> Transition {
    match (state, event) {
        (MachineState::Init, Event::Start { prompt }) => {
            let turns = vec![Turn::User { content: prompt }];
            if limits.max_turns == 0 {
                return Transition::new(MachineState::Truncated { turns: 0 }, turns, Effect::Finish);
            }
            Transition::new(
                MachineState::AwaitingModel {
                    turn: 0,
                    attempt: 1,
                },
                turns,
                Effect::RequestCompletion { attempt: 1 },
            )
        }

        (MachineState::AwaitingModel { turn, .. }, Event::ModelResponded(reply)) => {
            on_reply(*turn, reply)
        }

        (MachineState::AwaitingModel { turn, attempt }, Event::ModelFailed(err)) => {
            on_failure(*turn, *attempt, err, &limits.retry)
        }

        (MachineState::ExecutingTools { turn, pending }, Event::ToolFinished(result)) => {
            let Some(pos) = pending.iter().position(|c| c.id == result.call_id) else {
                return Transition::fail(
                    *turn,
                    TrajectoryError::ProtocolViolation(format!(
                        "result for unknown tool call '{}'",
                        result.call_id
                    )),
                );
            };

            let mut pending = pending.clone();
            pending.remove(pos);
            let turns = vec![Turn::Tool(result)];

            if !pending.is_empty() {
                return Transition::new(
                    MachineState::ExecutingTools {
                        turn: *turn,
                        pending,
                    },
                    turns,
                    Effect::AwaitToolResults,
                );
            }

            if *turn >= limits.max_turns {
                return Transition::new(MachineState::Truncated { turns: *turn }, turns, Effect::Finish);
            }

            Transition::new(
                MachineState::AwaitingModel {
                    turn: *turn,
                    attempt: 1,
                },
                turns,
                Effect::RequestCompletion { attempt: 1 },
            )
        }

        (state, _) if state.is_terminal() => {
            Transition::new(state.clone(), Vec::new(), Effect::Finish)
        }

        (state, event) => Transition::fail(
            state.turns(),
            TrajectoryError::ProtocolViolation(format!(
                "event {} is not valid in state {:?}",
                event_name(&event),
                state.status()
            )),
        ),
    }
}

fn on_reply(turn: u32, reply: ModelReply) -> Transition {
    let has_text = reply
        .content
        .as_deref()
        .is_some_and(|c| !c.trim().is_empty());
    if !has_text && reply.tool_calls.is_empty() {
        return Transition::fail(
            turn,
            TrajectoryError::ProtocolViolation("assistant turn has neither text nor tool calls".to_string()),
        );
    }

    let mut ids = HashSet::new();
    for call in &reply.tool_calls {
        if call.id.trim().is_empty() || call.name.trim().is_empty() {
            return Transition::fail(
                turn,
                TrajectoryError::ProtocolViolation("tool call without id or name".to_string()),
            );
        }
        if !ids.insert(call.id.as_str()) {
            return Transition::fail(
                turn,
                TrajectoryError::ProtocolViolation(format!("duplicate tool call id '{}'", call.id)),
            );
        }
    }

    let next = turn + 1;
    let model_turn = Turn::Model {
        turn: next,
        content: reply.content,
        tool_calls: reply.tool_calls.clone(),
    };

    if reply.tool_calls.is_empty() {
        return Transition::new(MachineState::Completed { turns: next }, vec![model_turn], Effect::Finish);
    }

    Transition::new(
        MachineState::ExecutingTools {
            turn: next,
            pending: reply.tool_calls.clone(),
        },
        vec![model_turn],
        Effect::InvokeTools(reply.tool_calls),
    )
}

fn on_failure(turn: u32, attempt: u32, err: CompletionError, retry: &RetryPolicy) -> Transition {
    match err.kind {
        kind if kind.is_transient() => {
            if retry.allows_another(attempt) {
                Transition::new(
                    MachineState::AwaitingModel {
                        turn,
                        attempt: attempt + 1,
                    },
                    Vec::new(),
                    Effect::RetryAfter {
                        retry: attempt,
                        delay: retry.delay_for(attempt),
                    },
                )
            } else {
                Transition::fail(
                    turn,
                    TrajectoryError::RetriesExhausted {
                        kind,
                        attempts: attempt,
                        message: err.message,
                    },
                )
            }
        }
        CompletionErrorKind::InvalidResponse => {
            Transition::fail(turn, TrajectoryError::ProtocolViolation(err.message))
        }
        _ => Transition::fail(turn, TrajectoryError::Fatal(err.message)),
    }
}

fn event_name(event: &Event) -> &'static str {
    match event {
        Event::Start { .. } => "start",
        Event::ModelResponded(_) => "model_responded",
        Event::ModelFailed(_) => "model_failed",
        Event::ToolFinished(_) => "tool_finished",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn limits(max_turns: u32, max_attempts: u32) -> Limits {
        Limits {
            max_turns,
            retry: RetryPolicy::new(max_attempts),
        }
    }

    fn call(id: &str) -> ToolCall {
        ToolCall::new(id, "terminal", json!({"command": "ls"}))
    }

    fn started(limits: &Limits) -> MachineState {
        transition(
            &MachineState::Init,
            Event::Start {
                prompt: "do it".to_string(),
            },
            limits,
        )
        .state
    }

    #[test]
    fn test_start_emits_user_turn_and_requests_completion() {
        let limits = limits(5, 3);
        let t = transition(
            &MachineState::Init,
            Event::Start {
                prompt: "hello".to_string(),
            },
            &limits,
        );
        assert_eq!(t.turns, vec![Turn::User { content: "hello".to_string() }]);
        assert_eq!(t.effect, Effect::RequestCompletion { attempt: 1 });
        assert_eq!(t.state, MachineState::AwaitingModel { turn: 0, attempt: 1 });
    }

    #[test]
    fn test_text_reply_completes() {
        let limits = limits(5, 3);
        let state = started(&limits);
        let t = transition(&state, Event::ModelResponded(ModelReply::text("done")), &limits);
        assert_eq!(t.state, MachineState::Completed { turns: 1 });
        assert_eq!(t.effect, Effect::Finish);
        assert_eq!(t.turns.len(), 1);
        assert!(t.turns[0].is_model());
    }

    #[test]
    fn test_tool_calls_then_results_return_to_model() {
        let limits = limits(5, 3);
        let state = started(&limits);
        let t = transition(
            &state,
            Event::ModelResponded(ModelReply::tool_calls(vec![call("a"), call("b")])),
            &limits,
        );
        assert_eq!(t.effect, Effect::InvokeTools(vec![call("a"), call("b")]));

        let t = transition(&t.state, Event::ToolFinished(ToolResult::success(&call("b"), "ok")), &limits);
        assert!(matches!(t.state, MachineState::ExecutingTools { ref pending, .. } if pending.len() == 1));
        assert_eq!(t.effect, Effect::AwaitToolResults);
        assert_eq!(t.turns.len(), 1);

        let t = transition(&t.state, Event::ToolFinished(ToolResult::failure(&call("a"), "boom")), &limits);
        assert_eq!(t.state, MachineState::AwaitingModel { turn: 1, attempt: 1 });
        assert_eq!(t.effect, Effect::RequestCompletion { attempt: 1 });
    }

    #[test]
    fn test_turn_budget_truncates_after_results() {
        let limits = limits(3, 3);
        let mut state = started(&limits);
        let mut model_turns = 0;

        for i in 0..10 {
            let id = format!("c{}", i);
            let t = transition(
                &state,
                Event::ModelResponded(ModelReply::tool_calls(vec![call(&id)])),
                &limits,
            );
            model_turns += t.turns.iter().filter(|turn| turn.is_model()).count();
            let t = transition(&t.state, Event::ToolFinished(ToolResult::success(&call(&id), "ok")), &limits);
            state = t.state;
            if state.is_terminal() {
                assert_eq!(t.effect, Effect::Finish);
                break;
            }
        }

        assert_eq!(state, MachineState::Truncated { turns: 3 });
        assert_eq!(model_turns, 3);
    }

    #[test]
    fn test_text_on_last_turn_completes() {
        let limits = limits(1, 3);
        let state = started(&limits);
        let t = transition(&state, Event::ModelResponded(ModelReply::text("answer")), &limits);
        assert_eq!(t.state, MachineState::Completed { turns: 1 });
    }

    #[test]
    fn test_transient_failures_retry_then_fail() {
        let limits = limits(5, 3);
        let mut state = started(&limits);

        let t = transition(&state, Event::ModelFailed(CompletionError::rate_limited("429")), &limits);
        assert_eq!(
            t.effect,
            Effect::RetryAfter {
                retry: 1,
                delay: Duration::from_secs(1)
            }
        );
        assert!(t.turns.is_empty());
        state = t.state;

        let t = transition(&state, Event::ModelFailed(CompletionError::timeout("slow")), &limits);
        assert!(matches!(t.effect, Effect::RetryAfter { retry: 2, .. }));
        state = t.state;

        let t = transition(&state, Event::ModelFailed(CompletionError::transport("reset")), &limits);
        assert_eq!(t.effect, Effect::Finish);
        assert!(matches!(
            t.state,
            MachineState::Failed {
                error: TrajectoryError::RetriesExhausted { attempts: 3, kind: CompletionErrorKind::Transport, .. },
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_response_is_protocol_violation() {
        let limits = limits(5, 3);
        let state = started(&limits);
        let t = transition(
            &state,
            Event::ModelFailed(CompletionError::invalid_response("bad json")),
            &limits,
        );
        assert!(matches!(
            t.state,
            MachineState::Failed { error: TrajectoryError::ProtocolViolation(_), .. }
        ));
    }

    #[test]
    fn test_fatal_failure_fails_immediately() {
        let limits = limits(5, 3);
        let state = started(&limits);
        let t = transition(&state, Event::ModelFailed(CompletionError::fatal("401")), &limits);
        assert!(matches!(t.state, MachineState::Failed { error: TrajectoryError::Fatal(_), .. }));
    }

    #[test]
    fn test_empty_reply_is_protocol_violation() {
        let limits = limits(5, 3);
        let state = started(&limits);
        let t = transition(&state, Event::ModelResponded(ModelReply::text("   ")), &limits);
        assert!(matches!(
            t.state,
            MachineState::Failed { error: TrajectoryError::ProtocolViolation(_), .. }
        ));
    }

    #[test]
    fn test_duplicate_call_ids_rejected() {
        let limits = limits(5, 3);
        let state = started(&limits);
        let t = transition(
            &state,
            Event::ModelResponded(ModelReply::tool_calls(vec![call("x"), call("x")])),
            &limits,
        );
        assert!(matches!(
            t.state,
            MachineState::Failed { error: TrajectoryError::ProtocolViolation(_), .. }
        ));
    }

    #[test]
    fn test_unknown_result_id_rejected() {
        let limits = limits(5, 3);
        let state = started(&limits);
        let t = transition(
            &state,
            Event::ModelResponded(ModelReply::tool_calls(vec![call("a")])),
            &limits,
        );
        let t = transition(&t.state, Event::ToolFinished(ToolResult::success(&call("zzz"), "ok")), &limits);
        assert!(matches!(t.state, MachineState::Failed { turns: 1, .. }));
    }

    #[test]
    fn test_out_of_order_event_rejected() {
        let limits = limits(5, 3);
        let state = started(&limits);
        let t = transition(&state, Event::ToolFinished(ToolResult::success(&call("a"), "ok")), &limits);
        assert!(matches!(t.state, MachineState::Failed { .. }));
    }

    #[test]
    fn test_terminal_state_absorbs_events() {
        let limits = limits(5, 3);
        let state = MachineState::Completed { turns: 2 };
        let t = transition(&state, Event::ModelResponded(ModelReply::text("again")), &limits);
        assert_eq!(t.state, state);
        assert!(t.turns.is_empty());
        assert_eq!(t.effect, Effect::Finish);
    }

    #[test]
    fn test_zero_turn_budget_truncates_immediately() {
        let limits = limits(0, 3);
        let t = transition(
            &MachineState::Init,
            Event::Start {
                prompt: "p".to_string(),
            },
            &limits,
        );
        assert_eq!(t.state, MachineState::Truncated { turns: 0 });
    }
}
