//! Async runner that executes the effects requested by the state machine.
//!
//! The driver owns one [`Trajectory`] for the duration of a rollout. It
//! feeds the machine events produced by the completion client and the tool
//! invoker, and stops early (without reaching a terminal state) when the run
//! is cancelled or the shared token budget is spent.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::machine::{transition, Effect, Event, Limits, MachineState};
use super::types::{ToolCall, ToolResult, Trajectory, TrajectoryStatus};
use crate::dataset::Task;
use crate::error::{CompletionError, TrajectoryError};
use crate::llm::{CompletionClient, CompletionRequest, RunBudget, ToolSchema};
use crate::scheduler::ShutdownSignal;
use crate::tools::ToolInvoker;

/// Default per-call completion timeout in seconds.
pub const DEFAULT_COMPLETION_TIMEOUT_SECS: u64 = 120;

/// Per-rollout settings shared by every trajectory of a run.
#[derive(Debug, Clone)]
pub struct RolloutSettings {
    pub model: String,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub limits: Limits,
    /// Deadline for a single completion call.
    pub completion_timeout: Duration,
}

impl Default for RolloutSettings {
    fn default() -> Self {
        Self {
            model: String::new(),
            system_prompt: None,
            temperature: None,
            max_tokens: None,
            limits: Limits::default(),
            completion_timeout: Duration::from_secs(DEFAULT_COMPLETION_TIMEOUT_SECS),
        }
    }
}

/// How a rollout ended.
#[derive(Debug, Clone)]
pub enum RolloutOutcome {
    /// Reached a terminal status; must be checkpointed.
    Finished(Trajectory),
    /// Stopped by cancellation or budget exhaustion; not checkpointed.
    Interrupted(Trajectory),
}

impl RolloutOutcome {
    pub fn trajectory(&self) -> &Trajectory {
        match self {
            RolloutOutcome::Finished(t) | RolloutOutcome::Interrupted(t) => t,
        }
    }

    pub fn into_trajectory(self) -> Trajectory {
        match self {
            RolloutOutcome::Finished(t) | RolloutOutcome::Interrupted(t) => t,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, RolloutOutcome::Finished(_))
    }
}

/// Drives one trajectory at a time through the protocol.
pub struct TrajectoryDriver {
    client: Arc<dyn CompletionClient>,
    tools: Arc<dyn ToolInvoker>,
    budget: Arc<RunBudget>,
    settings: RolloutSettings,
}

/// Worker-local state of one rollout.
struct Rollout {
    trajectory: Trajectory,
    state: MachineState,
    catalog: Vec<ToolSchema>,
    offered: BTreeSet<String>,
}

impl TrajectoryDriver {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        tools: Arc<dyn ToolInvoker>,
        budget: Arc<RunBudget>,
        settings: RolloutSettings,
    ) -> Self {
        Self {
            client,
            tools,
            budget,
            settings,
        }
    }

    pub fn settings(&self) -> &RolloutSettings {
        &self.settings
    }

    /// Runs `task` to a terminal state or until stopped.
    ///
    /// `toolsets` selects the tool catalog offered to the model; an empty
    /// slice offers every tool the invoker knows.
    pub async fn run(
        &self,
        task: &Task,
        bucket: &str,
        toolsets: &[String],
        shutdown: &ShutdownSignal,
    ) -> RolloutOutcome {
        let catalog = self.tools.catalog(toolsets);
        let offered: BTreeSet<String> = catalog.iter().map(|s| s.name.clone()).collect();
        let trajectory = Trajectory::new(&task.id, bucket, &self.settings.model)
            .with_tools(offered.iter().cloned().collect());

        let mut rollout = Rollout {
            trajectory,
            state: MachineState::Init,
            catalog,
            offered,
        };

        debug!(task_id = %task.id, bucket = %bucket, tools = rollout.offered.len(), "Starting rollout");

        let mut effect = self.apply(
            &mut rollout,
            Event::Start {
                prompt: task.prompt.clone(),
            },
        );

        loop {
            match effect {
                Effect::Finish => return self.finish(rollout),

                Effect::RequestCompletion { attempt } => {
                    if let Some(reason) = self.stop_reason(shutdown) {
                        return self.interrupt(rollout, reason);
                    }
                    let event = self.request_completion(&mut rollout, attempt).await;
                    effect = self.apply(&mut rollout, event);
                }

                Effect::RetryAfter { retry, delay } => {
                    rollout.trajectory.retries += 1;
                    warn!(
                        task_id = %rollout.trajectory.task_id,
                        retry = retry,
                        delay_ms = delay.as_millis() as u64,
                        "Transient completion failure, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.cancelled() => {}
                    }
                    effect = Effect::RequestCompletion { attempt: retry + 1 };
                }

                Effect::InvokeTools(calls) => {
                    if let Some(reason) = self.stop_reason(shutdown) {
                        return self.interrupt(rollout, reason);
                    }
                    let results = join_all(calls.iter().map(|call| self.invoke_tool(&rollout.offered, call))).await;

                    effect = Effect::AwaitToolResults;
                    for result in results {
                        effect = self.apply(&mut rollout, Event::ToolFinished(result));
                    }
                }

                Effect::AwaitToolResults => {
                    rollout.state = MachineState::Failed {
                        turns: rollout.state.turns(),
                        error: TrajectoryError::ProtocolViolation(
                            "tool execution produced fewer results than calls".to_string(),
                        ),
                    };
                    return self.finish(rollout);
                }
            }
        }
    }

    fn apply(&self, rollout: &mut Rollout, event: Event) -> Effect {
        let step = transition(&rollout.state, event, &self.settings.limits);
        rollout.trajectory.turns.extend(step.turns);
        rollout.state = step.state;
        step.effect
    }

    async fn request_completion(&self, rollout: &mut Rollout, attempt: u32) -> Event {
        self.budget.acquire_request_slot().await;

        let request = CompletionRequest::new(&self.settings.model, rollout.trajectory.turns.clone())
            .with_system_prompt(self.settings.system_prompt.clone())
            .with_tools(rollout.catalog.clone())
            .with_temperature(self.settings.temperature)
            .with_max_tokens(self.settings.max_tokens);

        debug!(
            task_id = %rollout.trajectory.task_id,
            attempt = attempt,
            turns = request.turns.len(),
            "Requesting completion"
        );

        match timeout(self.settings.completion_timeout, self.client.complete(request)).await {
            Ok(Ok(response)) => {
                self.budget.record(&response.usage);
                rollout.trajectory.token_usage.add(&response.usage);
                Event::ModelResponded(response.into())
            }
            Ok(Err(err)) => Event::ModelFailed(err),
            Err(_) => Event::ModelFailed(CompletionError::timeout(format!(
                "no response within {}s",
                self.settings.completion_timeout.as_secs()
            ))),
        }
    }

    async fn invoke_tool(&self, offered: &BTreeSet<String>, call: &ToolCall) -> ToolResult {
        if !offered.contains(&call.name) {
            return ToolResult::failure(call, format!("Tool '{}' is not available for this task", call.name));
        }
        self.tools.invoke(call).await
    }

    fn stop_reason(&self, shutdown: &ShutdownSignal) -> Option<&'static str> {
        if shutdown.is_triggered() {
            Some("cancelled")
        } else if self.budget.is_exhausted() {
            Some("token budget exhausted")
        } else {
            None
        }
    }

    fn finish(&self, rollout: Rollout) -> RolloutOutcome {
        let Rollout {
            mut trajectory,
            state,
            ..
        } = rollout;

        trajectory.model_turns = state.turns();
        trajectory.status = state.status();
        if let MachineState::Failed { error, .. } = state {
            trajectory.error = Some(error);
        }
        trajectory.finished_at = Some(Utc::now());

        match trajectory.status {
            TrajectoryStatus::Failed => warn!(
                task_id = %trajectory.task_id,
                turns = trajectory.model_turns,
                error = ?trajectory.error.as_ref().map(|e| e.to_string()),
                "Trajectory failed"
            ),
            status => info!(
                task_id = %trajectory.task_id,
                status = %status,
                turns = trajectory.model_turns,
                tokens = trajectory.token_usage.total_tokens,
                "Trajectory finished"
            ),
        }

        RolloutOutcome::Finished(trajectory)
    }

    fn interrupt(&self, rollout: Rollout, reason: &str) -> RolloutOutcome {
        let mut trajectory = rollout.trajectory;
        trajectory.model_turns = rollout.state.turns();
        trajectory.status = rollout.state.status();
        info!(task_id = %trajectory.task_id, reason = reason, "Trajectory interrupted");
        RolloutOutcome::Interrupted(trajectory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Mutex;

    use crate::error::CompletionErrorKind;
    use crate::llm::CompletionResponse;
    use crate::trajectory::retry::RetryPolicy;
    use crate::trajectory::{TokenUsage, Turn};

    /// Mock completion client replaying scripted responses.
    struct ScriptedClient {
        script: Mutex<VecDeque<Result<CompletionResponse, CompletionError>>>,
        fallback: Result<CompletionResponse, CompletionError>,
        calls: AtomicU32,
    }

    impl ScriptedClient {
        fn new(
            script: Vec<Result<CompletionResponse, CompletionError>>,
            fallback: Result<CompletionResponse, CompletionError>,
        ) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedClient {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, CompletionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().await.pop_front();
            next.unwrap_or_else(|| self.fallback.clone())
        }
    }

    /// Mock invoker with one tool that echoes its arguments.
    struct EchoInvoker;

    #[async_trait]
    impl ToolInvoker for EchoInvoker {
        fn catalog(&self, _toolsets: &[String]) -> Vec<ToolSchema> {
            vec![ToolSchema::new("echo", "Echo arguments", json!({"type": "object"}))]
        }

        async fn invoke(&self, call: &ToolCall) -> ToolResult {
            ToolResult::success(call, call.arguments.to_string())
        }
    }

    fn driver(client: Arc<ScriptedClient>, max_turns: u32, max_attempts: u32, budget: RunBudget) -> TrajectoryDriver {
        let settings = RolloutSettings {
            model: "mock-model".to_string(),
            limits: Limits {
                max_turns,
                retry: RetryPolicy::new(max_attempts).with_base_delay(Duration::from_millis(10)),
            },
            ..Default::default()
        };
        TrajectoryDriver::new(client, Arc::new(EchoInvoker), Arc::new(budget), settings)
    }

    fn echo_call(id: &str) -> CompletionResponse {
        CompletionResponse::tool_calls(vec![ToolCall::new(id, "echo", json!({"x": id}))])
            .with_usage(TokenUsage::new(10, 5))
    }

    fn task() -> Task {
        Task::new(0, "Find the answer")
    }

    #[tokio::test]
    async fn test_text_reply_completes() {
        let client = Arc::new(ScriptedClient::new(vec![], Ok(CompletionResponse::text("42"))));
        let driver = driver(client.clone(), 5, 3, RunBudget::unlimited());

        let outcome = driver.run(&task(), "unweighted", &[], &ShutdownSignal::new()).await;
        assert!(outcome.is_finished());
        let trajectory = outcome.trajectory();
        assert_eq!(trajectory.status, TrajectoryStatus::Completed);
        assert_eq!(trajectory.turns.len(), 2);
        assert_eq!(trajectory.model_turns, 1);
        assert!(trajectory.finished_at.is_some());
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_tool_loop_truncates_at_budget() {
        let client = Arc::new(ScriptedClient::new(vec![], Ok(echo_call("c"))));
        let driver = driver(client.clone(), 4, 3, RunBudget::unlimited());

        let outcome = driver.run(&task(), "unweighted", &[], &ShutdownSignal::new()).await;
        let trajectory = outcome.trajectory();
        assert_eq!(trajectory.status, TrajectoryStatus::Truncated);
        assert_eq!(trajectory.model_turns, 4);
        assert_eq!(trajectory.turns.iter().filter(|t| t.is_model()).count(), 4);
        assert_eq!(trajectory.turns.len(), 1 + 4 * 2);
        assert!(trajectory.dangling_tool_calls().is_empty());
        assert_eq!(trajectory.token_usage.total_tokens, 60);
        assert_eq!(client.calls(), 4);
    }

    #[tokio::test]
    async fn test_tool_then_text() {
        let client = Arc::new(ScriptedClient::new(
            vec![Ok(echo_call("a"))],
            Ok(CompletionResponse::text("done")),
        ));
        let driver = driver(client, 5, 3, RunBudget::unlimited());

        let outcome = driver.run(&task(), "unweighted", &[], &ShutdownSignal::new()).await;
        let trajectory = outcome.trajectory();
        assert_eq!(trajectory.status, TrajectoryStatus::Completed);
        assert!(matches!(&trajectory.turns[2], Turn::Tool(result) if !result.is_error));
    }

    #[tokio::test]
    async fn test_unavailable_tool_is_tool_failure() {
        let call = ToolCall::new("x", "browser_click", json!({}));
        let client = Arc::new(ScriptedClient::new(
            vec![Ok(CompletionResponse::tool_calls(vec![call]))],
            Ok(CompletionResponse::text("ok")),
        ));
        let driver = driver(client, 5, 3, RunBudget::unlimited());

        let outcome = driver.run(&task(), "unweighted", &[], &ShutdownSignal::new()).await;
        let trajectory = outcome.trajectory();
        assert_eq!(trajectory.status, TrajectoryStatus::Completed);
        assert!(matches!(&trajectory.turns[2], Turn::Tool(result) if result.is_error));
    }

    #[tokio::test]
    async fn test_retry_bound_is_exact() {
        let client = Arc::new(ScriptedClient::new(
            vec![],
            Err(CompletionError::rate_limited("429")),
        ));
        let driver = driver(client.clone(), 5, 4, RunBudget::unlimited());

        let outcome = driver.run(&task(), "unweighted", &[], &ShutdownSignal::new()).await;
        let trajectory = outcome.trajectory();
        assert_eq!(trajectory.status, TrajectoryStatus::Failed);
        assert_eq!(client.calls(), 4);
        assert_eq!(trajectory.retries, 3);
        assert!(matches!(
            trajectory.error,
            Some(TrajectoryError::RetriesExhausted {
                attempts: 4,
                kind: CompletionErrorKind::RateLimited,
                ..
            })
        ));
        assert_eq!(trajectory.turns.len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_recovers() {
        let client = Arc::new(ScriptedClient::new(
            vec![Err(CompletionError::transport("reset")), Err(CompletionError::timeout("slow"))],
            Ok(CompletionResponse::text("fine")),
        ));
        let driver = driver(client.clone(), 5, 3, RunBudget::unlimited());

        let outcome = driver.run(&task(), "unweighted", &[], &ShutdownSignal::new()).await;
        assert_eq!(outcome.trajectory().status, TrajectoryStatus::Completed);
        assert_eq!(outcome.trajectory().retries, 2);
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_fails_without_retry() {
        let client = Arc::new(ScriptedClient::new(vec![], Err(CompletionError::fatal("401"))));
        let driver = driver(client.clone(), 5, 3, RunBudget::unlimited());

        let outcome = driver.run(&task(), "unweighted", &[], &ShutdownSignal::new()).await;
        assert_eq!(outcome.trajectory().status, TrajectoryStatus::Failed);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_is_interrupted() {
        let client = Arc::new(ScriptedClient::new(vec![], Ok(CompletionResponse::text("x"))));
        let driver = driver(client.clone(), 5, 3, RunBudget::unlimited());
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();

        let outcome = driver.run(&task(), "unweighted", &[], &shutdown).await;
        assert!(!outcome.is_finished());
        assert_eq!(client.calls(), 0);
        assert_eq!(outcome.trajectory().status, TrajectoryStatus::InProgress);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_interrupts() {
        let client = Arc::new(ScriptedClient::new(vec![], Ok(echo_call("c"))));
        let driver = driver(client.clone(), 10, 3, RunBudget::unlimited().with_token_limit(Some(30)));

        let outcome = driver.run(&task(), "unweighted", &[], &ShutdownSignal::new()).await;
        assert!(!outcome.is_finished());
        assert_eq!(client.calls(), 2);
    }
}
