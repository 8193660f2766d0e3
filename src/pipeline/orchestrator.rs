//! Run orchestrator tying the subsystems together.
//!
//! A run proceeds in a fixed order, and every configuration problem is
//! reported before the first task is dispatched:
//!
//! 1. Validate the configuration and load the dataset
//! 2. Resolve the distribution and check its toolsets against the registry
//! 3. Sample the work queue
//! 4. Lock and open the checkpoint log (refusing a non-empty log without resume)
//! 5. Drive the worker pool and log the summary

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use super::config::RunConfig;
use crate::checkpoint::{CheckpointStore, JsonlCheckpointStore, RunLock};
use crate::dataset::{load_tasks, DistributionSpec, SamplePlan, TaskSampler};
use crate::error::{CheckpointError, CompletionError, ConfigError, DatasetError};
use crate::llm::{CompletionClient, OpenAiClient, RunBudget};
use crate::scheduler::{PoolError, RunSummary, ShutdownSignal, WorkerPool, WorkerPoolConfig};
use crate::tools::ToolRegistry;
use crate::trajectory::TrajectoryDriver;

/// Errors that abort a run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    /// The completion client could not be constructed.
    #[error("Completion client error: {0}")]
    Client(CompletionError),
}

/// A sampled work queue together with the distribution that produced it.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub plan: SamplePlan,
    pub distribution: DistributionSpec,
    /// Tasks read from the dataset before sampling.
    pub loaded: usize,
}

/// Coordinates one generation run from dataset to checkpoint log.
pub struct Orchestrator {
    config: RunConfig,
    client: Option<Arc<dyn CompletionClient>>,
    tools: Option<ToolRegistry>,
    shutdown: ShutdownSignal,
}

impl Orchestrator {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            client: None,
            tools: None,
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Uses `client` instead of an HTTP client built from the configuration.
    pub fn with_client(mut self, client: Arc<dyn CompletionClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Uses `tools` instead of the built-in registry.
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Handle that cancels the run when triggered.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Loads and samples the dataset without touching the checkpoint log.
    pub async fn prepare(&self) -> Result<PreparedRun, PipelineError> {
        self.config.validate()?;
        let dataset_path = self
            .config
            .dataset_path
            .as_ref()
            .ok_or_else(|| ConfigError::Missing("dataset path".to_string()))?;

        let tasks = load_tasks(dataset_path).await?;
        let distribution = self.config.distribution.load()?;

        let toolset_names = match &self.tools {
            Some(tools) => tools.toolset_names(),
            None => ToolRegistry::with_builtin_tools().toolset_names(),
        };
        distribution.validate_toolsets(&toolset_names)?;

        let plan = TaskSampler::new(&distribution)
            .with_seed(self.config.seed)
            .with_limit(self.config.limit)
            .sample(&tasks)?;

        info!(
            dataset = %dataset_path.display(),
            loaded = tasks.len(),
            sampled = plan.len(),
            seed = self.config.seed,
            "Sampled work queue"
        );
        for (bucket, count) in &plan.counts {
            info!(bucket = %bucket, count = count, "Bucket target");
        }

        Ok(PreparedRun {
            plan,
            distribution,
            loaded: tasks.len(),
        })
    }

    /// Executes the run and returns its summary.
    pub async fn run(self) -> Result<RunSummary, PipelineError> {
        let prepared = self.prepare().await?;
        let config = &self.config;

        let _lock = RunLock::acquire(&config.checkpoint_path)?;
        let store = JsonlCheckpointStore::open(&config.checkpoint_path).await?;
        let existing = store.len().await;
        if existing > 0 && !config.resume {
            return Err(ConfigError::CheckpointExists {
                path: config.checkpoint_path.display().to_string(),
                records: existing,
            }
            .into());
        }
        if config.resume {
            info!(
                checkpoint = %config.checkpoint_path.display(),
                records = existing,
                "Resuming from checkpoint log"
            );
        }

        let budget = Arc::new(
            RunBudget::unlimited()
                .with_token_limit(config.token_budget)
                .with_requests_per_minute(config.requests_per_minute),
        );

        let client: Arc<dyn CompletionClient> = match self.client {
            Some(client) => client,
            None => {
                let client = OpenAiClient::with_timeout(
                    config.api_base.clone(),
                    config.api_key.clone(),
                    config.completion_timeout,
                )
                .map_err(PipelineError::Client)?;
                info!(
                    api_base = %client.base_url(),
                    api_key = %client.api_key_masked(),
                    model = %config.model,
                    "Completion client ready"
                );
                Arc::new(client)
            }
        };

        let tools = self
            .tools
            .unwrap_or_else(|| ToolRegistry::with_builtin_tools().with_call_timeout(config.tool_timeout));

        let driver = Arc::new(TrajectoryDriver::new(
            client,
            Arc::new(tools),
            Arc::clone(&budget),
            config.to_rollout_settings(),
        ));

        let pool = WorkerPool::new(
            WorkerPoolConfig::new(config.workers).with_progress_interval(config.progress_interval),
            driver,
            Arc::new(store),
            Arc::new(prepared.distribution),
            budget,
        )
        .with_shutdown(self.shutdown.clone());

        let summary = pool.run(prepared.plan).await?;
        summary.log();
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::CategorySpec;
    use crate::llm::{CompletionRequest, CompletionResponse};
    use async_trait::async_trait;
    use std::path::Path;

    struct TextClient;

    #[async_trait]
    impl CompletionClient for TextClient {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, CompletionError> {
            Ok(CompletionResponse::text("done"))
        }
    }

    async fn write_dataset(dir: &Path, count: usize) -> std::path::PathBuf {
        let path = dir.join("tasks.jsonl");
        let body: String = (0..count)
            .map(|i| format!("{{\"prompt\": \"task {}\"}}\n", i))
            .collect();
        tokio::fs::write(&path, body).await.expect("write dataset");
        path
    }

    fn config_for(dir: &Path, dataset: std::path::PathBuf) -> RunConfig {
        RunConfig::new()
            .with_dataset_path(dataset)
            .with_model("test-model")
            .with_checkpoint_path(dir.join("out.jsonl"))
            .with_workers(2)
    }

    #[tokio::test]
    async fn test_prepare_rejects_unknown_toolset() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dataset = write_dataset(dir.path(), 3).await;
        let config = config_for(dir.path(), dataset).with_distribution(
            DistributionSpec::uniform()
                .with_category_spec("web", CategorySpec::new(1.0).with_toolsets(vec!["vision".to_string()])),
        );

        let err = Orchestrator::new(config).prepare().await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Config(ConfigError::UnknownToolset { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_refuses_existing_log_without_resume() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dataset = write_dataset(dir.path(), 3).await;
        let config = config_for(dir.path(), dataset);

        let first = Orchestrator::new(config.clone())
            .with_client(Arc::new(TextClient))
            .with_tools(ToolRegistry::new())
            .run()
            .await
            .expect("first run");
        assert_eq!(first.completed, 3);

        let err = Orchestrator::new(config)
            .with_client(Arc::new(TextClient))
            .with_tools(ToolRegistry::new())
            .run()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Config(ConfigError::CheckpointExists { records: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_run_releases_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dataset = write_dataset(dir.path(), 1).await;
        let config = config_for(dir.path(), dataset);
        let checkpoint = config.checkpoint_path.clone();

        Orchestrator::new(config)
            .with_client(Arc::new(TextClient))
            .with_tools(ToolRegistry::new())
            .run()
            .await
            .expect("run");

        assert!(!RunLock::lock_path(&checkpoint).exists());
    }

    #[tokio::test]
    async fn test_run_refuses_log_locked_in_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dataset = write_dataset(dir.path(), 2).await;
        let config = config_for(dir.path(), dataset).with_resume(true);

        let held = RunLock::acquire(&config.checkpoint_path).expect("acquire");
        let err = Orchestrator::new(config)
            .with_client(Arc::new(TextClient))
            .with_tools(ToolRegistry::new())
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(ConfigError::Locked { .. })));
        assert!(held.path().exists());
    }

    #[tokio::test]
    async fn test_missing_dataset_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = config_for(dir.path(), dir.path().join("absent.jsonl"));
        let err = Orchestrator::new(config).prepare().await.unwrap_err();
        assert!(matches!(err, PipelineError::Dataset(_)));
    }
}
