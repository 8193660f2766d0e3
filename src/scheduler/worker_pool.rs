//! Bounded worker pool that executes sampled tasks.
//!
//! The pool spawns a fixed number of workers. Each worker repeatedly takes
//! the next task from a shared queue, drives its trajectory to the end, and
//! appends the result to the checkpoint store before taking another task.
//! The number of trajectories in flight therefore never exceeds the number
//! of workers.
//!
//! # Features
//!
//! - Resume: tasks already present in the checkpoint store are skipped
//! - Graceful cancellation through a shared [`ShutdownSignal`]
//! - Dispatch stops once the shared token budget is spent
//! - Periodic progress logging and an end-of-run [`RunSummary`]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::progress::{ProgressCounters, ProgressMonitor};
use super::shutdown::ShutdownSignal;
use super::summary::RunSummary;
use crate::checkpoint::{AppendOutcome, CheckpointRecord, CheckpointStore};
use crate::dataset::{DistributionSpec, SamplePlan, SampledTask};
use crate::error::CheckpointError;
use crate::llm::RunBudget;
use crate::trajectory::{RolloutOutcome, TrajectoryDriver};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A finished trajectory could not be persisted.
    #[error("Checkpoint write failed: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// A worker task panicked.
    #[error("Worker {worker_id} panicked: {message}")]
    WorkerPanicked { worker_id: usize, message: String },
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Maximum number of trajectories executing at once.
    pub num_workers: usize,
    /// How often the progress monitor logs.
    pub progress_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            progress_interval: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Sets the progress log interval.
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }
}

/// Everything a worker needs, shared by all workers.
struct Shared {
    queue: Mutex<VecDeque<SampledTask>>,
    driver: Arc<TrajectoryDriver>,
    store: Arc<dyn CheckpointStore>,
    distribution: Arc<DistributionSpec>,
    budget: Arc<RunBudget>,
    shutdown: ShutdownSignal,
    counters: ProgressCounters,
}

/// Worker pool executing one run's work queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    driver: Arc<TrajectoryDriver>,
    store: Arc<dyn CheckpointStore>,
    distribution: Arc<DistributionSpec>,
    budget: Arc<RunBudget>,
    shutdown: ShutdownSignal,
    counters: ProgressCounters,
}

impl WorkerPool {
    /// Creates a new worker pool.
    ///
    /// `distribution` supplies the toolsets offered per bucket; `budget` must
    /// be the same handle the driver records usage against.
    pub fn new(
        config: WorkerPoolConfig,
        driver: Arc<TrajectoryDriver>,
        store: Arc<dyn CheckpointStore>,
        distribution: Arc<DistributionSpec>,
        budget: Arc<RunBudget>,
    ) -> Self {
        Self {
            config,
            driver,
            store,
            distribution,
            budget,
            shutdown: ShutdownSignal::new(),
            counters: ProgressCounters::new(),
        }
    }

    /// Uses an externally owned cancellation signal.
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Handle that cancels this pool's run when triggered.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Live counters, shared with the running workers.
    pub fn counters(&self) -> ProgressCounters {
        self.counters.clone()
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    /// Removes tasks that already have a checkpoint record.
    ///
    /// Returns the remaining queue and the number skipped.
    pub async fn filter_checkpointed(&self, tasks: Vec<SampledTask>) -> (VecDeque<SampledTask>, usize) {
        let mut pending = VecDeque::with_capacity(tasks.len());
        let mut skipped = 0;
        for item in tasks {
            if self.store.has(&item.task.id).await {
                skipped += 1;
            } else {
                pending.push_back(item);
            }
        }
        (pending, skipped)
    }

    /// Executes every task in `plan` that is not already checkpointed.
    ///
    /// Returns once the queue is drained, or once cancellation or budget
    /// exhaustion has stopped dispatch and in-flight trajectories have
    /// wound down.
    pub async fn run(&self, plan: SamplePlan) -> Result<RunSummary, PoolError> {
        let start = Instant::now();
        let total_input = plan.len();
        let shortfalls = plan.shortfalls;

        let (pending, skipped) = self.filter_checkpointed(plan.tasks).await;
        if skipped > 0 {
            info!(skipped = skipped, "Skipping tasks already present in checkpoint log");
        }

        let queued = pending.len();
        let num_workers = self.config.num_workers.max(1).min(queued.max(1));

        let shared = Arc::new(Shared {
            queue: Mutex::new(pending),
            driver: Arc::clone(&self.driver),
            store: Arc::clone(&self.store),
            distribution: Arc::clone(&self.distribution),
            budget: Arc::clone(&self.budget),
            shutdown: self.shutdown.clone(),
            counters: self.counters.clone(),
        });

        let monitor = ProgressMonitor::start(self.counters.clone(), queued, self.config.progress_interval);

        info!(
            total_input = total_input,
            queued = queued,
            num_workers = num_workers,
            "Worker pool started"
        );

        let handles: Vec<JoinHandle<Result<(), PoolError>>> = (0..num_workers)
            .map(|worker_id| {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move { Worker { id: worker_id, shared }.run().await })
            })
            .collect();

        let mut first_error = None;
        for (worker_id, handle) in handles.into_iter().enumerate() {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    self.shutdown.trigger();
                    Err(PoolError::WorkerPanicked {
                        worker_id,
                        message: e.to_string(),
                    })
                }
            };
            if let Err(e) = result {
                error!(worker_id = worker_id, error = %e, "Worker stopped with error");
                first_error.get_or_insert(e);
            }
        }

        monitor.stop().await;

        if let Some(e) = first_error {
            return Err(e);
        }

        let not_dispatched = shared.queue.lock().await.len();
        let snap = self.counters.snapshot(start);

        let summary = RunSummary {
            total_input,
            skipped_as_checkpointed: skipped,
            dispatched: snap.dispatched,
            completed: snap.completed,
            truncated: snap.truncated,
            failed: snap.failed,
            interrupted: snap.interrupted,
            not_dispatched,
            shortfalls,
            peak_active: snap.peak_active,
            total_tokens: self.budget.tokens_used(),
            elapsed: start.elapsed(),
        };

        if !summary.is_consistent() {
            warn!(?summary, "Run summary counts do not add up");
        }

        Ok(summary)
    }
}

/// A single worker pulling tasks from the shared queue.
struct Worker {
    id: usize,
    shared: Arc<Shared>,
}

impl Worker {
    async fn run(self) -> Result<(), PoolError> {
        debug!(worker_id = self.id, "Worker started");

        loop {
            if self.shared.shutdown.is_triggered() {
                info!(worker_id = self.id, "Worker received shutdown signal");
                break;
            }
            if self.shared.budget.is_exhausted() {
                info!(worker_id = self.id, "Token budget exhausted, worker stopping");
                break;
            }

            let Some(item) = self.shared.queue.lock().await.pop_front() else {
                break;
            };

            self.process(item).await?;
        }

        debug!(worker_id = self.id, "Worker stopped");
        Ok(())
    }

    async fn process(&self, item: SampledTask) -> Result<(), PoolError> {
        let shared = &self.shared;
        shared.counters.task_started();

        debug!(
            worker_id = self.id,
            task_id = %item.task.id,
            bucket = %item.bucket,
            "Dispatching task"
        );

        let toolsets = shared.distribution.toolsets(&item.bucket);
        let outcome = shared
            .driver
            .run(&item.task, &item.bucket, toolsets, &shared.shutdown)
            .await;

        let trajectory = match outcome {
            RolloutOutcome::Finished(trajectory) => trajectory,
            RolloutOutcome::Interrupted(_) => {
                shared.counters.task_interrupted();
                return Ok(());
            }
        };

        let status = trajectory.status;
        let persisted = match CheckpointRecord::from_trajectory(&item.task, trajectory) {
            Ok(record) => shared.store.append(record).await,
            Err(e) => Err(e),
        };

        match persisted {
            Ok(AppendOutcome::Written) => {
                shared.counters.task_finished(status);
                Ok(())
            }
            Ok(AppendOutcome::AlreadyPresent) => {
                warn!(worker_id = self.id, task_id = %item.task.id, "Task was already checkpointed");
                shared.counters.task_finished(status);
                Ok(())
            }
            Err(e) => {
                // Durability is lost; stop the run rather than keep generating.
                shared.counters.task_interrupted();
                shared.shutdown.trigger();
                Err(e.into())
            }
        }
    }
}
