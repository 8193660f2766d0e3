//! Progress counters and the background monitor that logs them.
//!
//! Long generation runs are tracked from the logs alone: the monitor wakes
//! every interval and emits one structured line with the current counts.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::trajectory::TrajectoryStatus;

/// Snapshot of scheduler progress at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub dispatched: usize,
    pub completed: usize,
    pub truncated: usize,
    pub failed: usize,
    pub interrupted: usize,
    /// Trajectories currently executing.
    pub active: usize,
    /// Highest value `active` has reached.
    pub peak_active: usize,
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    /// Trajectories that reached a terminal status.
    pub fn finished(&self) -> usize {
        self.completed + self.truncated + self.failed
    }
}

/// Shared atomic counters updated by workers.
///
/// Clones share the same underlying counters.
#[derive(Debug, Clone, Default)]
pub struct ProgressCounters {
    dispatched: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
    truncated: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
    interrupted: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    peak_active: Arc<AtomicUsize>,
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// A worker claimed a task.
    pub fn task_started(&self) {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);
    }

    /// A worker released its slot after a terminal trajectory was persisted.
    pub fn task_finished(&self, status: TrajectoryStatus) {
        match status {
            TrajectoryStatus::Completed => self.completed.fetch_add(1, Ordering::SeqCst),
            TrajectoryStatus::Truncated => self.truncated.fetch_add(1, Ordering::SeqCst),
            _ => self.failed.fetch_add(1, Ordering::SeqCst),
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// A worker released its slot without a checkpoint.
    pub fn task_interrupted(&self) {
        self.interrupted.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Take a snapshot of the current counter values.
    pub fn snapshot(&self, start: Instant) -> ProgressSnapshot {
        ProgressSnapshot {
            dispatched: self.dispatched.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            truncated: self.truncated.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            interrupted: self.interrupted.load(Ordering::SeqCst),
            active: self.active.load(Ordering::SeqCst),
            peak_active: self.peak_active.load(Ordering::SeqCst),
            elapsed: start.elapsed(),
        }
    }
}

/// A background task that periodically logs scheduler progress.
///
/// Call [`ProgressMonitor::stop`] to cancel.
pub struct ProgressMonitor {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    /// Start a background monitor that logs every `interval`.
    ///
    /// `total` is the number of tasks queued for dispatch, used for the
    /// progress percentage.
    pub fn start(counters: ProgressCounters, total: usize, interval: Duration) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();
        let start = Instant::now();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick

            loop {
                tick.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }

                let snap = counters.snapshot(start);
                let pct = if total > 0 {
                    (snap.finished() as f64 / total as f64 * 100.0).min(100.0)
                } else {
                    0.0
                };
                let elapsed_secs = snap.elapsed.as_secs_f64();
                let per_min = if elapsed_secs > 0.0 {
                    snap.finished() as f64 / elapsed_secs * 60.0
                } else {
                    0.0
                };

                tracing::info!(
                    dispatched = snap.dispatched,
                    completed = snap.completed,
                    truncated = snap.truncated,
                    failed = snap.failed,
                    interrupted = snap.interrupted,
                    active = snap.active,
                    peak_active = snap.peak_active,
                    total = total,
                    progress_pct = format!("{:.1}%", pct),
                    elapsed_secs = snap.elapsed.as_secs(),
                    finished_per_min = format!("{:.2}", per_min),
                    "Generation progress"
                );
            }
        });

        Self {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signal the background monitor to stop and wait for it to finish.
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
