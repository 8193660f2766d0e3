//! End-of-run accounting.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointRecord;
use crate::dataset::Shortfall;
use crate::trajectory::TrajectoryStatus;

/// Counts reported when a run ends.
///
/// Two identities always hold for a run that returned normally:
/// `completed + truncated + failed + interrupted == dispatched` and
/// `dispatched + skipped_as_checkpointed + not_dispatched == total_input`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Tasks in the sampled work queue.
    pub total_input: usize,
    /// Tasks skipped because the checkpoint log already holds them.
    pub skipped_as_checkpointed: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub truncated: usize,
    pub failed: usize,
    /// Dispatched but stopped by cancellation or budget; not checkpointed.
    pub interrupted: usize,
    /// Left in the queue when dispatch stopped.
    pub not_dispatched: usize,
    pub shortfalls: Vec<Shortfall>,
    pub peak_active: usize,
    pub total_tokens: u64,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
}

impl RunSummary {
    /// Whether both accounting identities hold.
    pub fn is_consistent(&self) -> bool {
        self.completed + self.truncated + self.failed + self.interrupted == self.dispatched
            && self.dispatched + self.skipped_as_checkpointed + self.not_dispatched == self.total_input
    }

    /// Emits the summary as one structured log line plus one per shortfall.
    pub fn log(&self) {
        tracing::info!(
            total_input = self.total_input,
            skipped = self.skipped_as_checkpointed,
            dispatched = self.dispatched,
            completed = self.completed,
            truncated = self.truncated,
            failed = self.failed,
            interrupted = self.interrupted,
            not_dispatched = self.not_dispatched,
            peak_active = self.peak_active,
            total_tokens = self.total_tokens,
            elapsed_secs = self.elapsed.as_secs(),
            "Run finished"
        );
        for shortfall in &self.shortfalls {
            tracing::warn!(
                category = %shortfall.category,
                requested = shortfall.requested,
                available = shortfall.available,
                "Category shortfall"
            );
        }
    }
}

/// Status counts over a checkpoint log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointStats {
    pub total: usize,
    pub completed: usize,
    pub truncated: usize,
    pub failed: usize,
    /// Records per category.
    pub by_category: BTreeMap<String, usize>,
}

impl CheckpointStats {
    pub fn from_records(records: &[CheckpointRecord]) -> Self {
        let mut stats = Self::default();
        for record in records {
            stats.total += 1;
            match record.status {
                TrajectoryStatus::Completed => stats.completed += 1,
                TrajectoryStatus::Truncated => stats.truncated += 1,
                _ => stats.failed += 1,
            }
            *stats.by_category.entry(record.category.clone()).or_insert(0) += 1;
        }
        stats
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}
