//! Checkpoint record: one finished trajectory keyed by task id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dataset::Task;
use crate::error::CheckpointError;
use crate::trajectory::{Trajectory, TrajectoryStatus};

/// Durable record of a task that reached a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub task_id: String,
    /// Terminal status: completed, truncated or failed.
    pub status: TrajectoryStatus,
    /// Distribution bucket the task was sampled from.
    pub category: String,
    /// Extra fields carried over from the input record.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub trajectory: Trajectory,
    pub recorded_at: DateTime<Utc>,
}

impl CheckpointRecord {
    /// Builds a record for `task` from its finished trajectory.
    ///
    /// Fails with [`CheckpointError::NotTerminal`] if the trajectory is still
    /// pending or in progress.
    pub fn from_trajectory(task: &Task, trajectory: Trajectory) -> Result<Self, CheckpointError> {
        if !trajectory.status.is_terminal() {
            return Err(CheckpointError::NotTerminal(task.id.clone()));
        }

        Ok(Self {
            task_id: task.id.clone(),
            status: trajectory.status,
            category: trajectory.category.clone(),
            metadata: task.metadata.clone(),
            trajectory,
            recorded_at: Utc::now(),
        })
    }
}
