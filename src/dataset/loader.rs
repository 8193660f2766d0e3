//! Dataset loading.
//!
//! Reads task records from a JSON Lines file (one object per line) or from a
//! file holding a single JSON array of the same objects.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use tokio::fs;

use super::task::Task;
use crate::error::DatasetError;

/// One input record as it appears in the dataset file.
#[derive(Debug, Deserialize)]
struct TaskRecord {
    prompt: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

/// Loads all tasks from `path`.
pub async fn load_tasks(path: impl AsRef<Path>) -> Result<Vec<Task>, DatasetError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(DatasetError::NotFound(path.display().to_string()));
    }
    let contents = fs::read_to_string(path).await?;
    let tasks = parse_tasks(&contents)?;
    tracing::info!(path = %path.display(), tasks = tasks.len(), "Loaded dataset");
    Ok(tasks)
}

/// Parses dataset contents into tasks, in input order.
pub fn parse_tasks(contents: &str) -> Result<Vec<Task>, DatasetError> {
    let records = if contents.trim_start().starts_with('[') {
        let records: Vec<TaskRecord> = serde_json::from_str(contents)?;
        records
            .into_iter()
            .enumerate()
            .map(|(i, r)| (i + 1, r))
            .collect::<Vec<_>>()
    } else {
        let mut records = Vec::new();
        for (i, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record: TaskRecord =
                serde_json::from_str(line).map_err(|e| DatasetError::MalformedRecord {
                    line: i + 1,
                    message: e.to_string(),
                })?;
            records.push((i + 1, record));
        }
        records
    };

    let mut seen = HashSet::new();
    let mut tasks = Vec::with_capacity(records.len());
    for (position, (line, record)) in records.into_iter().enumerate() {
        if record.prompt.trim().is_empty() {
            return Err(DatasetError::EmptyPrompt { line });
        }

        let mut task = Task::new(position, record.prompt).with_metadata(record.extra);
        if let Some(id) = record.id {
            task = task.with_id(id);
        }
        if let Some(category) = record.category.filter(|c| !c.trim().is_empty()) {
            task = task.with_category(category);
        }

        if !seen.insert(task.id.clone()) {
            return Err(DatasetError::DuplicateId(task.id));
        }
        tasks.push(task);
    }

    Ok(tasks)
}
