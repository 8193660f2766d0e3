//! Task definitions for trajectory generation.
//!
//! A task is one natural-language prompt, optionally tagged with a category.
//! Tasks are immutable once loaded.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of hex characters kept from the prompt digest.
const ID_HEX_LEN: usize = 16;

/// A single task to roll out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Stable identifier, used as the checkpoint key.
    pub id: String,
    /// Position of the task in the input dataset.
    pub position: usize,
    /// The prompt handed to the model as the first user turn.
    pub prompt: String,
    /// Optional category label used for distribution matching.
    #[serde(default)]
    pub category: Option<String>,
    /// Extra fields from the input record, carried into the checkpoint.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Task {
    /// Creates a task whose id is derived from its prompt and position.
    pub fn new(position: usize, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        Self {
            id: derive_task_id(position, &prompt),
            position,
            prompt,
            category: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// Sets the category label.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Overrides the derived id with an explicit one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the metadata map.
    pub fn with_metadata(mut self, metadata: serde_json::Map<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Derives a task id from its position and prompt.
///
/// Reruns over the same dataset produce the same ids, which is what makes
/// checkpoint-based resume work.
pub fn derive_task_id(position: usize, prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(position.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(prompt.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("task-{}", &digest[..ID_HEX_LEN])
}
