//! Checkpoint storage with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `file`: single JSON file, rewritten atomically on every save
//! - `sqlite`: SQLite database, one row per checkpoint

mod file;
mod memory;
mod sqlite;

pub use file::FileCheckpointStore;
pub use memory::InMemoryCheckpointStore;
pub use sqlite::SqliteCheckpointStore;

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CheckpointError;
use crate::task::{Metadata, StepConfig, TaskConfig, TaskDefinition, TaskExecutionState};

/// Serializable part of a step declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSnapshot {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub config: StepConfig,
}

/// Serializable part of a task declaration. Step callables are not persisted;
/// they are re-attached from a registered definition on resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<StepSnapshot>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl TaskSnapshot {
    pub fn from_definition(definition: &TaskDefinition) -> Self {
        Self {
            id: definition.id.clone(),
            name: definition.name.clone(),
            description: definition.description.clone(),
            steps: definition
                .steps
                .iter()
                .map(|s| StepSnapshot {
                    id: s.id.clone(),
                    name: s.name.clone(),
                    config: s.config.clone(),
                })
                .collect(),
            metadata: definition.metadata.clone(),
        }
    }

    pub fn step_ids(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.id.clone()).collect()
    }

    /// Whether `definition` declares the same steps in the same order.
    pub fn matches(&self, definition: &TaskDefinition) -> bool {
        self.id == definition.id && self.step_ids() == definition.step_ids()
    }
}

/// Everything needed to resume a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointData {
    pub task: TaskSnapshot,
    pub config: TaskConfig,
    pub state: TaskExecutionState,
    pub created_at: DateTime<Utc>,
}

impl CheckpointData {
    pub fn new(task: TaskSnapshot, config: TaskConfig, state: TaskExecutionState) -> Self {
        Self {
            task,
            config,
            state,
            created_at: Utc::now(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task.id
    }

    pub fn summary(&self, checkpoint_id: &str) -> CheckpointSummary {
        CheckpointSummary {
            checkpoint_id: checkpoint_id.to_string(),
            task_id: self.task.id.clone(),
            current_step_index: self.state.current_step_index(),
            completed_steps: self.state.completed_steps().len(),
            cost_used: self.state.cost_used(),
            created_at: self.created_at,
        }
    }
}

/// Listing entry for a stored checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub checkpoint_id: String,
    pub task_id: String,
    pub current_step_index: usize,
    pub completed_steps: usize,
    pub cost_used: f64,
    pub created_at: DateTime<Utc>,
}

static LAST_CHECKPOINT_MS: AtomicI64 = AtomicI64::new(0);

/// Generate a checkpoint id of the form `cp-{task_id}-{timestamp}`.
///
/// The timestamp is in milliseconds and strictly increasing within the
/// process, so two checkpoints taken in the same millisecond stay distinct.
pub fn generate_checkpoint_id(task_id: &str) -> String {
    let now = Utc::now().timestamp_millis();
    let mut last = LAST_CHECKPOINT_MS.load(Ordering::Relaxed);
    let ts = loop {
        let candidate = now.max(last + 1);
        match LAST_CHECKPOINT_MS.compare_exchange_weak(
            last,
            candidate,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break candidate,
            Err(current) => last = current,
        }
    };
    format!("cp-{}-{}", task_id, ts)
}

/// Sort summaries oldest first.
pub(crate) fn sort_summaries(summaries: &mut [CheckpointSummary]) {
    summaries.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.checkpoint_id.cmp(&b.checkpoint_id))
    });
}

/// Checkpoint store trait - implemented by all storage backends.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    /// Persist `data` under `checkpoint_id`, replacing any previous value.
    async fn save(&self, checkpoint_id: &str, data: &CheckpointData)
        -> Result<(), CheckpointError>;

    async fn load(&self, checkpoint_id: &str) -> Result<Option<CheckpointData>, CheckpointError>;

    /// Checkpoints of one task, oldest first.
    async fn list(&self, task_id: &str) -> Result<Vec<CheckpointSummary>, CheckpointError>;
}

/// Checkpoint store type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointStoreType {
    #[default]
    Memory,
    File,
    Sqlite,
}

impl CheckpointStoreType {
    /// Parse from a configuration value.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "file" | "json" => Some(Self::File),
            "sqlite" | "db" => Some(Self::Sqlite),
            _ => None,
        }
    }
}

/// Create a checkpoint store based on type and configuration.
pub async fn create_checkpoint_store(
    store_type: CheckpointStoreType,
    base_dir: PathBuf,
) -> Result<Arc<dyn CheckpointStore>, CheckpointError> {
    match store_type {
        CheckpointStoreType::Memory => Ok(Arc::new(InMemoryCheckpointStore::new())),
        CheckpointStoreType::File => Ok(Arc::new(FileCheckpointStore::new(base_dir).await?)),
        CheckpointStoreType::Sqlite => Ok(Arc::new(SqliteCheckpointStore::new(base_dir).await?)),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_ids_are_unique_and_prefixed() {
        let a = generate_checkpoint_id("t1");
        let b = generate_checkpoint_id("t1");
        assert!(a.starts_with("cp-t1-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_store_type_parse() {
        assert_eq!(CheckpointStoreType::parse("SQLite"), Some(CheckpointStoreType::Sqlite));
        assert_eq!(CheckpointStoreType::parse("json"), Some(CheckpointStoreType::File));
        assert_eq!(CheckpointStoreType::parse("redis"), None);
    }

    #[test]
    fn test_snapshot_summary() {
        let data = test_support::sample("t1", &["a", "b", "c"], 2);
        let summary = data.summary("cp-t1-1");
        assert_eq!(summary.task_id, "t1");
        assert_eq!(summary.current_step_index, 2);
        assert_eq!(summary.completed_steps, 2);
        assert_eq!(data.task.step_ids(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_create_memory_store() {
        let store = create_checkpoint_store(CheckpointStoreType::Memory, PathBuf::from("."))
            .await
            .expect("memory store");
        assert!(!store.is_persistent());
    }
}
