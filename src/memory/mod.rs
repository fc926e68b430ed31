//! Memory accessor handed to steps.
//!
//! The engine only needs a narrow contract: keyed get/set plus a recall query.
//! Vector stores and other long-term backends implement `MemoryAccessor`
//! outside this crate; `InMemoryMemory` covers tests and single-process use.

mod in_memory;

pub use in_memory::InMemoryMemory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stored memory item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub stored_at: DateTime<Utc>,
}

/// A recalled item with its relevance score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallHit {
    pub entry: MemoryEntry,
    /// Higher is more relevant
    pub score: f64,
}

/// Shared memory available to every step of every task.
#[async_trait]
pub trait MemoryAccessor: Send + Sync {
    async fn get(&self, key: &str) -> Option<serde_json::Value>;

    async fn set(&self, key: &str, value: serde_json::Value) -> anyhow::Result<()>;

    /// Most relevant entries for `query`, best first, at most `limit`.
    async fn recall(&self, query: &str, limit: usize) -> anyhow::Result<Vec<RecallHit>>;
}
