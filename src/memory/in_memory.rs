//! Process-local memory with keyword recall.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{MemoryAccessor, MemoryEntry, RecallHit};

/// Keyed memory held in a `HashMap`.
///
/// Recall scores entries by the fraction of query terms that appear in the
/// entry's key or its serialized value; ties go to the newer entry.
#[derive(Default)]
pub struct InMemoryMemory {
    entries: RwLock<HashMap<String, MemoryEntry>>,
}

impl InMemoryMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| t.to_lowercase())
        .collect()
}

#[async_trait]
impl MemoryAccessor for InMemoryMemory {
    async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.entries.read().await.get(key).map(|e| e.value.clone())
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> anyhow::Result<()> {
        let entry = MemoryEntry {
            key: key.to_string(),
            value,
            stored_at: Utc::now(),
        };
        self.entries.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn recall(&self, query: &str, limit: usize) -> anyhow::Result<Vec<RecallHit>> {
        let query_terms = terms(query);
        if query_terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let entries = self.entries.read().await;
        let mut hits: Vec<RecallHit> = entries
            .values()
            .filter_map(|entry| {
                let haystack = terms(&format!("{} {}", entry.key, entry.value));
                let matched = query_terms.intersection(&haystack).count();
                (matched > 0).then(|| RecallHit {
                    entry: entry.clone(),
                    score: matched as f64 / query_terms.len() as f64,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.entry.stored_at.cmp(&a.entry.stored_at))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}
