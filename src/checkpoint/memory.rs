//! In-memory checkpoint store (non-persistent).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{sort_summaries, CheckpointData, CheckpointStore, CheckpointSummary};
use crate::error::CheckpointError;

#[derive(Clone, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Arc<RwLock<HashMap<String, CheckpointData>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn save(
        &self,
        checkpoint_id: &str,
        data: &CheckpointData,
    ) -> Result<(), CheckpointError> {
        self.checkpoints
            .write()
            .await
            .insert(checkpoint_id.to_string(), data.clone());
        Ok(())
    }

    async fn load(&self, checkpoint_id: &str) -> Result<Option<CheckpointData>, CheckpointError> {
        Ok(self.checkpoints.read().await.get(checkpoint_id).cloned())
    }

    async fn list(&self, task_id: &str) -> Result<Vec<CheckpointSummary>, CheckpointError> {
        let mut summaries: Vec<CheckpointSummary> = self
            .checkpoints
            .read()
            .await
            .iter()
            .filter(|(_, data)| data.task_id() == task_id)
            .map(|(id, data)| data.summary(id))
            .collect();
        sort_summaries(&mut summaries);
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::test_support::sample;

    #[tokio::test]
    async fn test_save_load_list() {
        let store = InMemoryCheckpointStore::new();
        let first = sample("t1", &["a", "b"], 1);
        let second = sample("t1", &["a", "b"], 2);

        store.save("cp-t1-1", &first).await.unwrap();
        store.save("cp-t1-2", &second).await.unwrap();
        store.save("cp-t2-1", &sample("t2", &["x"], 0)).await.unwrap();

        let loaded = store.load("cp-t1-2").await.unwrap().expect("checkpoint");
        assert_eq!(loaded, second);
        assert!(store.load("cp-missing").await.unwrap().is_none());

        let listed = store.list("t1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|s| s.task_id == "t1"));
    }
}
