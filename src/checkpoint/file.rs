//! JSON file-based checkpoint store.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

use super::{sort_summaries, CheckpointData, CheckpointStore, CheckpointSummary};
use crate::error::CheckpointError;

const FILE_NAME: &str = "checkpoints.json";

#[derive(Debug, Serialize, Deserialize, Default)]
struct CheckpointFileSnapshot {
    checkpoints: HashMap<String, CheckpointData>,
}

#[derive(Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
    checkpoints: Arc<RwLock<HashMap<String, CheckpointData>>>,
    persist_lock: Arc<Mutex<()>>,
}

impl FileCheckpointStore {
    pub async fn new(base_dir: PathBuf) -> Result<Self, CheckpointError> {
        fs::create_dir_all(&base_dir).await?;
        let path = base_dir.join(FILE_NAME);
        let snapshot = match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<CheckpointFileSnapshot>(&bytes) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to parse checkpoint file");
                    CheckpointFileSnapshot::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                CheckpointFileSnapshot::default()
            }
            Err(err) => return Err(err.into()),
        };

        tracing::debug!(
            path = %path.display(),
            count = snapshot.checkpoints.len(),
            "Opened file checkpoint store"
        );

        Ok(Self {
            path,
            checkpoints: Arc::new(RwLock::new(snapshot.checkpoints)),
            persist_lock: Arc::new(Mutex::new(())),
        })
    }

    async fn persist(&self) -> Result<(), CheckpointError> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = CheckpointFileSnapshot {
            checkpoints: self.checkpoints.read().await.clone(),
        };
        let data = serde_json::to_vec_pretty(&snapshot)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, data).await?;
        fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    fn is_persistent(&self) -> bool {
        true
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
        self.persist().await
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
    async fn test_checkpoints_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let data = sample("t1", &["a", "b", "c"], 2);

        {
            let store = FileCheckpointStore::new(dir.path().to_path_buf()).await.unwrap();
            tokio_test::assert_ok!(store.save("cp-t1-100", &data).await);
        }

        let reopened = FileCheckpointStore::new(dir.path().to_path_buf()).await.unwrap();
        let loaded = reopened.load("cp-t1-100").await.unwrap().expect("checkpoint");
        assert_eq!(loaded, data);
        assert_eq!(reopened.list("t1").await.unwrap().len(), 1);
        assert!(!dir.path().join("checkpoints.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(FILE_NAME), b"{not json").unwrap();

        let store = FileCheckpointStore::new(dir.path().to_path_buf()).await.unwrap();
        assert!(store.list("t1").await.unwrap().is_empty());
    }
}
