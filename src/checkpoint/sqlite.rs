//! SQLite-based checkpoint store.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use super::{CheckpointData, CheckpointStore, CheckpointSummary};
use crate::error::CheckpointError;

const DB_NAME: &str = "checkpoints.db";

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS checkpoints (
    id TEXT PRIMARY KEY NOT NULL,
    task_id TEXT NOT NULL,
    current_step_index INTEGER NOT NULL,
    completed_steps INTEGER NOT NULL,
    cost_used REAL NOT NULL,
    created_at TEXT NOT NULL,
    data TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_checkpoints_task ON checkpoints(task_id, created_at);
"#;

pub struct SqliteCheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCheckpointStore {
    pub async fn new(base_dir: PathBuf) -> Result<Self, CheckpointError> {
        tokio::fs::create_dir_all(&base_dir).await?;
        let db_path = base_dir.join(DB_NAME);

        // Open database in blocking task
        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)?;
            conn.execute_batch(SCHEMA)?;
            Ok::<_, CheckpointError>(conn)
        })
        .await
        .map_err(|e| CheckpointError::Join(e.to_string()))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn save(
        &self,
        checkpoint_id: &str,
        data: &CheckpointData,
    ) -> Result<(), CheckpointError> {
        let conn = Arc::clone(&self.conn);
        let id = checkpoint_id.to_string();
        let summary = data.summary(checkpoint_id);
        let json = serde_json::to_string(data)?;

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT OR REPLACE INTO checkpoints
                     (id, task_id, current_step_index, completed_steps, cost_used, created_at, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    summary.task_id,
                    summary.current_step_index as i64,
                    summary.completed_steps as i64,
                    summary.cost_used,
                    summary.created_at.to_rfc3339(),
                    json,
                ],
            )?;
            Ok::<_, CheckpointError>(())
        })
        .await
        .map_err(|e| CheckpointError::Join(e.to_string()))?
    }

    async fn load(&self, checkpoint_id: &str) -> Result<Option<CheckpointData>, CheckpointError> {
        let conn = Arc::clone(&self.conn);
        let id = checkpoint_id.to_string();

        let json: Option<String> = tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.query_row(
                "SELECT data FROM checkpoints WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
        })
        .await
        .map_err(|e| CheckpointError::Join(e.to_string()))??;

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, task_id: &str) -> Result<Vec<CheckpointSummary>, CheckpointError> {
        let conn = Arc::clone(&self.conn);
        let task_id = task_id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT id, task_id, current_step_index, completed_steps, cost_used, created_at
                 FROM checkpoints
                 WHERE task_id = ?1
                 ORDER BY created_at ASC, id ASC",
            )?;
            let rows = stmt.query_map(params![task_id], |row| {
                let created_at: String = row.get(5)?;
                Ok(CheckpointSummary {
                    checkpoint_id: row.get(0)?,
                    task_id: row.get(1)?,
                    current_step_index: row.get::<_, i64>(2)? as usize,
                    completed_steps: row.get::<_, i64>(3)? as usize,
                    cost_used: row.get(4)?,
                    created_at: parse_timestamp(&created_at),
                })
            })?;
            let summaries = rows.collect::<Result<Vec<_>, _>>()?;
            Ok::<_, CheckpointError>(summaries)
        })
        .await
        .map_err(|e| CheckpointError::Join(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::test_support::sample;

    #[tokio::test]
    async fn test_sqlite_roundtrip_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCheckpointStore::new(dir.path().to_path_buf())
            .await
            .unwrap();

        let first = sample("t1", &["a", "b", "c"], 1);
        let second = sample("t1", &["a", "b", "c"], 2);
        store.save("cp-t1-1", &first).await.unwrap();
        store.save("cp-t1-2", &second).await.unwrap();
        store.save("cp-other-1", &sample("other", &["x"], 1)).await.unwrap();

        let loaded = store.load("cp-t1-2").await.unwrap().expect("checkpoint");
        assert_eq!(loaded.state, second.state);
        assert!(store.load("nope").await.unwrap().is_none());

        let listed = store.list("t1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].checkpoint_id, "cp-t1-2");
        assert_eq!(listed[1].completed_steps, 2);
    }

    #[tokio::test]
    async fn test_save_replaces_existing_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCheckpointStore::new(dir.path().to_path_buf())
            .await
            .unwrap();

        store.save("cp-t1-1", &sample("t1", &["a", "b"], 1)).await.unwrap();
        store.save("cp-t1-1", &sample("t1", &["a", "b"], 2)).await.unwrap();

        let listed = store.list("t1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].current_step_index, 2);
    }
}
