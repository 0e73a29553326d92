//! Durable JSON snapshot of the task table.
//!
//! The whole table is rewritten after every mutation: encode, write to a
//! sibling `.tmp` file, fsync, then rename over the real path. A crash at any
//! point leaves either the previous or the new snapshot on disk.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use super::task::Task;
use crate::error::SnapshotError;

/// On-disk layout: `{ "tasks": [...], "updated_at": "..." }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            tasks,
            updated_at: Utc::now(),
        }
    }
}

/// Reads and atomically rewrites the snapshot file.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        self.path.with_extension("tmp")
    }

    /// Load the snapshot. A missing or blank file is `Ok(None)`.
    pub async fn load(&self) -> Result<Option<Snapshot>, SnapshotError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SnapshotError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        if raw.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| SnapshotError::Decode {
                path: self.path.clone(),
                source,
            })
    }

    /// Replace the snapshot with `tasks`.
    pub async fn save(&self, tasks: Vec<Task>) -> Result<(), SnapshotError> {
        let mut payload = serde_json::to_string_pretty(&Snapshot::new(tasks))
            .map_err(SnapshotError::Encode)?;
        payload.push('\n');

        let write_err = |source| SnapshotError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }

        let tmp = self.tmp_path();
        let mut file = tokio::fs::File::create(&tmp).await.map_err(write_err)?;
        file.write_all(payload.as_bytes()).await.map_err(write_err)?;
        file.sync_all().await.map_err(write_err)?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(write_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasker::task::TaskStatus;
    use serde_json::json;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> SnapshotStore {
        SnapshotStore::new(dir.path().join("tasks").join("tasks.json"))
    }

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let dir = TempDir::new().unwrap();
        assert!(store_in(&dir).load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn blank_file_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("tasks.json"));
        tokio::fs::write(store.path(), "  \n").await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load_reproduces_records() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let mut done = Task::new("Ingest", "ingest", json!({ "file": "a.pdf" }));
        done.start("go").unwrap();
        done.set_progress(42.5, Some("halfway"));
        done.set_result(json!({ "chunks": 12 }));
        done.finish(TaskStatus::Success, "Task completed", None).unwrap();
        let pending = Task::new("OCR", "ocr", json!(null));
        let tasks = vec![done, pending];

        store.save(tasks.clone()).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.tasks, tasks);

        // a second save of the loaded set is stable
        store.save(loaded.tasks.clone()).await.unwrap();
        assert_eq!(store.load().await.unwrap().unwrap().tasks, tasks);
    }

    #[tokio::test]
    async fn save_leaves_no_tmp_file() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.save(Vec::new()).await.unwrap();
        assert!(store.path().exists());
        assert!(!store.tmp_path().exists());

        let raw = tokio::fs::read_to_string(store.path()).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(value["tasks"].as_array().unwrap().is_empty());
        assert!(value["updated_at"].is_string());
    }

    #[tokio::test]
    async fn corrupt_file_is_a_decode_error() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("tasks.json"));
        tokio::fs::write(store.path(), "{ not json").await.unwrap();
        assert!(matches!(
            store.load().await,
            Err(SnapshotError::Decode { .. })
        ));
    }

    #[tokio::test]
    async fn unwritable_location_is_a_write_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        tokio::fs::write(&blocker, "file, not a directory").await.unwrap();
        let store = SnapshotStore::new(blocker.join("tasks.json"));
        assert!(matches!(
            store.save(Vec::new()).await,
            Err(SnapshotError::Write { .. })
        ));
    }
}
