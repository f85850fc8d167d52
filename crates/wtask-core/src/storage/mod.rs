//! Pluggable persisted-task storage.
//!
//! The task manager saves a [`MainTask`] snapshot best-effort after every
//! terminal transition. The default implementation is one JSON file per
//! task under a configured directory, wrapped in a small versioned
//! envelope, mirroring the original file-based storage format.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::MainTask;

pub const STORAGE_VERSION: &str = "1.0";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("task {0} not found in storage")]
    NotFound(String),
}

/// Envelope persisted alongside each [`MainTask`] snapshot.
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskRecord {
    pub main_task: MainTask,
    pub saved_at: DateTime<Utc>,
    pub version: String,
}

/// Seam for persisting and retrieving [`MainTask`] snapshots, independent
/// of the in-memory task manager state.
pub trait TaskStore: Send + Sync {
    fn save(&self, main_task: &MainTask) -> Result<(), StorageError>;
    fn load(&self, id: &str) -> Result<Option<MainTask>, StorageError>;
    fn delete(&self, id: &str) -> Result<(), StorageError>;
    fn list_ids(&self) -> Result<Vec<String>, StorageError>;
}

/// Default [`TaskStore`]: one `wtask_<id>.json` file per task under `dir`.
pub struct FileTaskStore {
    dir: PathBuf,
}

impl FileTaskStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("wtask_{id}.json"))
    }

    fn read_file(path: &Path) -> Result<MainTask, StorageError> {
        let contents = std::fs::read_to_string(path)?;
        let record: TaskRecord = serde_json::from_str(&contents)?;
        Ok(record.main_task)
    }

    /// Load a main task from an arbitrary path, bypassing the configured
    /// directory -- used by the CLI to load a task-file argument directly.
    pub fn load_main_task_from_file(path: &Path) -> Result<MainTask, StorageError> {
        let contents = std::fs::read_to_string(path)?;
        let main_task: MainTask = serde_json::from_str(&contents)?;
        Ok(main_task)
    }
}

impl TaskStore for FileTaskStore {
    fn save(&self, main_task: &MainTask) -> Result<(), StorageError> {
        std::fs::create_dir_all(&self.dir)?;
        let record = TaskRecord {
            main_task: main_task.clone(),
            saved_at: Utc::now(),
            version: STORAGE_VERSION.to_string(),
        };
        let contents = serde_json::to_string_pretty(&record)?;
        std::fs::write(self.path_for(&main_task.id), contents)?;
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<MainTask>, StorageError> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(Self::read_file(&path)?))
    }

    fn delete(&self, id: &str) -> Result<(), StorageError> {
        let path = self.path_for(id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    fn list_ids(&self) -> Result<Vec<String>, StorageError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix("wtask_") {
                if let Some(id) = rest.strip_suffix(".json") {
                    ids.push(id.to_string());
                }
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;
    use tempfile::TempDir;

    fn main_task(id: &str) -> MainTask {
        MainTask {
            id: id.to_string(),
            title: "Main".into(),
            worktree_path: String::new(),
            branch_name: String::new(),
            repo_path: "/repo".into(),
            status: TaskStatus::Completed,
            created_at: Utc::now(),
            completed_at: Some(Utc::now()),
            webhook_url: String::new(),
            sub_tasks: vec![],
            completed_sub_tasks: 0,
            error_message: String::new(),
        }
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileTaskStore::new(dir.path());
        let mt = main_task("mt-1");

        store.save(&mt).unwrap();
        let loaded = store.load("mt-1").unwrap().unwrap();
        assert_eq!(loaded.id, "mt-1");
    }

    #[test]
    fn load_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = FileTaskStore::new(dir.path());
        assert!(store.load("nope").unwrap().is_none());
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = FileTaskStore::new(dir.path());
        store.delete("never-existed").unwrap();
    }

    #[test]
    fn list_ids_reflects_saved_tasks() {
        let dir = TempDir::new().unwrap();
        let store = FileTaskStore::new(dir.path());
        store.save(&main_task("mt-1")).unwrap();
        store.save(&main_task("mt-2")).unwrap();

        let mut ids = store.list_ids().unwrap();
        ids.sort();
        assert_eq!(ids, vec!["mt-1".to_string(), "mt-2".to_string()]);
    }
}
