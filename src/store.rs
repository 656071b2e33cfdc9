//! Result store for task results
//!
//! Two tiers with a fixed read order: the task's `cdresult.json` on disk
//! first, then the in-memory map. The in-memory tier holds the SUBMITTED and
//! PROCESSING snapshots of unsettled tasks; `save` is the only path that
//! writes to disk and it evicts the in-memory entry.

use anyhow::Context;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, error};

use crate::core::TaskResult;

/// Name of the settled result file inside a task directory
pub const CDRESULT_JSON_FILE: &str = "cdresult.json";

/// Filesystem-backed result store with an in-memory fallback
#[derive(Clone, Debug)]
pub struct ResultStore {
    task_dir: PathBuf,
    memory: Arc<DashMap<String, TaskResult>>,
}

impl ResultStore {
    pub fn new(task_dir: impl Into<PathBuf>) -> Self {
        Self {
            task_dir: task_dir.into(),
            memory: Arc::new(DashMap::new()),
        }
    }

    /// Root directory holding one subdirectory per task
    pub fn task_dir(&self) -> &Path {
        &self.task_dir
    }

    /// Directory of a single task
    pub fn task_path(&self, id: &str) -> PathBuf {
        self.task_dir.join(id)
    }

    /// Path of the settled result file for a task
    pub fn result_file_path(&self, id: &str) -> PathBuf {
        self.task_path(id).join(CDRESULT_JSON_FILE)
    }

    /// Register a snapshot in the in-memory tier
    pub fn insert(&self, result: TaskResult) {
        self.memory.insert(result.id.clone(), result);
    }

    /// Replace the in-memory snapshot, but only for a task still registered.
    /// A deleted task is never resurrected.
    pub fn publish(&self, result: TaskResult) {
        if let Some(mut entry) = self.memory.get_mut(&result.id) {
            *entry = result;
        }
    }

    pub fn remove(&self, id: &str) -> Option<TaskResult> {
        self.memory.remove(id).map(|(_, r)| r)
    }

    /// Look up a result: disk first, then memory
    pub async fn get(&self, id: &str) -> Option<TaskResult> {
        let path = self.result_file_path(id);
        match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<TaskResult>(&bytes) {
                Ok(result) => return Some(result),
                Err(e) => error!("Unable to parse {}: {}", path.display(), e),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} is not a file", path.display());
            }
            Err(e) => error!("Unable to read {}: {}", path.display(), e),
        }
        self.memory.get(id).map(|r| r.value().clone())
    }

    /// Persist a settled result and evict its in-memory snapshot.
    ///
    /// The snapshot is evicted even when the write fails.
    pub async fn save(&self, result: &TaskResult) -> anyhow::Result<()> {
        let path = self.result_file_path(&result.id);
        let written = write_json(&path, result)
            .await
            .with_context(|| format!("Unable to write {}", path.display()));
        self.memory.remove(&result.id);
        written
    }
}

/// Write via a temporary file and rename so readers never see a partial file
async fn write_json(path: &Path, result: &TaskResult) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec(result)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TaskState;
    use serde_json::json;

    #[test]
    fn test_result_file_path() {
        let store = ResultStore::new("task");
        let path = store.result_file_path("12345");
        assert_eq!(
            path,
            Path::new("task").join("12345").join(CDRESULT_JSON_FILE)
        );
        #[cfg(unix)]
        assert_eq!(path.to_string_lossy(), "task/12345/cdresult.json");
    }

    #[tokio::test]
    async fn test_get_unknown_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path());
        assert!(store.get("1").await.is_none());
    }

    #[tokio::test]
    async fn test_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path());
        std::fs::create_dir_all(store.task_path("1")).unwrap();

        let result = TaskResult::processing("1", 5).failed("message", Some(json!("hi")), 9);
        store.insert(TaskResult::submitted("1", 5));
        store.save(&result).await.unwrap();

        let loaded = store.get("1").await.unwrap();
        assert_eq!(loaded, result);
        // evicted from memory once flushed
        assert!(store.remove("1").is_none());
    }

    #[tokio::test]
    async fn test_save_without_directory_evicts_memory() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path());
        store.insert(TaskResult::submitted("1", 0));

        let saved = store
            .save(&TaskResult::processing("1", 0).complete(None, 1))
            .await;

        assert!(saved.is_err());
        assert!(store.get("1").await.is_none());
    }

    #[tokio::test]
    async fn test_unparseable_file_falls_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path());
        std::fs::create_dir_all(store.task_path("1")).unwrap();
        std::fs::write(store.result_file_path("1"), "xxx").unwrap();

        assert!(store.get("1").await.is_none());

        store.insert(TaskResult::submitted("1", 0));
        assert_eq!(store.get("1").await.unwrap().status, TaskState::Submitted);
    }

    #[tokio::test]
    async fn test_publish_only_replaces_registered_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path());

        store.publish(TaskResult::processing("gone", 0));
        assert!(store.get("gone").await.is_none());

        store.insert(TaskResult::submitted("1", 0));
        store.publish(TaskResult::processing("1", 0));
        assert_eq!(store.get("1").await.unwrap().status, TaskState::Processing);
    }
}
