//! Task registry and durable per-task records.
//!
//! Layout under `{data_dir}/tasks`:
//!
//! ```text
//! {id}/
//!   task.json      durable record, rewritten atomically on every change
//!   input/{name}   the uploaded document
//!   {id}.md        converted Markdown (on success)
//!   images/        extracted images (PDF only)
//! ```
//!
//! Each registry entry carries the task's record, its cancellation token and
//! a file guard. Readers of output files hold the guard shared; deletion holds
//! it exclusively, after the entry has left the registry, so a lookup never
//! sees a task whose directory is being removed.

use crate::error::ServiceError;
use crate::task::{Task, TaskId};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, RwLockReadGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const RECORD_FILE: &str = "task.json";

/// One live task: record, cancellation token and file guard.
pub struct TaskEntry {
    id: TaskId,
    dir: PathBuf,
    record: Mutex<Task>,
    cancel: CancellationToken,
    files: tokio::sync::RwLock<()>,
    removed: AtomicBool,
}

impl TaskEntry {
    fn new(task: Task, dir: PathBuf) -> Self {
        Self {
            id: task.id,
            dir,
            record: Mutex::new(task),
            cancel: CancellationToken::new(),
            files: tokio::sync::RwLock::new(()),
            removed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn snapshot(&self) -> Task {
        self.record.lock().await.clone()
    }

    /// Shared guard held while output files are read.
    pub async fn read_files(&self) -> RwLockReadGuard<'_, ()> {
        self.files.read().await
    }

    /// Apply `f` to a draft of the record and persist it; the in-memory
    /// record only changes once the write succeeded.
    ///
    /// After the entry has been removed from the registry the change is
    /// applied in memory only, so late bookkeeping (e.g. webhook results)
    /// cannot resurrect a deleted directory.
    pub async fn update<R>(
        &self,
        f: impl FnOnce(&mut Task) -> Result<R, ServiceError>,
    ) -> Result<R, ServiceError> {
        let mut record = self.record.lock().await;
        let mut draft = record.clone();
        let out = f(&mut draft)?;
        if !self.removed.load(Ordering::SeqCst) {
            write_record(&self.dir, &draft).await?;
        }
        *record = draft;
        Ok(out)
    }

    /// Apply `f` in memory unconditionally, then try to persist.
    ///
    /// For changes that must be visible even when storage is failing, such
    /// as the terminal state of a run. A failed write is logged; the file
    /// catches up on the next successful write, and a record left behind as
    /// `Running` is failed by start-up recovery.
    pub async fn force(&self, f: impl FnOnce(&mut Task)) {
        let mut record = self.record.lock().await;
        f(&mut record);
        if self.removed.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = write_record(&self.dir, &record).await {
            warn!(task_id = %self.id, "Task record not persisted: {e}");
        }
    }
}

/// In-memory index of every known task, backed by `task.json` files.
pub struct TaskStore {
    root: PathBuf,
    entries: RwLock<HashMap<TaskId, Arc<TaskEntry>>>,
}

impl TaskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn task_dir(&self, id: TaskId) -> PathBuf {
        self.root.join(id.to_string())
    }

    /// Persist a new record and make it visible.
    pub async fn insert(&self, task: Task) -> Result<Arc<TaskEntry>, ServiceError> {
        let dir = self.task_dir(task.id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ServiceError::storage(&dir, e))?;
        write_record(&dir, &task).await?;
        Ok(self.register(task))
    }

    /// Make an already-persisted record visible (start-up recovery).
    pub fn register(&self, task: Task) -> Arc<TaskEntry> {
        let dir = self.task_dir(task.id);
        let entry = Arc::new(TaskEntry::new(task, dir));
        self.write_entries().insert(entry.id, Arc::clone(&entry));
        entry
    }

    pub fn get(&self, id: TaskId) -> Result<Arc<TaskEntry>, ServiceError> {
        self.read_entries()
            .get(&id)
            .cloned()
            .ok_or_else(|| ServiceError::task_not_found(id))
    }

    /// Drop the entry from the registry; later lookups are `NotFound`.
    pub fn remove(&self, id: TaskId) -> Option<Arc<TaskEntry>> {
        let entry = self.write_entries().remove(&id)?;
        entry.removed.store(true, Ordering::SeqCst);
        Some(entry)
    }

    pub fn entries(&self) -> Vec<Arc<TaskEntry>> {
        self.read_entries().values().cloned().collect()
    }

    /// Snapshots of every task, oldest first.
    pub async fn list(&self) -> Vec<Task> {
        let mut tasks = Vec::new();
        for entry in self.entries() {
            tasks.push(entry.snapshot().await);
        }
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks
    }

    /// Remove a task directory once its entry has left the registry.
    ///
    /// Waits for in-progress readers to release the file guard.
    pub async fn purge(&self, entry: &TaskEntry) -> Result<(), ServiceError> {
        let _exclusive = entry.files.write().await;
        match tokio::fs::remove_dir_all(&entry.dir).await {
            Ok(()) => {
                debug!(task_id = %entry.id, "Removed task directory");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServiceError::storage(&entry.dir, e)),
        }
    }

    /// Read every `task.json` under the root. Unreadable records are skipped
    /// with a warning; the directory is left for an operator to inspect.
    pub async fn load_records(&self) -> Result<Vec<Task>, ServiceError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| ServiceError::storage(&self.root, e))?;
        let mut dir = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| ServiceError::storage(&self.root, e))?;

        let mut tasks = Vec::new();
        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|e| ServiceError::storage(&self.root, e))?
        {
            let path = item.path().join(RECORD_FILE);
            let bytes = match tokio::fs::read(&path).await {
                Ok(b) => b,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!("Skipping unreadable record {}: {}", path.display(), e);
                    continue;
                }
            };
            match serde_json::from_slice::<Task>(&bytes) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!("Skipping corrupt record {}: {}", path.display(), e),
            }
        }
        Ok(tasks)
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, HashMap<TaskId, Arc<TaskEntry>>> {
        self.entries.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_entries(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<TaskId, Arc<TaskEntry>>> {
        self.entries.write().unwrap_or_else(|p| p.into_inner())
    }
}

async fn write_record(dir: &Path, task: &Task) -> Result<(), ServiceError> {
    let json = serde_json::to_vec_pretty(task)
        .map_err(|e| ServiceError::Internal(format!("Failed to encode task record: {e}")))?;
    atomic_write(&dir.join(RECORD_FILE), json).await
}

/// Write `bytes` to `path` via a temp file in the same directory and a
/// rename, so readers never observe a partial file.
pub async fn atomic_write(path: &Path, bytes: Vec<u8>) -> Result<(), ServiceError> {
    let target = path.to_path_buf();
    let dir = target
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    tokio::task::spawn_blocking(move || -> Result<(), ServiceError> {
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .map_err(|e| ServiceError::storage(&dir, e))?;
        tmp.write_all(&bytes)
            .map_err(|e| ServiceError::storage(tmp.path(), e))?;
        tmp.persist(&target)
            .map_err(|e| ServiceError::storage(&target, e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| ServiceError::Internal(format!("Write task panicked: {e}")))?
}
