//! Durable persistence for upload tasks.
//!
//! Two logical tables: `uploads` keyed by task ID (task metadata and
//! status) and `chunks` keyed by `(task ID, chunk index)` (per-chunk
//! completion state). [`FileTaskStore`] keeps them as JSON files that
//! survive a process restart; [`MemoryTaskStore`] is a volatile variant
//! for tests and embedding.

mod file;
mod memory;

pub use file::{FileTaskStore, default_store_dir};
pub use memory::MemoryTaskStore;

use reelup_protocol::TaskStatus;
use reelup_transfer::{ChunkInfo, TaskId, UploadTask};

/// Errors produced by task stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("invalid task id: {0}")]
    InvalidKey(String),

    #[error("corrupt record for task {task_id}: {reason}")]
    Corrupt { task_id: String, reason: String },
}

/// Durable CRUD over upload tasks and their chunk state.
///
/// A successful write must survive a process restart. Implementations
/// serialize writes so concurrent chunk completions cannot lose updates.
pub trait TaskStore: Send + Sync {
    /// Writes the full task: the task record and every chunk record.
    fn put(&self, task: &UploadTask) -> Result<(), StoreError>;

    /// Reads a task with its chunk plan, or `None` if it was never stored.
    fn get(&self, task_id: &TaskId) -> Result<Option<UploadTask>, StoreError>;

    /// Writes one chunk record of an existing task.
    fn put_chunk(&self, task_id: &TaskId, chunk: &ChunkInfo) -> Result<(), StoreError>;

    /// Lists every stored task, oldest first.
    fn list(&self) -> Result<Vec<UploadTask>, StoreError>;

    /// Deletes a task and its chunk records. Returns `false` if absent.
    fn purge(&self, task_id: &TaskId) -> Result<bool, StoreError>;

    /// Lists tasks currently in `status`, oldest first.
    fn list_by_status(&self, status: TaskStatus) -> Result<Vec<UploadTask>, StoreError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|t| t.status == status)
            .collect())
    }

    /// Lists tasks that are neither completed nor failed, oldest first.
    fn list_unfinished(&self) -> Result<Vec<UploadTask>, StoreError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|t| !t.status.is_terminal())
            .collect())
    }
}
