//! JSON-file task store.
//!
//! Layout under the store root:
//!
//! ```text
//! uploads/<taskId>.json            task record
//! chunks/<taskId>/<index>.json     chunk record
//! ```
//!
//! Every write goes to a temp file that is synced and atomically renamed
//! over the target, followed by a sync of the parent directory.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use reelup_protocol::TaskStatus;
use reelup_transfer::{ChunkInfo, FileRef, TaskId, UploadTask, chunk_count, validate_plan};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{StoreError, TaskStore};

/// Row of the `uploads` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskRecord {
    id: TaskId,
    file_ref: FileRef,
    #[serde(default)]
    metadata: serde_json::Value,
    chunk_size: u64,
    total_chunks: u32,
    status: TaskStatus,
    #[serde(default)]
    retry_count: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    server_result: Option<serde_json::Value>,
}

impl TaskRecord {
    fn from_task(task: &UploadTask) -> Self {
        Self {
            id: task.id.clone(),
            file_ref: task.file_ref.clone(),
            metadata: task.metadata.clone(),
            chunk_size: task.chunk_size,
            total_chunks: task.total_chunks(),
            status: task.status,
            retry_count: task.retry_count,
            created_at: task.created_at,
            updated_at: task.updated_at,
            last_error: task.last_error.clone(),
            server_result: task.server_result.clone(),
        }
    }

    fn into_task(self, chunk_plan: Vec<ChunkInfo>) -> UploadTask {
        UploadTask {
            id: self.id,
            file_ref: self.file_ref,
            metadata: self.metadata,
            chunk_size: self.chunk_size,
            chunk_plan,
            status: self.status,
            retry_count: self.retry_count,
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_error: self.last_error,
            server_result: self.server_result,
        }
    }
}

/// Durable task store backed by JSON files.
pub struct FileTaskStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileTaskStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(root.join("uploads"))?;
        std::fs::create_dir_all(root.join("chunks"))?;
        debug!(root = %root.display(), "opened task store");
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn task_path(&self, task_id: &TaskId) -> PathBuf {
        self.root
            .join("uploads")
            .join(format!("{}.json", task_id.as_str()))
    }

    fn chunk_dir(&self, task_id: &TaskId) -> PathBuf {
        self.root.join("chunks").join(task_id.as_str())
    }

    fn chunk_path(&self, task_id: &TaskId, index: u32) -> PathBuf {
        self.chunk_dir(task_id).join(format!("{index:08}.json"))
    }

    fn write_chunk_record(&self, task_id: &TaskId, chunk: &ChunkInfo) -> Result<(), StoreError> {
        let json = serde_json::to_vec(chunk)?;
        write_atomic(&self.chunk_path(task_id, chunk.index), &json)?;
        Ok(())
    }

    /// Stored chunk row, or `None` when it is missing or unreadable.
    fn read_chunk_record(&self, task_id: &TaskId, index: u32) -> Option<ChunkInfo> {
        let data = std::fs::read(self.chunk_path(task_id, index)).ok()?;
        serde_json::from_slice(&data).ok()
    }

    fn read_task_record(&self, task_id: &TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let path = self.task_path(task_id);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: TaskRecord = serde_json::from_slice(&data).map_err(|e| corrupt(task_id, e))?;
        Ok(Some(record))
    }

    fn load(&self, task_id: &TaskId) -> Result<Option<UploadTask>, StoreError> {
        let Some(record) = self.read_task_record(task_id)? else {
            return Ok(None);
        };

        let expected = chunk_count(record.file_ref.size, record.chunk_size.max(1));
        if record.chunk_size == 0 || u64::from(record.total_chunks) != expected {
            return Err(corrupt(
                task_id,
                format!(
                    "{} chunks recorded for {} bytes at chunk size {}",
                    record.total_chunks, record.file_ref.size, record.chunk_size
                ),
            ));
        }

        let mut plan = Vec::with_capacity(record.total_chunks as usize);
        for index in 0..record.total_chunks {
            let path = self.chunk_path(task_id, index);
            let data = std::fs::read(&path)
                .map_err(|e| corrupt(task_id, format!("chunk {index}: {e}")))?;
            let chunk: ChunkInfo = serde_json::from_slice(&data)
                .map_err(|e| corrupt(task_id, format!("chunk {index}: {e}")))?;
            plan.push(chunk);
        }
        validate_plan(&plan, record.file_ref.size).map_err(|e| corrupt(task_id, e))?;

        Ok(Some(record.into_task(plan)))
    }
}

impl TaskStore for FileTaskStore {
    fn put(&self, task: &UploadTask) -> Result<(), StoreError> {
        check_key(&task.id)?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        // Chunk rows first: a task row on disk implies its chunk rows exist.
        // Rows already on disk with the same content are left alone.
        let mut written = 0;
        for chunk in &task.chunk_plan {
            if self.read_chunk_record(&task.id, chunk.index).as_ref() != Some(chunk) {
                self.write_chunk_record(&task.id, chunk)?;
                written += 1;
            }
        }
        let json = serde_json::to_vec_pretty(&TaskRecord::from_task(task))?;
        write_atomic(&self.task_path(&task.id), &json)?;

        debug!(task = %task.id, status = %task.status, chunks_written = written, "persisted task");
        Ok(())
    }

    fn get(&self, task_id: &TaskId) -> Result<Option<UploadTask>, StoreError> {
        check_key(task_id)?;
        self.load(task_id)
    }

    fn put_chunk(&self, task_id: &TaskId, chunk: &ChunkInfo) -> Result<(), StoreError> {
        check_key(task_id)?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let record = self
            .read_task_record(task_id)?
            .ok_or_else(|| StoreError::UnknownTask(task_id.to_string()))?;
        if chunk.index >= record.total_chunks {
            return Err(corrupt(
                task_id,
                format!("chunk {} outside a plan of {}", chunk.index, record.total_chunks),
            ));
        }

        self.write_chunk_record(task_id, chunk)?;
        debug!(task = %task_id, chunk = chunk.index, uploaded = chunk.uploaded, "persisted chunk");
        Ok(())
    }

    fn list(&self) -> Result<Vec<UploadTask>, StoreError> {
        let mut tasks = Vec::new();
        for entry in std::fs::read_dir(self.root.join("uploads"))? {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };
            let task_id = TaskId::from_string(stem);
            match self.load(&task_id) {
                Ok(Some(task)) => tasks.push(task),
                Ok(None) => {}
                Err(e) => warn!(task = %task_id, error = %e, "skipping unreadable task"),
            }
        }
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    fn purge(&self, task_id: &TaskId) -> Result<bool, StoreError> {
        check_key(task_id)?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        // Task row first so a crash mid-purge never leaves a task without chunks.
        let existed = match std::fs::remove_file(self.task_path(task_id)) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        match std::fs::remove_dir_all(self.chunk_dir(task_id)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if existed {
            debug!(task = %task_id, "purged task");
        }
        Ok(existed)
    }
}

fn corrupt(task_id: &TaskId, reason: impl ToString) -> StoreError {
    StoreError::Corrupt {
        task_id: task_id.to_string(),
        reason: reason.to_string(),
    }
}

/// Task IDs become file names; only allow characters that cannot escape the store.
fn check_key(task_id: &TaskId) -> Result<(), StoreError> {
    let id = task_id.as_str();
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(id.to_string()))
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("record path has no parent"))?;
    std::fs::create_dir_all(parent)?;

    let tmp = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    sync_dir(parent)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Returns the default store directory.
pub fn default_store_dir() -> Option<PathBuf> {
    config_dir().map(|d| d.join("reelup").join("tasks"))
}

/// Returns the platform-specific config directory.
fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".config"))
    }
}
