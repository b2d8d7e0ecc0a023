use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use reelup_protocol::{FinalizeChunk, TaskStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::TransferError;

/// Unique identifier for an upload task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generates a new random task ID.
    pub fn new() -> Self {
        Self(format!("upl_{}", Uuid::new_v4().simple()))
    }

    /// Wraps an existing ID (e.g. one read back from the store).
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Half-open byte range `[start, end)` into the source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-chunk transfer state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkInfo {
    pub index: u32,
    pub byte_range: ByteRange,
    pub uploaded: bool,
    /// Server acknowledgment token; set if and only if `uploaded`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl ChunkInfo {
    /// Creates a chunk that has not been uploaded yet.
    pub fn new(index: u32, byte_range: ByteRange) -> Self {
        Self {
            index,
            byte_range,
            uploaded: false,
            etag: None,
        }
    }

    /// Records the server acknowledgment.
    ///
    /// Returns `false` if the chunk was already uploaded; the first etag
    /// is kept in that case.
    pub fn mark_uploaded(&mut self, etag: impl Into<String>) -> bool {
        if self.uploaded {
            return false;
        }
        self.uploaded = true;
        self.etag = Some(etag.into());
        true
    }
}

/// Metadata about the source file. Raw bytes are never part of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    pub name: String,
    pub size: u64,
    pub content_type: String,
    /// Local path, when the source is a file the engine may reopen after restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl FileRef {
    pub fn new(name: impl Into<String>, size: u64, content_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            content_type: content_type.into(),
            path: None,
        }
    }

    /// Builds a reference from a file on disk, guessing the content type
    /// from its extension.
    pub fn from_path(path: &Path) -> Result<Self, TransferError> {
        let size = std::fs::metadata(path)?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let content_type = detect_content_type(path);
        Ok(Self {
            name,
            size,
            content_type: content_type.to_string(),
            path: Some(path.to_path_buf()),
        })
    }
}

/// Guesses a MIME type from the file extension.
pub fn detect_content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// One file being uploaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTask {
    pub id: TaskId,
    pub file_ref: FileRef,
    /// Caller-supplied attributes (title, description, ...), opaque here.
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub chunk_size: u64,
    pub chunk_plan: Vec<ChunkInfo>,
    pub status: TaskStatus,
    /// Task-level restarts consumed (distinct from per-chunk attempts).
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Finalize result returned by the server once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_result: Option<serde_json::Value>,
}

impl UploadTask {
    /// Creates a pending task with a freshly computed chunk plan.
    pub fn new(
        file_ref: FileRef,
        metadata: serde_json::Value,
        chunk_size: u64,
    ) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidChunkSize);
        }
        if crate::chunk_count(file_ref.size, chunk_size) > u64::from(u32::MAX) {
            return Err(TransferError::TooManyChunks {
                file_size: file_ref.size,
                chunk_size,
            });
        }

        let now = Utc::now();
        Ok(Self {
            id: TaskId::new(),
            chunk_plan: crate::plan(file_ref.size, chunk_size),
            file_ref,
            metadata,
            chunk_size,
            status: TaskStatus::Pending,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            last_error: None,
            server_result: None,
        })
    }

    pub fn total_chunks(&self) -> u32 {
        self.chunk_plan.len() as u32
    }

    pub fn uploaded_chunks(&self) -> u32 {
        self.chunk_plan.iter().filter(|c| c.uploaded).count() as u32
    }

    /// `true` once every chunk has been acknowledged (vacuously for empty files).
    pub fn is_fully_uploaded(&self) -> bool {
        self.chunk_plan.iter().all(|c| c.uploaded)
    }

    /// Aggregate progress as a rounded integer percent.
    ///
    /// Stays at 99 or below until every chunk is acknowledged, so 100 always
    /// means the plan is complete.
    pub fn progress_percent(&self) -> u8 {
        let total = u64::from(self.total_chunks());
        let uploaded = u64::from(self.uploaded_chunks());
        if uploaded >= total {
            return 100;
        }
        (((uploaded * 100 + total / 2) / total) as u8).min(99)
    }

    /// Chunks still waiting for acknowledgment, in index order.
    pub fn pending_chunks(&self) -> Vec<ChunkInfo> {
        self.chunk_plan
            .iter()
            .filter(|c| !c.uploaded)
            .cloned()
            .collect()
    }

    pub fn chunk(&self, index: u32) -> Option<&ChunkInfo> {
        self.chunk_plan.get(index as usize)
    }

    /// Records a server acknowledgment for `index`.
    ///
    /// Returns `Ok(false)` for a duplicate delivery.
    pub fn mark_chunk_uploaded(
        &mut self,
        index: u32,
        etag: impl Into<String>,
    ) -> Result<bool, TransferError> {
        let chunk = self
            .chunk_plan
            .get_mut(index as usize)
            .ok_or(TransferError::UnknownChunk(index))?;
        let changed = chunk.mark_uploaded(etag);
        if changed {
            self.updated_at = Utc::now();
        }
        Ok(changed)
    }

    /// The `(index, etag)` list for finalize, sorted by index.
    ///
    /// Returns `None` while any chunk is still missing.
    pub fn finalize_chunks(&self) -> Option<Vec<FinalizeChunk>> {
        let mut chunks = self
            .chunk_plan
            .iter()
            .map(|c| {
                c.etag.clone().filter(|_| c.uploaded).map(|etag| FinalizeChunk {
                    index: c.index,
                    etag,
                })
            })
            .collect::<Option<Vec<_>>>()?;
        chunks.sort_by_key(|c| c.index);
        Some(chunks)
    }

    /// Returns `true` if the state machine allows `from -> to`.
    ///
    /// `failed -> uploading` is the explicit caller retry.
    pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (from, to),
            (Pending, Uploading)
                | (Uploading, Pending)
                | (Uploading, Completed)
                | (Uploading, Failed)
                | (Failed, Uploading)
        )
    }

    /// Moves the task to `to`, enforcing the state machine.
    pub fn transition(&mut self, to: TaskStatus) -> Result<(), TransferError> {
        if !Self::can_transition(self.status, to) {
            return Err(TransferError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        if to == TaskStatus::Completed && !self.is_fully_uploaded() {
            return Err(TransferError::InvalidPlan(format!(
                "{} of {} chunks uploaded",
                self.uploaded_chunks(),
                self.total_chunks()
            )));
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }
}
