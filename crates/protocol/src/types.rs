use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Lifecycle state of an upload task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Returns `true` for `completed` and `failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Uploading => "uploading",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "uploading" => Ok(TaskStatus::Uploading),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(ProtocolError::UnknownStatus(other.to_string())),
        }
    }
}

/// Body returned by the chunk upload endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkUploadResponse {
    pub etag: String,
}

/// One confirmed chunk as referenced by the finalize call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeChunk {
    pub index: u32,
    pub etag: String,
}

/// Body sent to the finalize endpoint.
///
/// `chunks` is always sorted by index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub task_id: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub chunks: Vec<FinalizeChunk>,
}

/// Server result of a successful finalize, opaque to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FinalizeResponse(pub serde_json::Value);
