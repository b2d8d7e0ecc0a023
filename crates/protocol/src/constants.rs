use serde::{Deserialize, Serialize};

/// Kind of message posted by a background worker to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Progress,
    Complete,
    Error,
    ChunkUploaded,
}

/// Multipart field names expected by the chunk upload endpoint.
pub mod fields {
    pub const TASK_ID: &str = "taskId";
    pub const CHUNK_INDEX: &str = "chunkIndex";
    pub const TOTAL_CHUNKS: &str = "totalChunks";
    pub const CHECKSUM: &str = "checksum";
    pub const CHUNK: &str = "chunk";
}

/// Event names exposed to UI and notification collaborators.
pub mod event_names {
    pub const UPLOAD_PROGRESS: &str = "upload-progress";
    pub const UPLOAD_COMPLETE: &str = "upload-complete";
    pub const UPLOAD_ERROR: &str = "upload-error";
}
