//! Payloads carried by [`BridgeMessage`](crate::BridgeMessage).

use serde::{Deserialize, Serialize};

/// A chunk was acknowledged by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadedPayload {
    pub chunk_index: u32,
    pub etag: String,
}

/// Worker-side view of how far a delegated job has come.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub uploaded_chunks: u32,
    pub total_chunks: u32,
}

/// A delegated job stopped on a chunk failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
    pub reason: String,
    /// `true` when retrying the task cannot help (validation, auth, unreadable source).
    #[serde(default)]
    pub permanent: bool,
}
