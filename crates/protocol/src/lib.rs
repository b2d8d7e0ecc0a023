//! Wire types for the reelup resumable upload engine.
//!
//! Covers three boundaries:
//! - the chunk upload and finalize endpoints consumed over HTTP,
//! - the message protocol between the coordinator and a background worker,
//! - the `upload-*` events exposed to UI and notification collaborators.

pub mod constants;
pub mod envelope;
pub mod events;
pub mod messages;
pub mod types;

pub use constants::MessageType;
pub use envelope::BridgeMessage;
pub use events::UploadEvent;
pub use types::{
    ChunkUploadResponse, FinalizeChunk, FinalizeRequest, FinalizeResponse, TaskStatus,
};

/// Errors produced while decoding protocol payloads.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing payload for {0:?} message")]
    MissingPayload(MessageType),

    #[error("unknown task status: {0}")]
    UnknownStatus(String),
}
