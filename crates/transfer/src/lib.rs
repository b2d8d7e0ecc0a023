//! Chunk planning, chunk sources and the upload task model.
//!
//! Everything here is synchronous and free of network concerns: the
//! planner splits a file into byte ranges, sources re-slice those ranges
//! from a live file handle, and [`UploadTask`] holds the per-chunk state
//! the coordinator mutates.

mod chunked;
mod planner;
mod types;
mod validation;

pub use chunked::{ChunkSource, FileSource, MemorySource, checksum_bytes};
pub use planner::{chunk_count, plan};
pub use types::{ByteRange, ChunkInfo, FileRef, TaskId, UploadTask, detect_content_type};
pub use validation::validate_plan;

pub use reelup_protocol::TaskStatus;

/// Default chunk size: 5 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,

    #[error("file of {file_size} bytes needs more than u32::MAX chunks of {chunk_size} bytes")]
    TooManyChunks { file_size: u64, chunk_size: u64 },

    #[error("invalid chunk plan: {0}")]
    InvalidPlan(String),

    #[error("byte range {start}..{end} is outside a source of {len} bytes")]
    RangeOutOfBounds { start: u64, end: u64, len: u64 },

    #[error("source has {actual} bytes but the task expects {expected}")]
    SourceMismatch { expected: u64, actual: u64 },

    #[error("chunk {0} does not exist in this task")]
    UnknownChunk(u32),

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        from: reelup_protocol::TaskStatus,
        to: reelup_protocol::TaskStatus,
    },
}
