//! Network calls of the upload engine.
//!
//! [`TransportClient`] performs exactly one round trip per call: one chunk
//! upload or one finalize. Retrying is the caller's job, which keeps
//! implementations trivially replaceable by fakes in tests.

pub mod http;

use std::future::Future;
use std::pin::Pin;

use reelup_protocol::{FinalizeRequest, FinalizeResponse};

pub use http::{HttpTransport, HttpTransportConfig};

/// Errors from a single transport call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("network offline")]
    Offline,

    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("request rejected {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),
}

impl TransportError {
    /// Classifies a non-success HTTP status.
    ///
    /// 5xx, 408 and 429 are transient; every other status is a rejection.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        if status >= 500 || status == 408 || status == 429 {
            Self::Server { status, body }
        } else {
            Self::Rejected { status, body }
        }
    }

    /// Returns `true` if the same request may succeed when repeated.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Network(_) | Self::Offline | Self::Server { .. } => true,
            Self::Rejected { .. } | Self::Protocol(_) | Self::InvalidConfig(_) => false,
        }
    }
}

/// One chunk ready to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkUpload {
    pub task_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub data: Vec<u8>,
    /// SHA-256 hex digest of `data`.
    pub checksum: String,
}

/// Boxed future returned by [`TransportClient`] methods.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Abstract connection to the upload endpoints.
///
/// Implementations must not retry; a call is a single request with a
/// bounded timeout.
pub trait TransportClient: Send + Sync {
    /// Uploads one chunk and returns the server's etag for it.
    fn upload_chunk(&self, chunk: &ChunkUpload) -> TransportFuture<'_, String>;

    /// Asks the server to assemble the uploaded chunks.
    fn finalize(&self, request: &FinalizeRequest) -> TransportFuture<'_, FinalizeResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(TransportError::from_status(503, "").is_retryable());
        assert!(TransportError::from_status(500, "").is_retryable());
        assert!(TransportError::from_status(408, "").is_retryable());
        assert!(TransportError::from_status(429, "slow down").is_retryable());

        let rejected = TransportError::from_status(400, "bad chunk");
        assert!(!rejected.is_retryable());
        assert_eq!(
            rejected,
            TransportError::Rejected {
                status: 400,
                body: "bad chunk".into()
            }
        );
        assert!(!TransportError::from_status(401, "").is_retryable());
        assert!(!TransportError::from_status(413, "").is_retryable());
    }

    #[test]
    fn connectivity_errors_are_retryable() {
        assert!(TransportError::Timeout.is_retryable());
        assert!(TransportError::Offline.is_retryable());
        assert!(TransportError::Network("reset".into()).is_retryable());
        assert!(!TransportError::Protocol("no etag".into()).is_retryable());
    }
}
