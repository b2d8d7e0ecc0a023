//! One chunk, end to end: read from the source, checksum, send with retry.
//!
//! Shared by the in-context scheduler and the background worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use reelup_transfer::{ChunkInfo, ChunkSource, TaskId, TransferError, checksum_bytes};
use reelup_transport::{ChunkUpload, TransportClient};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::UploadError;
use crate::retry::RetryPolicy;
use crate::signals::NetworkSignals;

/// Everything a chunk transfer needs besides the chunk itself.
#[derive(Clone)]
pub(crate) struct ChunkSender {
    pub transport: Arc<dyn TransportClient>,
    pub retry: RetryPolicy,
    pub signals: NetworkSignals,
}

impl ChunkSender {
    /// Uploads `chunk` and returns the server's etag.
    ///
    /// The source read runs on the blocking pool. `stop` prevents new
    /// attempts but lets a started one finish.
    ///
    /// `retrying` counts chunks of the same run that have failed an attempt
    /// and are still backing off or retrying; schedulers hold new chunks
    /// back while it is non-zero.
    pub async fn send(
        &self,
        source: Arc<dyn ChunkSource>,
        task_id: &TaskId,
        chunk: &ChunkInfo,
        total_chunks: u32,
        stop: &CancellationToken,
        retrying: &AtomicUsize,
    ) -> Result<String, UploadError> {
        let range = chunk.byte_range;
        let data = tokio::task::spawn_blocking(move || source.read_range(&range))
            .await
            .map_err(|e| UploadError::Worker(format!("chunk read task failed: {e}")))?
            .map_err(UploadError::Transfer)?;

        if data.len() as u64 != range.len() {
            return Err(TransferError::InvalidPlan(format!(
                "chunk {} read {} bytes, expected {}",
                chunk.index,
                data.len(),
                range.len()
            ))
            .into());
        }

        let upload = ChunkUpload {
            task_id: task_id.to_string(),
            chunk_index: chunk.index,
            total_chunks,
            checksum: checksum_bytes(&data),
            data,
        };

        let failed_once = AtomicBool::new(false);
        let result = self
            .retry
            .execute_with_retry(
                |attempt| {
                    debug!(task = %task_id, chunk = upload.chunk_index, attempt, "sending chunk");
                    let call = self.transport.upload_chunk(&upload);
                    let failed_once = &failed_once;
                    async move {
                        let result = call.await;
                        if result.is_err() && !failed_once.swap(true, Ordering::SeqCst) {
                            retrying.fetch_add(1, Ordering::SeqCst);
                        }
                        result
                    }
                },
                &self.signals,
                stop,
            )
            .await;
        if failed_once.load(Ordering::SeqCst) {
            retrying.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(result?)
    }
}
