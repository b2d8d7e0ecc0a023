//! Scripted fake transport for coordinator and bridge tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use reelup_protocol::{FinalizeRequest, FinalizeResponse};
use reelup_transport::{ChunkUpload, TransportClient, TransportError, TransportFuture};

/// Fake endpoints: chunk uploads succeed unless a failure is scripted.
///
/// Etags derive from the chunk index and checksum, so re-uploading the
/// same bytes yields the same etag like an idempotent server would.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    chunk_failures: Mutex<HashMap<u32, VecDeque<TransportError>>>,
    finalize_failures: Mutex<VecDeque<TransportError>>,
    chunk_calls: Mutex<Vec<u32>>,
    acknowledged: Mutex<HashSet<u32>>,
    finalize_calls: Mutex<Vec<FinalizeRequest>>,
    /// Finalize calls made while some chunk had not been acknowledged.
    premature_finalizes: AtomicUsize,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next attempts on `index` fail with `errors`, in order.
    pub fn fail_chunk(&self, index: u32, errors: Vec<TransportError>) {
        self.chunk_failures
            .lock()
            .unwrap()
            .entry(index)
            .or_default()
            .extend(errors);
    }

    /// Treats `indices` as acknowledged by an earlier process.
    pub fn preacknowledge(&self, indices: impl IntoIterator<Item = u32>) {
        self.acknowledged.lock().unwrap().extend(indices);
    }

    pub fn fail_finalize(&self, errors: Vec<TransportError>) {
        self.finalize_failures.lock().unwrap().extend(errors);
    }

    /// Every successful chunk call takes at least `delay`; scripted
    /// failures return at once.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Chunk indices in the order attempts started.
    pub fn chunk_calls(&self) -> Vec<u32> {
        self.chunk_calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, index: u32) -> usize {
        self.chunk_calls().iter().filter(|&&i| i == index).count()
    }

    pub fn finalize_requests(&self) -> Vec<FinalizeRequest> {
        self.finalize_calls.lock().unwrap().clone()
    }

    pub fn premature_finalizes(&self) -> usize {
        self.premature_finalizes.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn etag_for(index: u32, checksum: &str) -> String {
        format!("etag-{index}-{}", &checksum[..8.min(checksum.len())])
    }
}

impl TransportClient for ScriptedTransport {
    fn upload_chunk(&self, chunk: &ChunkUpload) -> TransportFuture<'_, String> {
        let index = chunk.chunk_index;
        let etag = Self::etag_for(index, &chunk.checksum);
        self.chunk_calls.lock().unwrap().push(index);
        let scripted = self
            .chunk_failures
            .lock()
            .unwrap()
            .get_mut(&index)
            .and_then(|q| q.pop_front());
        let delay = *self.delay.lock().unwrap();

        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if scripted.is_none() && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match scripted {
                Some(err) => Err(err),
                None => {
                    self.acknowledged.lock().unwrap().insert(index);
                    Ok(etag)
                }
            }
        })
    }

    fn finalize(&self, request: &FinalizeRequest) -> TransportFuture<'_, FinalizeResponse> {
        let request = request.clone();
        Box::pin(async move {
            {
                let acked = self.acknowledged.lock().unwrap();
                let all_acked = request.chunks.iter().all(|c| acked.contains(&c.index));
                if !all_acked {
                    self.premature_finalizes.fetch_add(1, Ordering::SeqCst);
                }
            }
            self.finalize_calls.lock().unwrap().push(request.clone());

            if let Some(err) = self.finalize_failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(FinalizeResponse(serde_json::json!({
                "videoId": format!("vid-{}", request.task_id),
                "chunks": request.chunks.len(),
            })))
        })
    }
}
