//! Delegation of chunk transfers to an out-of-context executor.
//!
//! A [`BackgroundBridge`] accepts a whole run of pending chunks and reports
//! back through [`BridgeMessage`]s on the job's reply channel:
//!
//! - `chunk-uploaded` for every acknowledged chunk,
//! - `progress` after each of them,
//! - `error` when a chunk fails (no new chunks start afterwards),
//! - `complete` once every delegated chunk is acknowledged.
//!
//! The job is over when the reply channel closes. When no bridge is
//! available the coordinator runs chunks itself.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use reelup_protocol::messages::{ChunkUploadedPayload, ErrorPayload, ProgressPayload};
use reelup_protocol::{BridgeMessage, MessageType};
use reelup_transfer::{ChunkInfo, ChunkSource, TaskId};
use reelup_transport::TransportClient;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::UploadError;
use crate::retry::{RetryError, RetryPolicy};
use crate::sender::ChunkSender;
use crate::signals::NetworkSignals;

/// Errors produced by a bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("background execution unavailable")]
    Unavailable,

    #[error("failed to start background worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A run of chunks handed to the background.
pub struct DelegatedUpload {
    pub task_id: TaskId,
    pub total_chunks: u32,
    /// Chunks not yet uploaded, in index order.
    pub chunks: Vec<ChunkInfo>,
    pub source: Arc<dyn ChunkSource>,
    pub parallelism: usize,
    /// Cancelled on pause, shutdown or when the coordinator gives up on the run.
    pub stop: CancellationToken,
    pub reply: mpsc::UnboundedSender<BridgeMessage>,
}

/// Capability interface for out-of-context execution.
pub trait BackgroundBridge: Send + Sync {
    fn is_available(&self) -> bool;

    /// Hands `job` off. Returns immediately; results arrive on `job.reply`.
    fn delegate(&self, job: DelegatedUpload) -> Result<(), BridgeError>;

    /// Stops accepting jobs and winds down running ones.
    fn shutdown(&self) {}
}

/// No background context: every chunk runs in the coordinator.
#[derive(Debug, Default, Clone, Copy)]
pub struct ForegroundOnly;

impl BackgroundBridge for ForegroundOnly {
    fn is_available(&self) -> bool {
        false
    }

    fn delegate(&self, _job: DelegatedUpload) -> Result<(), BridgeError> {
        Err(BridgeError::Unavailable)
    }
}

/// Runs delegated jobs on a dedicated OS thread with its own runtime,
/// so transfers keep going while the caller's runtime is starved or parked.
pub struct WorkerBridge {
    jobs: Mutex<Option<mpsc::UnboundedSender<DelegatedUpload>>>,
    shutdown: CancellationToken,
}

impl WorkerBridge {
    /// Starts the worker thread.
    pub fn spawn(
        transport: Arc<dyn TransportClient>,
        retry: RetryPolicy,
        signals: NetworkSignals,
    ) -> Result<Self, BridgeError> {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let sender = ChunkSender {
            transport,
            retry,
            signals,
        };

        let stop = shutdown.clone();
        std::thread::Builder::new()
            .name("reelup-worker".into())
            .spawn(move || runtime.block_on(worker_loop(sender, jobs_rx, stop)))?;

        info!("background upload worker started");
        Ok(Self {
            jobs: Mutex::new(Some(jobs_tx)),
            shutdown,
        })
    }
}

impl BackgroundBridge for WorkerBridge {
    fn is_available(&self) -> bool {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    fn delegate(&self, job: DelegatedUpload) -> Result<(), BridgeError> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let tx = jobs.as_ref().ok_or(BridgeError::Unavailable)?;
        debug!(task = %job.task_id, chunks = job.chunks.len(), "delegating to worker");
        tx.send(job).map_err(|_| BridgeError::Unavailable)
    }

    fn shutdown(&self) {
        self.shutdown.cancel();
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

impl Drop for WorkerBridge {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn worker_loop(
    sender: ChunkSender,
    mut jobs: mpsc::UnboundedReceiver<DelegatedUpload>,
    shutdown: CancellationToken,
) {
    let mut running = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => {
                    running.spawn(run_job(sender.clone(), job));
                }
                None => break,
            },
            Some(_) = running.join_next(), if !running.is_empty() => {}
        }
    }
    running.shutdown().await;
    debug!("background upload worker stopped");
}

async fn run_job(sender: ChunkSender, job: DelegatedUpload) {
    let DelegatedUpload {
        task_id,
        total_chunks,
        chunks,
        source,
        parallelism,
        stop,
        reply,
    } = job;

    let mut uploaded = total_chunks.saturating_sub(chunks.len() as u32);
    let mut remaining = chunks.len();
    let mut queue = chunks.into_iter();
    let mut in_flight = JoinSet::new();
    let mut failed = false;
    let retrying = Arc::new(AtomicUsize::new(0));

    loop {
        while !failed
            && !stop.is_cancelled()
            && retrying.load(Ordering::SeqCst) == 0
            && in_flight.len() < parallelism.max(1)
        {
            let Some(chunk) = queue.next() else {
                break;
            };
            let sender = sender.clone();
            let source = Arc::clone(&source);
            let task_id = task_id.clone();
            let stop = stop.clone();
            let retrying = Arc::clone(&retrying);
            in_flight.spawn(async move {
                let result = sender
                    .send(source, &task_id, &chunk, total_chunks, &stop, &retrying)
                    .await;
                (chunk.index, result)
            });
        }

        let Some(joined) = in_flight.join_next().await else {
            break;
        };
        match joined {
            Ok((index, Ok(etag))) => {
                uploaded += 1;
                remaining -= 1;
                post(
                    &reply,
                    MessageType::ChunkUploaded,
                    &task_id,
                    Some(&ChunkUploadedPayload {
                        chunk_index: index,
                        etag,
                    }),
                );
                post(
                    &reply,
                    MessageType::Progress,
                    &task_id,
                    Some(&ProgressPayload {
                        uploaded_chunks: uploaded,
                        total_chunks,
                    }),
                );
            }
            Ok((_, Err(UploadError::Retry(RetryError::Cancelled)))) => {}
            Ok((index, Err(e))) => {
                if !failed {
                    failed = true;
                    post(
                        &reply,
                        MessageType::Error,
                        &task_id,
                        Some(&ErrorPayload {
                            chunk_index: Some(index),
                            reason: e.to_string(),
                            permanent: e.is_permanent(),
                        }),
                    );
                }
            }
            Err(e) => {
                if !failed {
                    failed = true;
                    post(
                        &reply,
                        MessageType::Error,
                        &task_id,
                        Some(&ErrorPayload {
                            chunk_index: None,
                            reason: format!("chunk task failed: {e}"),
                            permanent: false,
                        }),
                    );
                }
            }
        }
    }

    if !failed && remaining == 0 {
        post::<()>(&reply, MessageType::Complete, &task_id, None);
    }
}

fn post<T: Serialize>(
    reply: &mpsc::UnboundedSender<BridgeMessage>,
    msg_type: MessageType,
    task_id: &TaskId,
    payload: Option<&T>,
) {
    match BridgeMessage::new(msg_type, task_id.as_str(), payload) {
        Ok(msg) => {
            // The coordinator may have given up on this run already.
            let _ = reply.send(msg);
        }
        Err(e) => warn!(task = %task_id, error = %e, "failed to encode bridge message"),
    }
}
