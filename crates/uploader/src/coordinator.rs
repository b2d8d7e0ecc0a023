//! The upload state machine.
//!
//! `pending -> uploading -> {completed | failed}`, with `uploading <-> pending`
//! for pause and resume and `failed -> uploading` for an explicit caller
//! retry. Every state change is written to the [`TaskStore`] before it is
//! applied in memory, so what a restarted process recovers never lags
//! behind what observers were told.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use reelup_protocol::messages::{ChunkUploadedPayload, ErrorPayload};
use reelup_protocol::{FinalizeRequest, MessageType, TaskStatus, UploadEvent};
use reelup_task_store::{StoreError, TaskStore};
use reelup_transfer::{ChunkInfo, ChunkSource, FileRef, TaskId, TransferError, UploadTask};
use reelup_transport::TransportClient;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::bridge::{BackgroundBridge, DelegatedUpload, ForegroundOnly};
use crate::config::UploaderConfig;
use crate::error::UploadError;
use crate::events::EventEmitter;
use crate::resolver::SourceResolver;
use crate::retry::{RetryError, RetryPolicy};
use crate::sender::ChunkSender;
use crate::signals::NetworkSignals;

/// Owns in-flight upload tasks and drives them to completion.
///
/// Cheap to share behind an `Arc`; all methods take `&self`. Scheduling
/// runs on spawned tokio tasks, so the coordinator must be used inside a
/// tokio runtime.
pub struct UploadCoordinator {
    inner: Arc<Inner>,
}

/// Assembles an [`UploadCoordinator`].
pub struct CoordinatorBuilder {
    store: Arc<dyn TaskStore>,
    transport: Arc<dyn TransportClient>,
    config: UploaderConfig,
    bridge: Option<Arc<dyn BackgroundBridge>>,
    signals: Option<NetworkSignals>,
    events: Option<EventEmitter>,
}

impl CoordinatorBuilder {
    pub fn config(mut self, config: UploaderConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to [`ForegroundOnly`].
    pub fn bridge(mut self, bridge: Arc<dyn BackgroundBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    /// Defaults to [`NetworkSignals::always_online`].
    pub fn signals(mut self, signals: NetworkSignals) -> Self {
        self.signals = Some(signals);
        self
    }

    pub fn events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> UploadCoordinator {
        let sender = ChunkSender {
            transport: self.transport,
            retry: RetryPolicy::new(self.config.retry.clone()),
            signals: self.signals.unwrap_or_default(),
        };
        UploadCoordinator {
            inner: Arc::new(Inner {
                store: self.store,
                sender,
                bridge: self.bridge.unwrap_or_else(|| Arc::new(ForegroundOnly)),
                events: self.events.unwrap_or_default(),
                config: self.config,
                active: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }
}

impl UploadCoordinator {
    pub fn builder(
        store: Arc<dyn TaskStore>,
        transport: Arc<dyn TransportClient>,
    ) -> CoordinatorBuilder {
        CoordinatorBuilder {
            store,
            transport,
            config: UploaderConfig::default(),
            bridge: None,
            signals: None,
            events: None,
        }
    }

    /// Foreground-only coordinator with default signals.
    pub fn new(
        store: Arc<dyn TaskStore>,
        transport: Arc<dyn TransportClient>,
        config: UploaderConfig,
    ) -> Self {
        Self::builder(store, transport).config(config).build()
    }

    pub fn events(&self) -> &EventEmitter {
        &self.inner.events
    }

    /// Shorthand for `events().subscribe()`.
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.inner.config
    }

    /// Plans, persists and starts uploading a new task.
    ///
    /// `source` must hold exactly `file.size` bytes; it stays attached to
    /// the task for as long as this coordinator tracks it.
    pub async fn create_upload(
        &self,
        file: FileRef,
        metadata: serde_json::Value,
        source: Arc<dyn ChunkSource>,
    ) -> Result<TaskId, UploadError> {
        self.inner.ensure_running()?;
        check_source(file.size, source.as_ref())?;

        let task = UploadTask::new(file, metadata, self.inner.config.chunk_size)?;
        let task_id = task.id.clone();
        self.inner.persist_task(task.clone()).await?;
        info!(
            task = %task_id,
            file = %task.file_ref.name,
            size = task.file_ref.size,
            chunks = task.total_chunks(),
            "upload task created"
        );

        let active = self.inner.track(ActiveTask::new(task, source));
        self.inner.begin_run(&active).await?;
        Ok(task_id)
    }

    /// Stops scheduling new chunks. In-flight chunks finish and are recorded.
    pub async fn pause_upload(&self, task_id: &TaskId) -> Result<(), UploadError> {
        let Some(active) = self.inner.lookup(task_id) else {
            return match self.inner.load(task_id).await? {
                Some(task) if task.status == TaskStatus::Uploading => {
                    Err(UploadError::NotActive(task_id.to_string()))
                }
                Some(task) => Err(invalid_state(task_id, task.status, "pause")),
                None => Err(UploadError::UnknownTask(task_id.to_string())),
            };
        };

        let mut state = active.state.lock().await;
        if state.task.status != TaskStatus::Uploading {
            return Err(invalid_state(task_id, state.task.status, "pause"));
        }
        let mut next = state.task.clone();
        next.transition(TaskStatus::Pending)?;
        self.inner.persist_task(next.clone()).await?;
        state.task = next;

        active.stop_run();
        active.status.send_replace(TaskStatus::Pending);
        info!(
            task = %task_id,
            uploaded = state.task.uploaded_chunks(),
            total = state.task.total_chunks(),
            "upload paused"
        );
        Ok(())
    }

    /// Re-enters scheduling, skipping chunks already uploaded.
    ///
    /// Valid for paused, interrupted and failed tasks; resuming a failed
    /// task resets its task-level retry budget. A task this coordinator does
    /// not track yet needs `source`; a tracked one keeps its current source
    /// unless a new one is passed.
    pub async fn resume_upload(
        &self,
        task_id: &TaskId,
        source: Option<Arc<dyn ChunkSource>>,
    ) -> Result<(), UploadError> {
        self.inner.ensure_running()?;

        let active = match self.inner.lookup(task_id) {
            Some(active) => {
                if let Some(source) = source {
                    let size = active.state.lock().await.task.file_ref.size;
                    check_source(size, source.as_ref())?;
                    active.set_source(source);
                }
                active
            }
            None => {
                let task = self
                    .inner
                    .load(task_id)
                    .await?
                    .ok_or_else(|| UploadError::UnknownTask(task_id.to_string()))?;
                if task.status == TaskStatus::Completed {
                    return Err(invalid_state(task_id, task.status, "resume"));
                }
                let source = source.ok_or_else(|| UploadError::SourceRequired(task_id.to_string()))?;
                check_source(task.file_ref.size, source.as_ref())?;
                self.inner.track(ActiveTask::new(task, source))
            }
        };

        self.inner.begin_run(&active).await
    }

    /// Startup recovery: resumes every persisted task that is neither
    /// completed nor failed.
    ///
    /// Tasks whose source `resolver` cannot provide stay persisted and
    /// untouched. Returns the IDs that were resumed.
    pub async fn initialize(
        &self,
        resolver: &dyn SourceResolver,
    ) -> Result<Vec<TaskId>, UploadError> {
        self.inner.ensure_running()?;

        let unfinished = self.inner.with_store(|s| s.list_unfinished()).await?;
        let mut resumed = Vec::new();
        for task in unfinished {
            let task_id = task.id.clone();
            if self.inner.lookup(&task_id).is_some() {
                continue;
            }
            let Some(source) = resolver.resolve(&task.file_ref) else {
                warn!(task = %task_id, file = %task.file_ref.name, "no source for unfinished upload, leaving it persisted");
                continue;
            };
            if let Err(e) = check_source(task.file_ref.size, source.as_ref()) {
                warn!(task = %task_id, error = %e, "source does not match unfinished upload");
                continue;
            }

            let active = self.inner.track(ActiveTask::new(task, source));
            match self.inner.begin_run(&active).await {
                Ok(()) => resumed.push(task_id),
                Err(e) => warn!(task = %task_id, error = %e, "could not resume upload"),
            }
        }

        info!(resumed = resumed.len(), "startup recovery finished");
        Ok(resumed)
    }

    /// Stops all scheduling and the background bridge, then waits for
    /// in-flight chunks to be recorded.
    ///
    /// Persisted status is left as is, so a later [`initialize`] picks the
    /// same tasks up again. The coordinator accepts no new work afterwards.
    ///
    /// [`initialize`]: UploadCoordinator::initialize
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.bridge.shutdown();
        let active: Vec<Arc<ActiveTask>> = self.inner.tracked().values().cloned().collect();
        for task in active {
            task.wait_idle().await;
        }
        info!("upload coordinator shut down");
    }

    /// Current state of a task, from memory if tracked, else from the store.
    pub async fn task(&self, task_id: &TaskId) -> Result<Option<UploadTask>, UploadError> {
        if let Some(active) = self.inner.lookup(task_id) {
            return Ok(Some(active.state.lock().await.task.clone()));
        }
        self.inner.load(task_id).await
    }

    /// Watches the status of a tracked task.
    pub fn subscribe_status(&self, task_id: &TaskId) -> Option<watch::Receiver<TaskStatus>> {
        self.inner
            .lookup(task_id)
            .map(|active| active.status.subscribe())
    }

    /// Resolves once no scheduling run is live for `task_id`.
    pub async fn wait_idle(&self, task_id: &TaskId) {
        if let Some(active) = self.inner.lookup(task_id) {
            active.wait_idle().await;
        }
    }

    /// IDs of the tasks this coordinator currently tracks.
    pub fn active_tasks(&self) -> Vec<TaskId> {
        self.inner.tracked().keys().cloned().collect()
    }
}

fn check_source(expected: u64, source: &dyn ChunkSource) -> Result<(), UploadError> {
    let actual = source.len();
    if actual != expected {
        return Err(TransferError::SourceMismatch { expected, actual }.into());
    }
    Ok(())
}

fn invalid_state(task_id: &TaskId, status: TaskStatus, action: &'static str) -> UploadError {
    UploadError::InvalidState {
        task_id: task_id.to_string(),
        status,
        action,
    }
}

// ---------------------------------------------------------------------------
// Tracked task state
// ---------------------------------------------------------------------------

struct TaskState {
    task: UploadTask,
    /// Last progress percent emitted for this task.
    last_progress: Option<u8>,
}

struct ActiveTask {
    id: TaskId,
    state: tokio::sync::Mutex<TaskState>,
    source: Mutex<Arc<dyn ChunkSource>>,
    /// Stop token of the current run; cancelled once the run must not start new transfers.
    run: Mutex<Option<CancellationToken>>,
    status: watch::Sender<TaskStatus>,
    /// Number of scheduling runs still alive (a paused run may still drain).
    runs: watch::Sender<usize>,
}

impl ActiveTask {
    fn new(task: UploadTask, source: Arc<dyn ChunkSource>) -> Arc<Self> {
        let (status, _) = watch::channel(task.status);
        let (runs, _) = watch::channel(0);
        Arc::new(Self {
            id: task.id.clone(),
            state: tokio::sync::Mutex::new(TaskState {
                task,
                last_progress: None,
            }),
            source: Mutex::new(source),
            run: Mutex::new(None),
            status,
            runs,
        })
    }

    fn source(&self) -> Arc<dyn ChunkSource> {
        Arc::clone(&self.source.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn set_source(&self, source: Arc<dyn ChunkSource>) {
        *self.source.lock().unwrap_or_else(|e| e.into_inner()) = source;
    }

    fn is_running(&self) -> bool {
        self.run
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    fn stop_run(&self) {
        if let Some(token) = self.run.lock().unwrap_or_else(|e| e.into_inner()).take() {
            token.cancel();
        }
    }

    async fn pending(&self) -> (Vec<ChunkInfo>, u32) {
        let state = self.state.lock().await;
        (state.task.pending_chunks(), state.task.total_chunks())
    }

    async fn wait_idle(&self) {
        let mut runs = self.runs.subscribe();
        loop {
            let idle = *runs.borrow_and_update() == 0;
            if idle || runs.changed().await.is_err() {
                return;
            }
        }
    }
}

enum RunOutcome {
    /// Every chunk is acknowledged; finalize next.
    AllUploaded,
    /// Paused or shut down.
    Stopped,
    /// A chunk failed for good in this run.
    ChunkFailed(UploadError),
    /// State could not be persisted; the run must not go on.
    Halted(UploadError),
}

// ---------------------------------------------------------------------------
// Engine internals
// ---------------------------------------------------------------------------

struct Inner {
    store: Arc<dyn TaskStore>,
    sender: ChunkSender,
    bridge: Arc<dyn BackgroundBridge>,
    events: EventEmitter,
    config: UploaderConfig,
    active: Mutex<HashMap<TaskId, Arc<ActiveTask>>>,
    shutdown: CancellationToken,
}

impl Inner {
    fn ensure_running(&self) -> Result<(), UploadError> {
        if self.shutdown.is_cancelled() {
            Err(UploadError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn tracked(&self) -> MutexGuard<'_, HashMap<TaskId, Arc<ActiveTask>>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lookup(&self, task_id: &TaskId) -> Option<Arc<ActiveTask>> {
        self.tracked().get(task_id).cloned()
    }

    /// Tracks `active` unless the task is tracked already; returns the tracked entry.
    fn track(&self, active: Arc<ActiveTask>) -> Arc<ActiveTask> {
        Arc::clone(
            self.tracked()
                .entry(active.id.clone())
                .or_insert(active),
        )
    }

    /// Runs a store call on the blocking pool.
    async fn with_store<T, F>(&self, f: F) -> Result<T, UploadError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn TaskStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| UploadError::Worker(format!("store task failed: {e}")))?
            .map_err(UploadError::from)
    }

    async fn persist_task(&self, task: UploadTask) -> Result<(), UploadError> {
        self.with_store(move |s| s.put(&task)).await
    }

    async fn load(&self, task_id: &TaskId) -> Result<Option<UploadTask>, UploadError> {
        let task_id = task_id.clone();
        self.with_store(move |s| s.get(&task_id)).await
    }

    fn parallelism(&self) -> usize {
        if self.sender.signals.is_constrained() {
            1
        } else {
            self.config.max_parallel_chunks.max(1)
        }
    }

    /// Moves the task to `uploading` and spawns a scheduling run.
    ///
    /// No-op when a run is already live.
    async fn begin_run(self: &Arc<Self>, active: &Arc<ActiveTask>) -> Result<(), UploadError> {
        self.ensure_running()?;

        let mut state = active.state.lock().await;
        let status = state.task.status;
        match status {
            TaskStatus::Completed => return Err(invalid_state(&active.id, status, "resume")),
            TaskStatus::Uploading if active.is_running() => return Ok(()),
            _ => {}
        }

        let mut next = state.task.clone();
        if status != TaskStatus::Uploading {
            next.transition(TaskStatus::Uploading)?;
        }
        if status == TaskStatus::Failed {
            next.retry_count = 0;
            next.last_error = None;
        }
        if next != state.task {
            self.persist_task(next.clone()).await?;
            state.task = next;
        }

        // A release racing with this resume may have dropped the entry.
        self.track(Arc::clone(active));
        let stop = self.shutdown.child_token();
        *active.run.lock().unwrap_or_else(|e| e.into_inner()) = Some(stop.clone());
        active.status.send_replace(TaskStatus::Uploading);
        active.runs.send_modify(|n| *n += 1);
        info!(
            task = %active.id,
            from = %status,
            uploaded = state.task.uploaded_chunks(),
            total = state.task.total_chunks(),
            "upload started"
        );
        drop(state);

        tokio::spawn(Arc::clone(self).drive(Arc::clone(active), stop));
        Ok(())
    }

    /// One scheduling run, including task-level restarts and finalize.
    async fn drive(self: Arc<Self>, active: Arc<ActiveTask>, stop: CancellationToken) {
        loop {
            match self.run_chunks(&active, &stop).await {
                RunOutcome::AllUploaded => {
                    self.finalize(&active, &stop).await;
                    break;
                }
                RunOutcome::Stopped => {
                    debug!(task = %active.id, "run stopped");
                    break;
                }
                RunOutcome::Halted(e) => {
                    error!(task = %active.id, error = %e, "upload halted, task left resumable");
                    self.events.error(&active.id, &e);
                    break;
                }
                RunOutcome::ChunkFailed(e) => {
                    let Some(delay) = self.handle_chunk_failure(&active, &e).await else {
                        break;
                    };
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        stop.cancel();
        self.release(&active).await;
        active.runs.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Stops tracking a task that reached a terminal state.
    async fn release(&self, active: &Arc<ActiveTask>) {
        let state = active.state.lock().await;
        if !state.task.status.is_terminal() || active.is_running() {
            return;
        }
        let mut tracked = self.tracked();
        if tracked
            .get(&active.id)
            .is_some_and(|entry| Arc::ptr_eq(entry, active))
        {
            tracked.remove(&active.id);
            debug!(task = %active.id, status = %state.task.status, "task released");
        }
    }

    async fn run_chunks(self: &Arc<Self>, active: &Arc<ActiveTask>, stop: &CancellationToken) -> RunOutcome {
        if stop.is_cancelled() {
            return RunOutcome::Stopped;
        }
        if self.bridge.is_available()
            && let Some(outcome) = self.run_delegated(active, stop).await
        {
            return outcome;
        }
        self.run_in_context(active, stop).await
    }

    /// Sends pending chunks from this runtime with a bounded window.
    async fn run_in_context(
        self: &Arc<Self>,
        active: &Arc<ActiveTask>,
        stop: &CancellationToken,
    ) -> RunOutcome {
        let (pending, total) = active.pending().await;
        let source = active.source();
        let mut queue = pending.into_iter();
        let mut in_flight = JoinSet::new();
        let mut failure = None;
        let mut halted = None;
        let retrying = Arc::new(AtomicUsize::new(0));

        loop {
            // No new chunks while one is backing off; its recovery or
            // failure decides whether the run goes on.
            while failure.is_none()
                && halted.is_none()
                && !stop.is_cancelled()
                && retrying.load(Ordering::SeqCst) == 0
                && in_flight.len() < self.parallelism()
            {
                let Some(chunk) = queue.next() else {
                    break;
                };
                let sender = self.sender.clone();
                let source = Arc::clone(&source);
                let task_id = active.id.clone();
                let stop = stop.clone();
                let retrying = Arc::clone(&retrying);
                in_flight.spawn(async move {
                    let result = sender
                        .send(source, &task_id, &chunk, total, &stop, &retrying)
                        .await;
                    (chunk.index, result)
                });
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            match joined {
                Ok((index, Ok(etag))) => {
                    if let Err(e) = self.record_chunk(active, index, etag).await
                        && halted.is_none()
                    {
                        halted = Some(e);
                    }
                }
                Ok((_, Err(UploadError::Retry(RetryError::Cancelled)))) => {}
                Ok((index, Err(e))) => {
                    warn!(task = %active.id, chunk = index, error = %e, "chunk failed");
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(UploadError::Worker(e.to_string()));
                    }
                }
            }
        }

        self.settle(active, stop, failure, halted).await
    }

    /// Hands pending chunks to the bridge and applies its messages.
    ///
    /// Returns `None` when the caller should continue in context instead.
    async fn run_delegated(
        self: &Arc<Self>,
        active: &Arc<ActiveTask>,
        stop: &CancellationToken,
    ) -> Option<RunOutcome> {
        let (pending, total) = active.pending().await;
        if pending.is_empty() {
            return None;
        }

        let (reply, mut messages) = mpsc::unbounded_channel();
        let job_stop = stop.child_token();
        let job = DelegatedUpload {
            task_id: active.id.clone(),
            total_chunks: total,
            chunks: pending,
            source: active.source(),
            parallelism: self.parallelism(),
            stop: job_stop.clone(),
            reply,
        };
        if let Err(e) = self.bridge.delegate(job) {
            warn!(task = %active.id, error = %e, "delegation failed, uploading in foreground");
            return None;
        }
        debug!(task = %active.id, "run delegated to background");

        let mut failure = None;
        let mut halted = None;
        let mut completed = false;
        while let Some(msg) = messages.recv().await {
            if msg.task_id != active.id.as_str() {
                warn!(task = %active.id, other = %msg.task_id, "ignoring message for another task");
                continue;
            }
            match msg.msg_type {
                MessageType::ChunkUploaded => match msg.expect_payload::<ChunkUploadedPayload>() {
                    Ok(p) => {
                        if let Err(e) = self.record_chunk(active, p.chunk_index, p.etag).await
                            && halted.is_none()
                        {
                            job_stop.cancel();
                            halted = Some(e);
                        }
                    }
                    Err(e) => warn!(task = %active.id, error = %e, "malformed chunk message"),
                },
                MessageType::Progress => trace!(task = %active.id, "background progress"),
                MessageType::Error => {
                    let payload = msg.expect_payload::<ErrorPayload>().unwrap_or_else(|e| ErrorPayload {
                        chunk_index: None,
                        reason: format!("malformed error message: {e}"),
                        permanent: false,
                    });
                    warn!(
                        task = %active.id,
                        chunk = ?payload.chunk_index,
                        error = %payload.reason,
                        "background chunk failed"
                    );
                    if failure.is_none() {
                        failure = Some(UploadError::Delegated {
                            reason: payload.reason,
                            permanent: payload.permanent,
                        });
                    }
                }
                MessageType::Complete => completed = true,
            }
        }

        if halted.is_none() && failure.is_none() && !completed && !stop.is_cancelled() {
            warn!(task = %active.id, "background job ended early, continuing in foreground");
            return None;
        }
        Some(self.settle(active, stop, failure, halted).await)
    }

    async fn settle(
        &self,
        active: &ActiveTask,
        stop: &CancellationToken,
        failure: Option<UploadError>,
        halted: Option<UploadError>,
    ) -> RunOutcome {
        if let Some(e) = halted {
            return RunOutcome::Halted(e);
        }
        // Failures that land after a pause leave the chunk pending.
        if stop.is_cancelled() {
            return RunOutcome::Stopped;
        }
        if let Some(e) = failure {
            return RunOutcome::ChunkFailed(e);
        }
        if active.state.lock().await.task.is_fully_uploaded() {
            RunOutcome::AllUploaded
        } else {
            RunOutcome::Stopped
        }
    }

    /// Persists and applies one chunk acknowledgment, then reports progress.
    ///
    /// A repeated acknowledgment keeps the first etag and emits nothing.
    async fn record_chunk(
        &self,
        active: &ActiveTask,
        index: u32,
        etag: String,
    ) -> Result<(), UploadError> {
        let mut state = active.state.lock().await;
        let updated = {
            let chunk = state
                .task
                .chunk(index)
                .ok_or(TransferError::UnknownChunk(index))?;
            if chunk.uploaded {
                if chunk.etag.as_deref() == Some(etag.as_str()) {
                    debug!(task = %active.id, chunk = index, "duplicate acknowledgment");
                } else {
                    warn!(task = %active.id, chunk = index, "acknowledged again with a different etag, keeping the first");
                }
                return Ok(());
            }
            let mut chunk = chunk.clone();
            chunk.mark_uploaded(etag.clone());
            chunk
        };

        let task_id = active.id.clone();
        self.with_store(move |s| s.put_chunk(&task_id, &updated))
            .await?;
        state.task.mark_chunk_uploaded(index, etag)?;

        let percent = state.task.progress_percent();
        state.last_progress = Some(percent);
        debug!(
            task = %active.id,
            chunk = index,
            uploaded = state.task.uploaded_chunks(),
            total = state.task.total_chunks(),
            percent,
            "chunk uploaded"
        );
        self.events.progress(&active.id, percent);
        Ok(())
    }

    /// Decides between a task-level restart and failing the task.
    ///
    /// Returns the delay before the restart, or `None` when the run ends.
    async fn handle_chunk_failure(&self, active: &ActiveTask, err: &UploadError) -> Option<Duration> {
        let mut state = active.state.lock().await;
        if state.task.status != TaskStatus::Uploading {
            return None;
        }
        let reason = err.to_string();

        if !err.is_permanent() && state.task.retry_count < self.config.max_task_retries {
            let mut next = state.task.clone();
            next.retry_count += 1;
            next.last_error = Some(reason.clone());
            next.updated_at = Utc::now();
            if let Err(e) = self.persist_task(next.clone()).await {
                error!(task = %active.id, error = %e, "could not persist task retry");
                self.events.error(&active.id, &e);
                return None;
            }
            let attempt = next.retry_count;
            state.task = next;
            warn!(
                task = %active.id,
                attempt,
                max_task_retries = self.config.max_task_retries,
                error = %reason,
                "restarting upload"
            );
            return Some(self.sender.retry.config().delay_for_attempt(attempt));
        }

        let mut next = state.task.clone();
        if let Err(e) = next.transition(TaskStatus::Failed) {
            error!(task = %active.id, error = %e, "cannot fail task");
            return None;
        }
        next.last_error = Some(reason.clone());
        match self.persist_task(next.clone()).await {
            Ok(()) => {
                state.task = next;
                active.status.send_replace(TaskStatus::Failed);
                error!(task = %active.id, error = %reason, "upload failed");
                self.events.error(&active.id, &reason);
            }
            Err(e) => {
                error!(task = %active.id, error = %e, "could not persist failure, task left resumable");
                self.events.error(&active.id, format!("{reason} ({e})"));
            }
        }
        None
    }

    /// Calls finalize with the ordered chunk list and completes the task.
    ///
    /// A failed finalize leaves the task `uploading` with every chunk
    /// recorded; the next resume finalizes again without re-uploading.
    async fn finalize(&self, active: &ActiveTask, stop: &CancellationToken) {
        let request = {
            let mut state = active.state.lock().await;
            if state.task.status != TaskStatus::Uploading {
                return;
            }
            let Some(chunks) = state.task.finalize_chunks() else {
                warn!(task = %active.id, "finalize requested with chunks missing");
                return;
            };
            if state.last_progress != Some(100) {
                state.last_progress = Some(100);
                self.events.progress(&active.id, 100);
            }
            FinalizeRequest {
                task_id: active.id.to_string(),
                metadata: state.task.metadata.clone(),
                chunks,
            }
        };

        info!(task = %active.id, chunks = request.chunks.len(), "finalizing upload");
        let transport = &self.sender.transport;
        let result = self
            .sender
            .retry
            .execute_with_retry(|_| transport.finalize(&request), &self.sender.signals, stop)
            .await;

        let response = match result {
            Ok(response) => response,
            Err(RetryError::Cancelled) => {
                debug!(task = %active.id, "finalize cancelled");
                return;
            }
            Err(e) => {
                warn!(task = %active.id, error = %e, "finalize failed, task stays resumable");
                let mut state = active.state.lock().await;
                let mut next = state.task.clone();
                next.last_error = Some(format!("finalize failed: {e}"));
                next.updated_at = Utc::now();
                if self.persist_task(next.clone()).await.is_ok() {
                    state.task = next;
                }
                self.events.error(&active.id, format!("finalize failed: {e}"));
                return;
            }
        };

        let mut state = active.state.lock().await;
        if state.task.status != TaskStatus::Uploading {
            debug!(task = %active.id, "paused during finalize, will finalize again on resume");
            return;
        }
        let mut next = state.task.clone();
        if let Err(e) = next.transition(TaskStatus::Completed) {
            error!(task = %active.id, error = %e, "cannot complete task");
            return;
        }
        next.server_result = Some(response.0);
        next.last_error = None;
        if let Err(e) = self.persist_task(next.clone()).await {
            error!(task = %active.id, error = %e, "could not persist completion, task left resumable");
            self.events.error(&active.id, &e);
            return;
        }
        state.task = next;
        active.status.send_replace(TaskStatus::Completed);
        info!(task = %active.id, "upload completed");
        self.events.complete(&active.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeError, WorkerBridge};
    use crate::config::RetryConfig;
    use crate::signals;
    use crate::testing::ScriptedTransport;
    use reelup_task_store::{FileTaskStore, MemoryTaskStore};
    use reelup_transfer::{MemorySource, checksum_bytes};
    use reelup_transport::TransportError;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    const MIB: u64 = 1024 * 1024;

    fn fast_config(chunk_size: u64) -> UploaderConfig {
        UploaderConfig::default()
            .with_chunk_size(chunk_size)
            .with_retry(RetryConfig::fixed(Duration::from_millis(1)))
    }

    fn bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn source(data: &[u8]) -> Arc<dyn ChunkSource> {
        Arc::new(MemorySource::new(data.to_vec()))
    }

    fn video(size: u64) -> FileRef {
        FileRef::new("talk.mp4", size, "video/mp4")
    }

    fn coordinator(
        store: Arc<dyn TaskStore>,
        transport: &Arc<ScriptedTransport>,
        config: UploaderConfig,
    ) -> UploadCoordinator {
        UploadCoordinator::new(store, Arc::clone(transport) as Arc<dyn TransportClient>, config)
    }

    async fn settle(coordinator: &UploadCoordinator, task_id: &TaskId) {
        tokio::time::timeout(Duration::from_secs(10), coordinator.wait_idle(task_id))
            .await
            .expect("upload did not settle");
    }

    fn drain(rx: &mut broadcast::Receiver<UploadEvent>) -> Vec<UploadEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn progress_values(events: &[UploadEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|e| match e {
                UploadEvent::UploadProgress { progress, .. } => Some(*progress),
                _ => None,
            })
            .collect()
    }

    async fn next_progress(rx: &mut broadcast::Receiver<UploadEvent>) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("no progress")
                .unwrap();
            if matches!(event, UploadEvent::UploadProgress { .. }) {
                return;
            }
        }
    }

    async fn stored(store: &dyn TaskStore, task_id: &TaskId) -> UploadTask {
        store.get(task_id).unwrap().expect("task persisted")
    }

    #[tokio::test]
    async fn uploads_twelve_mib_in_three_chunks() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let transport = Arc::new(ScriptedTransport::new());
        let coord = coordinator(Arc::clone(&store), &transport, fast_config(5 * MIB));
        let mut events = coord.subscribe();

        let data = bytes((12 * MIB) as usize);
        let id = coord
            .create_upload(video(12 * MIB), json!({"title": "Launch"}), source(&data))
            .await
            .unwrap();
        settle(&coord, &id).await;

        let id_str = id.to_string();
        assert_eq!(
            drain(&mut events),
            vec![
                UploadEvent::UploadProgress { task_id: id_str.clone(), progress: 33 },
                UploadEvent::UploadProgress { task_id: id_str.clone(), progress: 67 },
                UploadEvent::UploadProgress { task_id: id_str.clone(), progress: 100 },
                UploadEvent::UploadComplete { task_id: id_str.clone() },
            ]
        );

        let finalizes = transport.finalize_requests();
        assert_eq!(finalizes.len(), 1);
        assert_eq!(finalizes[0].metadata, json!({"title": "Launch"}));
        let indices: Vec<u32> = finalizes[0].chunks.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(transport.premature_finalizes(), 0);

        let task = stored(store.as_ref(), &id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.server_result.is_some());
        assert!(coord.active_tasks().is_empty());
    }

    #[tokio::test]
    async fn transient_chunk_failures_then_success_completes() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let transport = Arc::new(ScriptedTransport::new());
        transport.fail_chunk(1, vec![TransportError::Timeout; 2]);
        let coord = coordinator(Arc::clone(&store), &transport, fast_config(5 * MIB));
        let mut events = coord.subscribe();

        let data = bytes((12 * MIB) as usize);
        let id = coord
            .create_upload(video(12 * MIB), json!({}), source(&data))
            .await
            .unwrap();
        settle(&coord, &id).await;

        assert_eq!(transport.calls_for(1), 3);
        assert_eq!(transport.calls_for(0), 1);
        assert_eq!(transport.calls_for(2), 1);

        // One success per chunk: no repeated progress step for chunk 1.
        let events = drain(&mut events);
        assert_eq!(progress_values(&events), vec![33, 67, 100]);
        let completes = events
            .iter()
            .filter(|e| matches!(e, UploadEvent::UploadComplete { .. }))
            .count();
        assert_eq!(completes, 1);
        assert!(!events.iter().any(|e| matches!(e, UploadEvent::UploadError { .. })));

        let task = stored(store.as_ref(), &id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.retry_count, 0);
        assert_eq!(transport.finalize_requests().len(), 1);
        assert_eq!(transport.premature_finalizes(), 0);
    }

    #[tokio::test]
    async fn pause_then_resume_uploads_only_missing_chunks() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let transport = Arc::new(ScriptedTransport::new());
        transport.set_delay(Duration::from_millis(20));
        let coord = coordinator(
            Arc::clone(&store),
            &transport,
            fast_config(4).with_max_parallel_chunks(1),
        );
        let mut events = coord.subscribe();

        let data = bytes(16);
        let id = coord
            .create_upload(video(16), json!({}), source(&data))
            .await
            .unwrap();
        next_progress(&mut events).await;
        coord.pause_upload(&id).await.unwrap();
        settle(&coord, &id).await;

        let paused = coord.task(&id).await.unwrap().unwrap();
        assert_eq!(paused.status, TaskStatus::Pending);
        assert!(paused.uploaded_chunks() >= 1 && paused.uploaded_chunks() < 4);
        assert_eq!(stored(store.as_ref(), &id).await.status, TaskStatus::Pending);
        assert!(transport.finalize_requests().is_empty());

        coord.resume_upload(&id, None).await.unwrap();
        settle(&coord, &id).await;

        for index in 0..4 {
            assert_eq!(transport.calls_for(index), 1, "chunk {index}");
        }
        assert_eq!(stored(store.as_ref(), &id).await.status, TaskStatus::Completed);

        // Same bytes, same etags as an uninterrupted run.
        let reference = Arc::new(ScriptedTransport::new());
        let other = coordinator(Arc::new(MemoryTaskStore::new()), &reference, fast_config(4));
        let other_id = other
            .create_upload(video(16), json!({}), source(&data))
            .await
            .unwrap();
        settle(&other, &other_id).await;
        assert_eq!(
            transport.finalize_requests()[0].chunks,
            reference.finalize_requests()[0].chunks
        );
    }

    #[tokio::test]
    async fn exhausted_chunk_fails_task_without_finalize() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let transport = Arc::new(ScriptedTransport::new());
        transport.fail_chunk(0, vec![TransportError::Timeout; 4]);
        let coord = coordinator(
            Arc::clone(&store),
            &transport,
            fast_config(4).with_max_parallel_chunks(1),
        );
        let mut events = coord.subscribe();

        let id = coord
            .create_upload(video(16), json!({}), source(&bytes(16)))
            .await
            .unwrap();
        settle(&coord, &id).await;

        assert_eq!(transport.chunk_calls(), vec![0, 0, 0]);
        assert!(transport.finalize_requests().is_empty());

        let task = stored(store.as_ref(), &id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 0);
        assert!(task.last_error.is_some());

        let events = drain(&mut events);
        assert!(matches!(events.last(), Some(UploadEvent::UploadError { .. })));
        assert!(!events.iter().any(|e| matches!(e, UploadEvent::UploadComplete { .. })));
    }

    #[tokio::test]
    async fn backoff_holds_back_new_chunks_at_default_parallelism() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let transport = Arc::new(ScriptedTransport::new());
        transport.set_delay(Duration::from_millis(20));
        transport.fail_chunk(0, vec![TransportError::Timeout; 4]);
        let config = UploaderConfig::default()
            .with_chunk_size(4)
            .with_retry(RetryConfig::fixed(Duration::from_millis(100)));
        assert_eq!(config.max_parallel_chunks, 3);
        let coord = coordinator(Arc::clone(&store), &transport, config);

        let id = coord
            .create_upload(video(40), json!({}), source(&bytes(40)))
            .await
            .unwrap();
        settle(&coord, &id).await;

        let task = stored(store.as_ref(), &id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(transport.finalize_requests().is_empty());

        // Chunks 1 and 2 were already in flight; nothing new started while
        // chunk 0 backed off and nothing after it failed.
        assert_eq!(transport.calls_for(0), 3);
        for index in 3..10 {
            assert_eq!(transport.calls_for(index), 0, "chunk {index}");
        }
        assert!(task.uploaded_chunks() <= 2);
    }

    #[tokio::test]
    async fn failed_task_resumes_with_fresh_budget() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let transport = Arc::new(ScriptedTransport::new());
        transport.fail_chunk(2, vec![TransportError::Timeout; 3]);
        let coord = coordinator(
            Arc::clone(&store),
            &transport,
            fast_config(4).with_max_parallel_chunks(1),
        );

        let data = bytes(16);
        let id = coord
            .create_upload(video(16), json!({}), source(&data))
            .await
            .unwrap();
        settle(&coord, &id).await;
        assert_eq!(stored(store.as_ref(), &id).await.status, TaskStatus::Failed);

        // Failed tasks are no longer tracked, so the source comes back with the resume.
        let err = coord.resume_upload(&id, None).await.unwrap_err();
        assert!(matches!(err, UploadError::SourceRequired(_)));
        coord.resume_upload(&id, Some(source(&data))).await.unwrap();
        settle(&coord, &id).await;

        let task = stored(store.as_ref(), &id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.retry_count, 0);
        assert!(task.last_error.is_none());
        assert_eq!(transport.calls_for(0), 1);
        assert_eq!(transport.calls_for(1), 1);
        assert_eq!(transport.calls_for(2), 4);
    }

    #[tokio::test]
    async fn task_level_retry_restarts_the_run() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let transport = Arc::new(ScriptedTransport::new());
        transport.fail_chunk(1, vec![TransportError::Network("reset".into()); 3]);
        let coord = coordinator(
            Arc::clone(&store),
            &transport,
            fast_config(4)
                .with_max_parallel_chunks(1)
                .with_max_task_retries(1),
        );

        let id = coord
            .create_upload(video(12), json!({}), source(&bytes(12)))
            .await
            .unwrap();
        settle(&coord, &id).await;

        let task = stored(store.as_ref(), &id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.retry_count, 1);
        assert_eq!(transport.calls_for(0), 1);
        assert_eq!(transport.calls_for(1), 4);
    }

    #[tokio::test]
    async fn permanent_rejection_skips_task_retries() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let transport = Arc::new(ScriptedTransport::new());
        transport.fail_chunk(
            0,
            vec![TransportError::Rejected {
                status: 413,
                body: "too large".into(),
            }],
        );
        let coord = coordinator(
            Arc::clone(&store),
            &transport,
            fast_config(4)
                .with_max_parallel_chunks(1)
                .with_max_task_retries(5),
        );

        let id = coord
            .create_upload(video(8), json!({}), source(&bytes(8)))
            .await
            .unwrap();
        settle(&coord, &id).await;

        let task = stored(store.as_ref(), &id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 0);
        assert_eq!(transport.chunk_calls(), vec![0]);
    }

    #[tokio::test]
    async fn restart_resumes_from_persisted_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let data = bytes(40);

        // State left behind by a process that died after two chunks.
        let mut task = UploadTask::new(video(40), json!({"title": "Demo"}), 10).unwrap();
        task.transition(TaskStatus::Uploading).unwrap();
        for index in 0..2u32 {
            let range = task.chunk_plan[index as usize].byte_range;
            let checksum = checksum_bytes(&data[range.start as usize..range.end as usize]);
            task.mark_chunk_uploaded(index, ScriptedTransport::etag_for(index, &checksum))
                .unwrap();
        }
        let id = task.id.clone();
        FileTaskStore::new(dir.path()).unwrap().put(&task).unwrap();

        let store: Arc<dyn TaskStore> = Arc::new(FileTaskStore::new(dir.path()).unwrap());
        let transport = Arc::new(ScriptedTransport::new());
        transport.preacknowledge([0, 1]);
        let coord = coordinator(Arc::clone(&store), &transport, fast_config(10));
        let mut events = coord.subscribe();

        let src = source(&data);
        let resolver = move |_: &FileRef| -> Option<Arc<dyn ChunkSource>> { Some(Arc::clone(&src)) };
        let resumed = coord.initialize(&resolver).await.unwrap();
        assert_eq!(resumed, vec![id.clone()]);
        settle(&coord, &id).await;

        let mut calls = transport.chunk_calls();
        calls.sort_unstable();
        assert_eq!(calls, vec![2, 3]);
        assert_eq!(transport.premature_finalizes(), 0);

        let finalize = &transport.finalize_requests()[0];
        let indices: Vec<u32> = finalize.chunks.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert_eq!(finalize.chunks[0].etag, task.chunk_plan[0].etag.clone().unwrap());

        assert_eq!(progress_values(&drain(&mut events)), vec![75, 100]);
        assert_eq!(stored(store.as_ref(), &id).await.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn initialize_skips_unresolvable_and_terminal_tasks() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let pending = UploadTask::new(video(8), json!({}), 4).unwrap();
        let mut failed = UploadTask::new(video(8), json!({}), 4).unwrap();
        failed.transition(TaskStatus::Uploading).unwrap();
        failed.transition(TaskStatus::Failed).unwrap();
        store.put(&pending).unwrap();
        store.put(&failed).unwrap();

        let transport = Arc::new(ScriptedTransport::new());
        let coord = coordinator(Arc::clone(&store), &transport, fast_config(4));
        let resolver = |_: &FileRef| -> Option<Arc<dyn ChunkSource>> { None };
        assert!(coord.initialize(&resolver).await.unwrap().is_empty());

        assert_eq!(stored(store.as_ref(), &pending.id).await.status, TaskStatus::Pending);
        assert_eq!(stored(store.as_ref(), &failed.id).await.status, TaskStatus::Failed);
        assert!(transport.chunk_calls().is_empty());
    }

    #[tokio::test]
    async fn progress_is_monotonic_under_parallelism() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let transport = Arc::new(ScriptedTransport::new());
        transport.set_delay(Duration::from_millis(2));
        let coord = coordinator(store, &transport, fast_config(10));
        let mut events = coord.subscribe();

        let id = coord
            .create_upload(video(100), json!({}), source(&bytes(100)))
            .await
            .unwrap();
        settle(&coord, &id).await;

        let events = drain(&mut events);
        let values = progress_values(&events);
        assert_eq!(values.len(), 10);
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(values.last(), Some(&100));
        assert!(matches!(events.last(), Some(UploadEvent::UploadComplete { .. })));
        assert!(transport.max_in_flight() <= 3);
    }

    #[tokio::test]
    async fn pause_and_resume_reject_invalid_states() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let transport = Arc::new(ScriptedTransport::new());
        let coord = coordinator(Arc::clone(&store), &transport, fast_config(4));

        let missing = TaskId::from_string("upl_missing");
        assert!(matches!(
            coord.pause_upload(&missing).await,
            Err(UploadError::UnknownTask(_))
        ));
        assert!(matches!(
            coord.resume_upload(&missing, None).await,
            Err(UploadError::UnknownTask(_))
        ));

        let data = bytes(8);
        let id = coord
            .create_upload(video(8), json!({}), source(&data))
            .await
            .unwrap();
        settle(&coord, &id).await;

        assert!(matches!(
            coord.pause_upload(&id).await,
            Err(UploadError::InvalidState { status: TaskStatus::Completed, .. })
        ));
        assert!(matches!(
            coord.resume_upload(&id, Some(source(&data))).await,
            Err(UploadError::InvalidState { status: TaskStatus::Completed, .. })
        ));

        // Pending and untracked, e.g. written by an earlier process.
        let orphan = UploadTask::new(video(8), json!({}), 4).unwrap();
        store.put(&orphan).unwrap();
        assert!(matches!(
            coord.pause_upload(&orphan.id).await,
            Err(UploadError::InvalidState { status: TaskStatus::Pending, .. })
        ));
        assert!(matches!(
            coord.resume_upload(&orphan.id, Some(source(&bytes(5)))).await,
            Err(UploadError::Transfer(TransferError::SourceMismatch { expected: 8, actual: 5 }))
        ));
    }

    #[tokio::test]
    async fn duplicate_acknowledgment_keeps_first_etag() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let transport = Arc::new(ScriptedTransport::new());
        let coord = coordinator(Arc::clone(&store), &transport, fast_config(4));
        let mut events = coord.subscribe();

        let task = UploadTask::new(video(8), json!({}), 4).unwrap();
        store.put(&task).unwrap();
        let id = task.id.clone();
        let active = ActiveTask::new(task, source(&bytes(8)));

        coord.inner.record_chunk(&active, 0, "first".into()).await.unwrap();
        coord.inner.record_chunk(&active, 0, "second".into()).await.unwrap();
        assert!(matches!(
            coord.inner.record_chunk(&active, 9, "x".into()).await,
            Err(UploadError::Transfer(TransferError::UnknownChunk(9)))
        ));

        assert_eq!(progress_values(&drain(&mut events)), vec![50]);
        let persisted = stored(store.as_ref(), &id).await;
        assert_eq!(persisted.chunk_plan[0].etag.as_deref(), Some("first"));
        assert_eq!(active.state.lock().await.task.chunk_plan[0].etag.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn failed_finalize_leaves_task_resumable() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let transport = Arc::new(ScriptedTransport::new());
        transport.fail_finalize(vec![
            TransportError::Server {
                status: 503,
                body: "busy".into(),
            };
            3
        ]);
        let coord = coordinator(Arc::clone(&store), &transport, fast_config(4));
        let mut events = coord.subscribe();

        let id = coord
            .create_upload(video(8), json!({}), source(&bytes(8)))
            .await
            .unwrap();
        settle(&coord, &id).await;

        let task = stored(store.as_ref(), &id).await;
        assert_eq!(task.status, TaskStatus::Uploading);
        assert!(task.is_fully_uploaded());
        assert!(task.last_error.as_deref().unwrap().contains("finalize"));
        assert!(matches!(
            drain(&mut events).last(),
            Some(UploadEvent::UploadError { .. })
        ));

        coord.resume_upload(&id, None).await.unwrap();
        settle(&coord, &id).await;

        assert_eq!(transport.chunk_calls().len(), 2);
        assert_eq!(transport.finalize_requests().len(), 4);
        assert_eq!(stored(store.as_ref(), &id).await.status, TaskStatus::Completed);
        assert_eq!(
            drain(&mut events),
            vec![UploadEvent::UploadComplete { task_id: id.to_string() }]
        );
    }

    /// Memory store whose next chunk write fails once armed.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryTaskStore,
        fail_next_chunk: AtomicBool,
    }

    impl TaskStore for FlakyStore {
        fn put(&self, task: &UploadTask) -> Result<(), StoreError> {
            self.inner.put(task)
        }

        fn get(&self, task_id: &TaskId) -> Result<Option<UploadTask>, StoreError> {
            self.inner.get(task_id)
        }

        fn put_chunk(&self, task_id: &TaskId, chunk: &ChunkInfo) -> Result<(), StoreError> {
            if self.fail_next_chunk.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::other("disk full")));
            }
            self.inner.put_chunk(task_id, chunk)
        }

        fn list(&self) -> Result<Vec<UploadTask>, StoreError> {
            self.inner.list()
        }

        fn purge(&self, task_id: &TaskId) -> Result<bool, StoreError> {
            self.inner.purge(task_id)
        }
    }

    #[tokio::test]
    async fn store_failure_halts_without_failing_task() {
        let store = Arc::new(FlakyStore::default());
        store.fail_next_chunk.store(true, Ordering::SeqCst);
        let transport = Arc::new(ScriptedTransport::new());
        let coord = coordinator(
            Arc::clone(&store) as Arc<dyn TaskStore>,
            &transport,
            fast_config(4).with_max_parallel_chunks(1),
        );
        let mut events = coord.subscribe();

        let id = coord
            .create_upload(video(12), json!({}), source(&bytes(12)))
            .await
            .unwrap();
        settle(&coord, &id).await;

        let task = stored(store.as_ref(), &id).await;
        assert_eq!(task.status, TaskStatus::Uploading);
        assert_eq!(task.uploaded_chunks(), 0);
        let events = drain(&mut events);
        assert!(matches!(&events[..], [UploadEvent::UploadError { error, .. }] if error.contains("disk full")));

        coord.resume_upload(&id, None).await.unwrap();
        settle(&coord, &id).await;
        assert_eq!(stored(store.as_ref(), &id).await.status, TaskStatus::Completed);
        assert_eq!(transport.calls_for(0), 2);
    }

    #[tokio::test]
    async fn shutdown_leaves_tasks_for_next_initialize() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let transport = Arc::new(ScriptedTransport::new());
        transport.set_delay(Duration::from_millis(20));
        let data = bytes(40);

        let first = coordinator(
            Arc::clone(&store),
            &transport,
            fast_config(10).with_max_parallel_chunks(1),
        );
        let mut events = first.subscribe();
        let id = first
            .create_upload(video(40), json!({}), source(&data))
            .await
            .unwrap();
        next_progress(&mut events).await;
        first.shutdown().await;

        let task = stored(store.as_ref(), &id).await;
        assert_eq!(task.status, TaskStatus::Uploading);
        assert!(task.uploaded_chunks() < 4);
        assert!(matches!(
            first.create_upload(video(40), json!({}), source(&data)).await,
            Err(UploadError::ShutDown)
        ));

        let second = coordinator(Arc::clone(&store), &transport, fast_config(10));
        let src = source(&data);
        let resolver = move |_: &FileRef| -> Option<Arc<dyn ChunkSource>> { Some(Arc::clone(&src)) };
        assert_eq!(second.initialize(&resolver).await.unwrap(), vec![id.clone()]);
        settle(&second, &id).await;

        assert_eq!(stored(store.as_ref(), &id).await.status, TaskStatus::Completed);
        for index in 0..4 {
            assert_eq!(transport.calls_for(index), 1, "chunk {index}");
        }
    }

    #[tokio::test]
    async fn offline_defers_transfers_until_reconnect() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let transport = Arc::new(ScriptedTransport::new());
        let (controller, network) = signals::channel();
        controller.set_online(false);
        let coord = UploadCoordinator::builder(Arc::clone(&store), Arc::clone(&transport) as Arc<dyn TransportClient>)
            .config(fast_config(4))
            .signals(network)
            .build();

        let id = coord
            .create_upload(video(8), json!({}), source(&bytes(8)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(transport.chunk_calls().is_empty());
        assert_eq!(stored(store.as_ref(), &id).await.status, TaskStatus::Uploading);

        controller.set_online(true);
        settle(&coord, &id).await;
        assert_eq!(stored(store.as_ref(), &id).await.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn constrained_network_sends_one_chunk_at_a_time() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.set_delay(Duration::from_millis(5));
        let (controller, network) = signals::channel();
        controller.set_constrained(true);
        let coord = UploadCoordinator::builder(
            Arc::new(MemoryTaskStore::new()),
            Arc::clone(&transport) as Arc<dyn TransportClient>,
        )
        .config(fast_config(4).with_max_parallel_chunks(3))
        .signals(network)
        .build();

        let id = coord
            .create_upload(video(16), json!({}), source(&bytes(16)))
            .await
            .unwrap();
        settle(&coord, &id).await;
        assert_eq!(transport.max_in_flight(), 1);
        assert_eq!(transport.finalize_requests().len(), 1);
    }

    #[tokio::test]
    async fn background_worker_uploads_and_coordinator_finalizes() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let transport = Arc::new(ScriptedTransport::new());
        let bridge = WorkerBridge::spawn(
            Arc::clone(&transport) as Arc<dyn TransportClient>,
            RetryPolicy::new(RetryConfig::fixed(Duration::from_millis(1))),
            NetworkSignals::always_online(),
        )
        .unwrap();
        let coord = UploadCoordinator::builder(Arc::clone(&store), Arc::clone(&transport) as Arc<dyn TransportClient>)
            .config(fast_config(5 * MIB))
            .bridge(Arc::new(bridge))
            .build();
        let mut events = coord.subscribe();

        let id = coord
            .create_upload(video(12 * MIB), json!({}), source(&bytes((12 * MIB) as usize)))
            .await
            .unwrap();
        settle(&coord, &id).await;

        assert_eq!(progress_values(&drain(&mut events)), vec![33, 67, 100]);
        assert_eq!(transport.finalize_requests().len(), 1);
        assert_eq!(transport.premature_finalizes(), 0);
        assert_eq!(stored(store.as_ref(), &id).await.status, TaskStatus::Completed);
        coord.shutdown().await;
    }

    struct RefusingBridge;

    impl BackgroundBridge for RefusingBridge {
        fn is_available(&self) -> bool {
            true
        }

        fn delegate(&self, _job: DelegatedUpload) -> Result<(), BridgeError> {
            Err(BridgeError::Unavailable)
        }
    }

    #[tokio::test]
    async fn refused_delegation_falls_back_to_foreground() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let transport = Arc::new(ScriptedTransport::new());
        let coord = UploadCoordinator::builder(Arc::clone(&store), Arc::clone(&transport) as Arc<dyn TransportClient>)
            .config(fast_config(4))
            .bridge(Arc::new(RefusingBridge))
            .build();

        let id = coord
            .create_upload(video(10), json!({}), source(&bytes(10)))
            .await
            .unwrap();
        settle(&coord, &id).await;
        assert_eq!(transport.chunk_calls().len(), 3);
        assert_eq!(stored(store.as_ref(), &id).await.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn background_failure_fails_task() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let transport = Arc::new(ScriptedTransport::new());
        transport.fail_chunk(
            1,
            vec![TransportError::Rejected {
                status: 400,
                body: "corrupt".into(),
            }],
        );
        let bridge = WorkerBridge::spawn(
            Arc::clone(&transport) as Arc<dyn TransportClient>,
            RetryPolicy::new(RetryConfig::fixed(Duration::from_millis(1))),
            NetworkSignals::always_online(),
        )
        .unwrap();
        let coord = UploadCoordinator::builder(Arc::clone(&store), Arc::clone(&transport) as Arc<dyn TransportClient>)
            .config(fast_config(4).with_max_parallel_chunks(1).with_max_task_retries(3))
            .bridge(Arc::new(bridge))
            .build();

        let id = coord
            .create_upload(video(12), json!({}), source(&bytes(12)))
            .await
            .unwrap();
        settle(&coord, &id).await;

        let task = stored(store.as_ref(), &id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.last_error.as_deref().unwrap().contains("background"));
        assert_eq!(task.uploaded_chunks(), 1);
        assert_eq!(transport.calls_for(1), 1);
        assert!(transport.finalize_requests().is_empty());
    }

    #[tokio::test]
    async fn empty_file_finalizes_immediately() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let transport = Arc::new(ScriptedTransport::new());
        let coord = coordinator(Arc::clone(&store), &transport, fast_config(4));
        let mut events = coord.subscribe();

        let id = coord
            .create_upload(video(0), json!({}), source(&[]))
            .await
            .unwrap();
        settle(&coord, &id).await;

        assert!(transport.chunk_calls().is_empty());
        assert!(transport.finalize_requests()[0].chunks.is_empty());
        assert_eq!(
            drain(&mut events),
            vec![
                UploadEvent::UploadProgress { task_id: id.to_string(), progress: 100 },
                UploadEvent::UploadComplete { task_id: id.to_string() },
            ]
        );
    }

    #[tokio::test]
    async fn create_rejects_mismatched_source() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let transport = Arc::new(ScriptedTransport::new());
        let coord = coordinator(Arc::clone(&store), &transport, fast_config(4));

        let err = coord
            .create_upload(video(10), json!({}), source(&bytes(9)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::Transfer(TransferError::SourceMismatch { expected: 10, actual: 9 })
        ));
        assert!(store.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_watch_reports_completion() {
        let transport = Arc::new(ScriptedTransport::new());
        let coord = coordinator(Arc::new(MemoryTaskStore::new()), &transport, fast_config(4));

        let id = coord
            .create_upload(video(8), json!({}), source(&bytes(8)))
            .await
            .unwrap();
        let status = coord.subscribe_status(&id).unwrap();
        assert_eq!(*status.borrow(), TaskStatus::Uploading);

        settle(&coord, &id).await;
        assert_eq!(*status.borrow(), TaskStatus::Completed);
        assert!(coord.subscribe_status(&id).is_none());
    }
}
