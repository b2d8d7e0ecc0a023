//! Lifecycle notifications for UI and notification collaborators.

use std::fmt::Display;

use reelup_protocol::UploadEvent;
use reelup_transfer::TaskId;
use tokio::sync::broadcast;
use tracing::trace;

const EVENT_CAPACITY: usize = 256;

/// Fire-and-forget fan-out of [`UploadEvent`]s.
///
/// Sending never blocks and never fails; events are dropped when nobody
/// listens, and a slow subscriber loses the oldest ones. The latest state
/// is always recoverable from the task store.
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<UploadEvent>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.tx.subscribe()
    }

    pub fn progress(&self, task_id: &TaskId, percent: u8) {
        self.emit(UploadEvent::UploadProgress {
            task_id: task_id.to_string(),
            progress: percent,
        });
    }

    pub fn complete(&self, task_id: &TaskId) {
        self.emit(UploadEvent::UploadComplete {
            task_id: task_id.to_string(),
        });
    }

    pub fn error(&self, task_id: &TaskId, reason: impl Display) {
        self.emit(UploadEvent::UploadError {
            task_id: task_id.to_string(),
            error: reason.to_string(),
        });
    }

    fn emit(&self, event: UploadEvent) {
        trace!(event = event.name(), task = event.task_id(), "emitting");
        let _ = self.tx.send(event);
    }
}
