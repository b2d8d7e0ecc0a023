//! Upload error types.

use reelup_protocol::TaskStatus;
use reelup_task_store::StoreError;
use reelup_transfer::TransferError;

use crate::bridge::BridgeError;
use crate::retry::RetryError;

/// Errors produced by the upload coordinator.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("chunk transfer failed: {0}")]
    Retry(#[from] RetryError),

    #[error("bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("background upload failed: {reason}")]
    Delegated { reason: String, permanent: bool },

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("task {0} is not being uploaded by this coordinator")]
    NotActive(String),

    #[error("cannot {action} task {task_id} while {status}")]
    InvalidState {
        task_id: String,
        status: TaskStatus,
        action: &'static str,
    },

    #[error("task {0} has no attached source; pass one to resume")]
    SourceRequired(String),

    #[error("worker task failed: {0}")]
    Worker(String),

    #[error("coordinator is shut down")]
    ShutDown,
}

impl UploadError {
    /// Returns `true` if restarting the task cannot help.
    ///
    /// Permanent chunk failures skip the task-level retry budget.
    pub fn is_permanent(&self) -> bool {
        match self {
            UploadError::Retry(e) => e.is_permanent(),
            UploadError::Delegated { permanent, .. } => *permanent,
            UploadError::Transfer(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reelup_transport::TransportError;

    #[test]
    fn permanence_classification() {
        let exhausted = UploadError::Retry(RetryError::Exhausted {
            attempts: 3,
            last: TransportError::Timeout,
        });
        assert!(!exhausted.is_permanent());

        let rejected = UploadError::Retry(RetryError::Permanent(TransportError::Rejected {
            status: 400,
            body: "bad".into(),
        }));
        assert!(rejected.is_permanent());

        let unreadable = UploadError::Transfer(TransferError::Io(std::io::Error::other("gone")));
        assert!(unreadable.is_permanent());

        assert!(
            UploadError::Delegated {
                reason: "x".into(),
                permanent: true
            }
            .is_permanent()
        );
        assert!(!UploadError::Worker("panic".into()).is_permanent());
    }

    #[test]
    fn invalid_state_message() {
        let err = UploadError::InvalidState {
            task_id: "upl_1".into(),
            status: TaskStatus::Completed,
            action: "pause",
        };
        assert_eq!(err.to_string(), "cannot pause task upl_1 while completed");
    }
}
