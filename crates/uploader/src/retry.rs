//! Bounded per-chunk retry with exponential backoff.

use std::future::Future;

use reelup_transport::TransportError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::signals::NetworkSignals;

/// Terminal outcome of a retried operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryError {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: TransportError },

    #[error("permanent failure: {0}")]
    Permanent(TransportError),

    #[error("cancelled before completion")]
    Cancelled,
}

impl RetryError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, RetryError::Permanent(_))
    }

    /// The transport error that ended the operation, if any.
    pub fn last_error(&self) -> Option<&TransportError> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Permanent(e) => Some(e),
            RetryError::Cancelled => None,
        }
    }
}

/// Runs transport operations under a [`RetryConfig`].
///
/// Retry state lives on the stack of one [`execute_with_retry`] call, so
/// every call (and thus every resumed chunk) starts with a fresh budget.
///
/// [`execute_with_retry`]: RetryPolicy::execute_with_retry
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Runs `op` until it succeeds, fails permanently or runs out of attempts.
    ///
    /// Each attempt first waits for connectivity. An attempt still pending
    /// when the network drops is abandoned as [`TransportError::Offline`],
    /// which is retryable. `cancel` stops further attempts and backoff
    /// waits; it never aborts an attempt already started.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        mut op: F,
        signals: &NetworkSignals,
        cancel: &CancellationToken,
    ) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() || !signals.wait_online(cancel).await {
                return Err(RetryError::Cancelled);
            }
            attempt += 1;

            let outcome = tokio::select! {
                biased;
                result = op(attempt) => result,
                _ = signals.wait_offline() => Err(TransportError::Offline),
            };

            let err = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !err.is_retryable() {
                return Err(RetryError::Permanent(err));
            }
            if attempt >= max_attempts {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = self.config.delay_for_attempt(attempt);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "attempt failed, retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
