//! Engine configuration.

use std::time::Duration;

use rand::Rng;
use reelup_transfer::DEFAULT_CHUNK_SIZE;

/// Per-chunk retry schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts per chunk, the first one included.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
    /// Spread each delay by ±25%.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(15),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Flat delay between attempts, no jitter.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            backoff_factor: 1.0,
            jitter: false,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Calculates the delay after a failed attempt (1-based),
    /// with ±25% jitter when enabled.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if !self.jitter {
            return Duration::from_secs_f64(capped.max(0.0));
        }
        let jitter = capped * 0.25;
        let offset: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
        Duration::from_secs_f64((capped + jitter * offset).max(0.0))
    }
}

/// Coordinator settings.
#[derive(Debug, Clone, PartialEq)]
pub struct UploaderConfig {
    /// Bytes per chunk for newly created tasks.
    pub chunk_size: u64,
    /// In-flight chunk requests per task.
    pub max_parallel_chunks: usize,
    /// Task-level restarts allowed after a chunk exhausts its attempts.
    pub max_task_retries: u32,
    pub retry: RetryConfig,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_parallel_chunks: 3,
            max_task_retries: 0,
            retry: RetryConfig::default(),
        }
    }
}

impl UploaderConfig {
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_max_parallel_chunks(mut self, n: usize) -> Self {
        self.max_parallel_chunks = n.max(1);
        self
    }

    pub fn with_max_task_retries(mut self, n: u32) -> Self {
        self.max_task_retries = n;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}
