use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BoxError, ConfigError, ConfigResult};

/// A deferred retry candidate owned by the transaction queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTransaction {
    /// Caller-chosen unique id.
    pub id: String,
    /// Operation name, used to select the handler.
    pub operation_name: String,
    /// Opaque caller payload.
    pub payload: serde_json::Value,
    /// Attempts made by the queue so far.
    pub attempts: u32,
    /// Attempts allowed before the entry is dropped.
    pub max_retries: u32,
    /// Earliest time of the next attempt, in milliseconds since the epoch.
    pub next_retry_at: u64,
    /// Insertion time, in milliseconds since the epoch.
    pub created_at: u64,
    /// Failure message of the most recent attempt.
    pub last_error: Option<String>,
}

impl QueuedTransaction {
    /// Whether the entry is due at `now_ms`.
    #[must_use]
    pub const fn is_due(&self, now_ms: u64) -> bool {
        self.next_retry_at <= now_ms
    }

    /// Whether the retry budget is used up.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_retries
    }
}

/// Queue configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Interval between background processing cycles.
    pub processing_interval: Duration,
    /// Delay between insertion and the first attempt.
    pub initial_delay: Duration,
    /// Backoff unit: failure `n` waits `base_backoff × 2^n`.
    pub base_backoff: Duration,
    /// Cap on the backoff.
    pub max_backoff: Duration,
    /// Retry budget when none is given at insertion.
    pub default_max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            processing_interval: Duration::from_millis(10_000),
            initial_delay: Duration::from_millis(5_000),
            base_backoff: Duration::from_millis(1_000),
            max_backoff: Duration::from_millis(300_000),
            default_max_retries: 5,
        }
    }
}

impl QueueConfig {
    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when an interval or the retry budget is zero,
    /// or `base_backoff` exceeds `max_backoff`.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.processing_interval.is_zero() {
            return Err(ConfigError::invalid("processing_interval must be greater than 0"));
        }
        if self.base_backoff.is_zero() {
            return Err(ConfigError::invalid("base_backoff must be greater than 0"));
        }
        if self.base_backoff > self.max_backoff {
            return Err(ConfigError::invalid("base_backoff must not exceed max_backoff"));
        }
        if self.default_max_retries == 0 {
            return Err(ConfigError::invalid("default_max_retries must be at least 1"));
        }
        Ok(())
    }

    /// Backoff after the failure that brought the entry to `attempts`:
    /// `min(base_backoff × 2^attempts, max_backoff)`.
    #[must_use]
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Snapshot returned by `queue_status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    /// Entries currently queued.
    pub total: usize,
    /// Entry counts per operation name.
    pub by_operation: BTreeMap<String, usize>,
    /// Entry with the smallest `created_at`.
    pub oldest: Option<QueuedTransaction>,
}

/// Summary of one processing cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessingReport {
    /// Entries attempted.
    pub attempted: usize,
    /// Entries that succeeded and were removed.
    pub succeeded: usize,
    /// Entries that failed and were rescheduled.
    pub rescheduled: usize,
    /// Entries dropped after exhausting their retries.
    pub failed_permanently: usize,
    /// Results discarded because the entry was replaced or removed meanwhile.
    pub discarded: usize,
}

/// Re-attempts the work behind one operation name.
#[async_trait]
pub trait TransactionHandler: Send + Sync {
    /// Attempt `transaction` once.
    async fn execute(&self, transaction: &QueuedTransaction) -> Result<(), BoxError>;
}

/// [`TransactionHandler`] backed by an async closure. See [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

/// Wrap an async closure as a [`TransactionHandler`].
///
/// The closure receives an owned copy of the transaction.
#[must_use]
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(QueuedTransaction) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> TransactionHandler for FnHandler<F>
where
    F: Fn(QueuedTransaction) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    async fn execute(&self, transaction: &QueuedTransaction) -> Result<(), BoxError> {
        (self.f)(transaction.clone()).await
    }
}
