//! Retry with exponential backoff and jitter.
//!
//! [`RetryPolicy`] is immutable data: attempt limit, delay bounds,
//! multiplier and the matchers that decide retryability. A
//! [`RetryExecutor`] drives one operation through the policy, optionally
//! passing every attempt through a shared [`CircuitBreaker`].
//!
//! ```no_run
//! use swapdesk_resilience::{execute_with_retry, OperationError, RetryPolicy};
//!
//! # async fn submit() -> Result<String, OperationError> { Ok("0xabc".into()) }
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::builder().max_attempts(5).build()?;
//! let hash = execute_with_retry("submit_swap", &policy, || submit()).await?;
//! # let _ = hash;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::error::{ConfigError, ConfigResult, ErrorClassification, ErrorKind};
use crate::events::{AttemptOutcome, EventSink, NoOpEventSink, ResilienceEvent};
use crate::resilience::circuit_breaker::{BreakerError, CircuitBreaker, CircuitOpenError};
use crate::time::{Clock, SystemClock};

/// Upper bound of the random jitter, as a fraction of the computed delay.
pub const JITTER_RATIO: f64 = 0.1;

/// Predicate deciding whether a failure is retryable.
#[derive(Clone)]
pub enum ErrorMatcher {
    /// Matches errors of one kind.
    Kind(ErrorKind),
    /// Matches errors whose [`ErrorClassification::code`] equals the value.
    Code(String),
    /// Arbitrary predicate.
    Custom(Arc<dyn Fn(&dyn ErrorClassification) -> bool + Send + Sync>),
}

impl ErrorMatcher {
    /// Build a [`ErrorMatcher::Custom`] from a closure.
    #[must_use]
    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&dyn ErrorClassification) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(predicate))
    }

    /// Whether `error` satisfies this matcher.
    #[must_use]
    pub fn matches(&self, error: &dyn ErrorClassification) -> bool {
        match self {
            Self::Kind(kind) => error.kind() == *kind,
            Self::Code(code) => error.code() == Some(code.as_str()),
            Self::Custom(predicate) => predicate(error),
        }
    }
}

impl fmt::Debug for ErrorMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kind(kind) => f.debug_tuple("Kind").field(kind).finish(),
            Self::Code(code) => f.debug_tuple("Code").field(code).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Immutable retry configuration for one operation category.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
    jitter: bool,
    matchers: Vec<ErrorMatcher>,
}

impl Default for RetryPolicy {
    /// 3 attempts, 1 s base delay, 30 s cap, doubling, jitter on, transient
    /// kinds retryable.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
            jitter: true,
            matchers: ErrorKind::TRANSIENT.iter().copied().map(ErrorMatcher::Kind).collect(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy builder seeded with the defaults.
    #[must_use]
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::default()
    }

    /// Maximum number of attempts, including the first.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after the first failure.
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Cap on the computed delay, before jitter.
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Growth factor between consecutive delays.
    #[must_use]
    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    /// Whether random jitter is added to each delay.
    #[must_use]
    pub const fn jitter(&self) -> bool {
        self.jitter
    }

    /// Configured retryability matchers.
    #[must_use]
    pub fn matchers(&self) -> &[ErrorMatcher] {
        &self.matchers
    }

    /// Whether any matcher accepts `error`.
    #[must_use]
    pub fn is_retryable(&self, error: &dyn ErrorClassification) -> bool {
        self.matchers.iter().any(|matcher| matcher.matches(error))
    }

    /// Delay after failed attempt `attempt` (1-based), without jitter:
    /// `min(base × multiplier^(attempt-1), max)`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_ms = self.base_delay.as_secs_f64() * 1_000.0;
        let max_ms = self.max_delay.as_secs_f64() * 1_000.0;

        let delay_ms = (base_ms * self.backoff_multiplier.powi(exponent)).min(max_ms);
        Duration::from_millis(delay_ms as u64)
    }

    /// Delay after failed attempt `attempt`, including up to 10% jitter.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for_attempt(attempt);
        if !self.jitter {
            return delay;
        }

        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let jitter_range = (delay_ms as f64 * JITTER_RATIO) as u64;
        let jitter = if jitter_range > 0 { rand::thread_rng().gen_range(0..=jitter_range) } else { 0 };

        Duration::from_millis(delay_ms.saturating_add(jitter))
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts must be at least 1"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier <= 1.0 {
            return Err(ConfigError::invalid("backoff_multiplier must be greater than 1"));
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigError::invalid("base_delay must not exceed max_delay"));
        }
        Ok(())
    }
}

/// Builder for [`RetryPolicy`]
#[derive(Debug, Default)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Maximum number of attempts, including the first.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = attempts;
        self
    }

    /// Delay after the first failure.
    #[must_use]
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.policy.base_delay = delay;
        self
    }

    /// Cap on the computed delay.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Growth factor between consecutive delays.
    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.policy.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.policy.jitter = enabled;
        self
    }

    /// Add a retryability matcher.
    #[must_use]
    pub fn retry_on(mut self, matcher: ErrorMatcher) -> Self {
        self.policy.matchers.push(matcher);
        self
    }

    /// Replace all matchers with `matchers`.
    #[must_use]
    pub fn matchers(mut self, matchers: impl IntoIterator<Item = ErrorMatcher>) -> Self {
        self.policy.matchers = matchers.into_iter().collect();
        self
    }

    /// Validate and return the policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when `max_attempts` is zero, the multiplier is
    /// not greater than 1, or `base_delay` exceeds `max_delay`.
    pub fn build(self) -> ConfigResult<RetryPolicy> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

/// Errors surfaced by [`RetryExecutor`]
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The policy classified the failure as terminal.
    #[error("operation '{operation}' failed with a non-retryable error on attempt {attempt}: {source}")]
    NonRetryable {
        /// Operation name.
        operation: String,
        /// Attempt that failed.
        attempt: u32,
        /// Underlying error.
        source: E,
    },

    /// Every attempt failed with a retryable error.
    #[error("operation '{operation}' failed after {attempts} attempts: {source}")]
    Exhausted {
        /// Operation name.
        operation: String,
        /// Attempts made.
        attempts: u32,
        /// Error of the final attempt.
        source: E,
    },

    /// The circuit breaker refused an attempt.
    #[error("operation '{operation}' rejected on attempt {attempt}: {source}")]
    CircuitOpen {
        /// Operation name.
        operation: String,
        /// Attempt that was refused.
        attempt: u32,
        /// Breaker rejection.
        source: CircuitOpenError,
    },
}

impl<E> RetryError<E> {
    /// Name of the operation that failed.
    #[must_use]
    pub fn operation(&self) -> &str {
        match self {
            Self::NonRetryable { operation, .. }
            | Self::Exhausted { operation, .. }
            | Self::CircuitOpen { operation, .. } => operation,
        }
    }

    /// Attempts consumed, counting the refused one for `CircuitOpen`.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::NonRetryable { attempt, .. } | Self::CircuitOpen { attempt, .. } => *attempt,
            Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    /// Whether the failure is transient and may be handed to the deferred
    /// transaction queue.
    #[must_use]
    pub const fn should_defer(&self) -> bool {
        matches!(self, Self::Exhausted { .. } | Self::CircuitOpen { .. })
    }

    /// Whether the breaker refused the call.
    #[must_use]
    pub const fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// The operation's own error, unless the breaker refused the call.
    #[must_use]
    pub fn into_source(self) -> Option<E> {
        match self {
            Self::NonRetryable { source, .. } | Self::Exhausted { source, .. } => Some(source),
            Self::CircuitOpen { .. } => None,
        }
    }
}

impl<E: ErrorClassification> ErrorClassification for RetryError<E> {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NonRetryable { source, .. } | Self::Exhausted { source, .. } => source.kind(),
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
        }
    }

    fn code(&self) -> Option<&str> {
        match self {
            Self::NonRetryable { source, .. } | Self::Exhausted { source, .. } => source.code(),
            Self::CircuitOpen { source, .. } => source.code(),
        }
    }

    fn is_retryable(&self) -> bool {
        self.should_defer()
    }
}

/// Result of a retried operation with attempt statistics
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// Final result.
    pub result: Result<T, RetryError<E>>,
    /// Attempts made.
    pub attempts: u32,
    /// Every backoff delay slept, in order.
    pub delays: Vec<Duration>,
}

impl<T, E> RetryOutcome<T, E> {
    /// Sum of all backoff delays.
    #[must_use]
    pub fn total_delay(&self) -> Duration {
        self.delays.iter().sum()
    }

    /// Discard the statistics.
    pub fn into_result(self) -> Result<T, RetryError<E>> {
        self.result
    }
}

enum AttemptFailure<E> {
    Rejected(CircuitOpenError),
    Failed(E),
}

/// Drives an operation through a [`RetryPolicy`].
pub struct RetryExecutor<C: Clock = SystemClock> {
    policy: RetryPolicy,
    breaker: Option<Arc<CircuitBreaker<C>>>,
    sink: Arc<dyn EventSink>,
}

impl<C: Clock> fmt::Debug for RetryExecutor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .field("breaker", &self.breaker.as_ref().map(|b| b.name().to_string()))
            .finish_non_exhaustive()
    }
}

impl RetryExecutor<SystemClock> {
    /// Create an executor without a circuit breaker.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, breaker: None, sink: Arc::new(NoOpEventSink) }
    }
}

impl Default for RetryExecutor<SystemClock> {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl<C: Clock> RetryExecutor<C> {
    /// Pass every attempt through `breaker`.
    #[must_use]
    pub fn with_circuit_breaker<B: Clock>(self, breaker: Arc<CircuitBreaker<B>>) -> RetryExecutor<B> {
        RetryExecutor { policy: self.policy, breaker: Some(breaker), sink: self.sink }
    }

    /// Route attempt events to `sink`.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Policy in use.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `operation` with retries, returning only the result.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError`] when the operation fails terminally, exhausts
    /// its attempts, or the breaker refuses an attempt.
    pub async fn execute<F, Fut, T, E>(
        &self,
        operation_name: &str,
        operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: ErrorClassification + fmt::Display + Send,
    {
        self.execute_with_outcome(operation_name, operation).await.result
    }

    /// Execute `operation` with retries and report attempt statistics.
    #[instrument(
        skip(self, operation),
        fields(max_attempts = self.policy.max_attempts)
    )]
    pub async fn execute_with_outcome<F, Fut, T, E>(
        &self,
        operation_name: &str,
        mut operation: F,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: ErrorClassification + fmt::Display + Send,
    {
        let max_attempts = self.policy.max_attempts;
        let mut delays = Vec::new();
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(attempt, max_attempts, "Executing operation");

            let error = match self.run_attempt(&mut operation).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(attempt, "Operation succeeded after retries");
                    }
                    self.emit(operation_name, attempt, AttemptOutcome::Succeeded, None);
                    return RetryOutcome { result: Ok(value), attempts: attempt, delays };
                }
                Err(AttemptFailure::Rejected(open)) => {
                    warn!(attempt, retry_in = ?open.retry_in, "Circuit open, not retrying");
                    self.emit(operation_name, attempt, AttemptOutcome::CircuitOpen, None);
                    return RetryOutcome {
                        result: Err(RetryError::CircuitOpen {
                            operation: operation_name.to_string(),
                            attempt,
                            source: open,
                        }),
                        attempts: attempt,
                        delays,
                    };
                }
                Err(AttemptFailure::Failed(error)) => error,
            };

            if !self.policy.is_retryable(&error) {
                debug!(attempt, kind = %error.kind(), error = %error, "Non-retryable failure");
                self.emit(operation_name, attempt, AttemptOutcome::NonRetryable, None);
                return RetryOutcome {
                    result: Err(RetryError::NonRetryable {
                        operation: operation_name.to_string(),
                        attempt,
                        source: error,
                    }),
                    attempts: attempt,
                    delays,
                };
            }

            if attempt >= max_attempts {
                warn!(attempts = attempt, error = %error, "All retry attempts exhausted");
                self.emit(operation_name, attempt, AttemptOutcome::Exhausted, None);
                return RetryOutcome {
                    result: Err(RetryError::Exhausted {
                        operation: operation_name.to_string(),
                        attempts: attempt,
                        source: error,
                    }),
                    attempts: attempt,
                    delays,
                };
            }

            let delay = self.policy.delay_for_attempt(attempt);
            warn!(attempt, ?delay, error = %error, "Operation failed, retrying");
            self.emit(operation_name, attempt, AttemptOutcome::RetryScheduled, Some(delay));

            tokio::time::sleep(delay).await;
            delays.push(delay);
        }
    }

    async fn run_attempt<F, Fut, T, E>(&self, operation: &mut F) -> Result<T, AttemptFailure<E>>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: Send,
    {
        match &self.breaker {
            Some(breaker) => breaker.execute(|| operation()).await.map_err(|err| match err {
                BreakerError::CircuitOpen(open) => AttemptFailure::Rejected(open),
                BreakerError::Operation { source } => AttemptFailure::Failed(source),
            }),
            None => operation().await.map_err(AttemptFailure::Failed),
        }
    }

    fn emit(&self, operation: &str, attempt: u32, outcome: AttemptOutcome, delay: Option<Duration>) {
        self.sink.emit(&ResilienceEvent::RetryAttempt {
            operation: operation.to_string(),
            attempt,
            max_attempts: self.policy.max_attempts,
            outcome,
            delay_ms: delay.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        });
    }
}

/// Execute `operation` under `policy` without a circuit breaker.
///
/// # Errors
///
/// See [`RetryExecutor::execute`].
pub async fn execute_with_retry<F, Fut, T, E>(
    operation_name: &str,
    policy: &RetryPolicy,
    operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<T, E>> + Send,
    T: Send,
    E: ErrorClassification + fmt::Display + Send,
{
    RetryExecutor::new(policy.clone()).execute(operation_name, operation).await
}

/// Execute `operation` under [`RetryPolicy::default`].
///
/// # Errors
///
/// See [`RetryExecutor::execute`].
pub async fn retry<F, Fut, T, E>(operation_name: &str, operation: F) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<T, E>> + Send,
    T: Send,
    E: ErrorClassification + fmt::Display + Send,
{
    RetryExecutor::default().execute(operation_name, operation).await
}
