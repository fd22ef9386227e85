//! Three-state circuit breaker protecting one downstream resource.
//!
//! A breaker trips `Closed -> Open` after `failure_threshold` consecutive
//! failures, rejects calls until `open_timeout` has passed since the last
//! failure, then admits trial calls in `HalfOpen`. A successful trial
//! closes it again; a failed trial re-opens it.
//!
//! All state lives behind a single mutex so every check-and-update is
//! atomic. Share a breaker between consumers as `Arc<CircuitBreaker>`.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::error::{ConfigError, ConfigResult, ErrorClassification, ErrorKind};
use crate::events::{EventSink, NoOpEventSink, ResilienceEvent};
use crate::time::{Clock, SystemClock};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed,
    /// Circuit is open, rejecting requests
    Open,
    /// Circuit is half-open, admitting trial requests
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Fast-fail rejection returned while the circuit is open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit breaker '{resource}' is open after {consecutive_failures} consecutive failures; retry in {retry_in:?}")]
pub struct CircuitOpenError {
    /// Name of the protected resource.
    pub resource: String,
    /// Failure count that keeps the circuit open.
    pub consecutive_failures: u32,
    /// Time left until the breaker admits a trial call.
    pub retry_in: Duration,
}

impl ErrorClassification for CircuitOpenError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::CircuitOpen
    }

    fn code(&self) -> Option<&str> {
        Some("CIRCUIT_OPEN")
    }
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The call was rejected without invoking the operation.
    #[error(transparent)]
    CircuitOpen(CircuitOpenError),

    /// The operation ran and failed.
    #[error("operation failed: {source}")]
    Operation {
        /// The operation's own error.
        source: E,
    },
}

impl<E> BreakerError<E> {
    /// Whether this is a fast-fail rejection.
    #[must_use]
    pub const fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen(_))
    }

    /// The operation error, if the operation ran.
    #[must_use]
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::Operation { source } => Some(source),
            Self::CircuitOpen(_) => None,
        }
    }
}

impl<E: ErrorClassification> ErrorClassification for BreakerError<E> {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::CircuitOpen(_) => ErrorKind::CircuitOpen,
            Self::Operation { source } => source.kind(),
        }
    }

    fn code(&self) -> Option<&str> {
        match self {
            Self::CircuitOpen(open) => open.code(),
            Self::Operation { source } => source.code(),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Time after the last failure before a trial call is admitted
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, open_timeout: Duration::from_millis(60_000) }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder
    #[must_use]
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::default()
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a zero threshold or timeout.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold must be greater than 0"));
        }

        if self.open_timeout.is_zero() {
            return Err(ConfigError::invalid("open_timeout must be greater than 0"));
        }

        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`]
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    /// Consecutive failures before the circuit opens.
    #[must_use]
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// Cooldown before a trial call is admitted.
    #[must_use]
    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.config.open_timeout = timeout;
        self
    }

    /// Validate and return the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when validation fails.
    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Point-in-time view of a breaker for monitoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures counted so far.
    pub consecutive_failures: u32,
    /// Configured threshold.
    pub failure_threshold: u32,
    /// Configured cooldown.
    pub open_timeout: Duration,
    /// Calls admitted to the operation.
    pub total_calls: u64,
    /// Calls rejected while open.
    pub rejected_calls: u64,
    /// Time since the most recent failure.
    pub since_last_failure: Option<Duration>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_time: Option<Instant>,
    total_calls: u64,
    rejected_calls: u64,
}

impl BreakerState {
    const fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_time: None,
            total_calls: 0,
            rejected_calls: 0,
        }
    }
}

/// A state change observed under the lock and reported after releasing it.
struct Transition {
    from: CircuitState,
    to: CircuitState,
    consecutive_failures: u32,
}

/// Circuit breaker for one protected resource.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    clock: C,
    sink: Arc<dyn EventSink>,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &state.state)
            .field("consecutive_failures", &state.consecutive_failures)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a breaker for `name` using the system clock
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when `config` fails validation.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a breaker with a custom clock (useful for testing)
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when `config` fails validation.
    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: C,
    ) -> ConfigResult<Self> {
        config.validate()?;

        Ok(Self {
            name: Arc::from(name.into()),
            config,
            state: Mutex::new(BreakerState::new()),
            clock,
            sink: Arc::new(NoOpEventSink),
        })
    }

    /// Route transition events to `sink`.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Name of the protected resource.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Execute an operation with circuit breaker protection
    ///
    /// Rejects with [`BreakerError::CircuitOpen`] without invoking the
    /// operation while the circuit is open and the cooldown has not passed.
    ///
    /// # Errors
    ///
    /// Returns [`BreakerError::CircuitOpen`] for a rejected call and
    /// [`BreakerError::Operation`] when the operation itself fails.
    #[instrument(skip(self, operation), fields(resource = %self.name))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: Send,
    {
        self.try_acquire().map_err(BreakerError::CircuitOpen)?;

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(source) => {
                self.record_failure();
                Err(BreakerError::Operation { source })
            }
        }
    }

    /// Admit or reject one call, moving `Open -> HalfOpen` once the cooldown
    /// has passed.
    fn try_acquire(&self) -> Result<(), CircuitOpenError> {
        let now = self.clock.now();
        let mut transition = None;

        let admitted = {
            let mut state = self.state.lock();
            match state.state {
                CircuitState::Closed | CircuitState::HalfOpen => {
                    state.total_calls += 1;
                    Ok(())
                }
                CircuitState::Open => {
                    let elapsed = state
                        .last_failure_time
                        .map_or(self.config.open_timeout, |at| now.saturating_duration_since(at));

                    if elapsed >= self.config.open_timeout {
                        state.state = CircuitState::HalfOpen;
                        state.total_calls += 1;
                        transition = Some(Transition {
                            from: CircuitState::Open,
                            to: CircuitState::HalfOpen,
                            consecutive_failures: state.consecutive_failures,
                        });
                        Ok(())
                    } else {
                        state.rejected_calls += 1;
                        Err(CircuitOpenError {
                            resource: self.name.to_string(),
                            consecutive_failures: state.consecutive_failures,
                            retry_in: self.config.open_timeout - elapsed,
                        })
                    }
                }
            }
        };

        if let Some(transition) = transition {
            self.report(&transition);
        }
        if let Err(rejection) = &admitted {
            debug!(retry_in = ?rejection.retry_in, "Circuit breaker rejecting call");
        }
        admitted
    }

    /// Record a successful operation
    ///
    /// A success that resolves after the circuit has already opened is
    /// ignored; the open state must keep its failure count.
    pub fn record_success(&self) {
        let transition = {
            let mut state = self.state.lock();
            match state.state {
                CircuitState::Closed => {
                    state.consecutive_failures = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    state.state = CircuitState::Closed;
                    state.consecutive_failures = 0;
                    Some(Transition {
                        from: CircuitState::HalfOpen,
                        to: CircuitState::Closed,
                        consecutive_failures: 0,
                    })
                }
                CircuitState::Open => None,
            }
        };

        if let Some(transition) = transition {
            self.report(&transition);
        }
    }

    /// Record a failed operation
    pub fn record_failure(&self) {
        let now = self.clock.now();

        let transition = {
            let mut state = self.state.lock();
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.last_failure_time = Some(now);

            if state.state != CircuitState::Open
                && state.consecutive_failures >= self.config.failure_threshold
            {
                let from = state.state;
                state.state = CircuitState::Open;
                Some(Transition {
                    from,
                    to: CircuitState::Open,
                    consecutive_failures: state.consecutive_failures,
                })
            } else {
                None
            }
        };

        if let Some(transition) = transition {
            self.report(&transition);
        }
    }

    /// Current state. Does not trigger the `Open -> HalfOpen` transition.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Consecutive failures counted so far.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    /// Monitoring snapshot.
    #[must_use]
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let now = self.clock.now();
        let state = self.state.lock();
        CircuitBreakerSnapshot {
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            open_timeout: self.config.open_timeout,
            total_calls: state.total_calls,
            rejected_calls: state.rejected_calls,
            since_last_failure: state.last_failure_time.map(|at| now.saturating_duration_since(at)),
        }
    }

    /// Force the breaker back to `Closed` and clear the failure count.
    pub fn reset(&self) {
        let transition = {
            let mut state = self.state.lock();
            let from = state.state;
            state.state = CircuitState::Closed;
            state.consecutive_failures = 0;
            state.last_failure_time = None;
            (from != CircuitState::Closed).then_some(Transition {
                from,
                to: CircuitState::Closed,
                consecutive_failures: 0,
            })
        };

        if let Some(transition) = transition {
            self.report(&transition);
        }
    }

    fn report(&self, transition: &Transition) {
        match transition.to {
            CircuitState::Open => warn!(
                resource = %self.name,
                from = %transition.from,
                consecutive_failures = transition.consecutive_failures,
                "Circuit breaker opened"
            ),
            CircuitState::HalfOpen => {
                info!(resource = %self.name, "Circuit breaker half-open, admitting trial call");
            }
            CircuitState::Closed => {
                info!(resource = %self.name, from = %transition.from, "Circuit breaker closed");
            }
        }

        self.sink.emit(&ResilienceEvent::CircuitTransition {
            resource: self.name.to_string(),
            from: transition.from,
            to: transition.to,
            consecutive_failures: transition.consecutive_failures,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::OperationError;
    use crate::events::MemoryEventSink;
    use crate::time::MockClock;

    fn breaker(threshold: u32, timeout_ms: u64) -> (CircuitBreaker<MockClock>, MockClock) {
        let clock = MockClock::new();
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(threshold)
            .open_timeout(Duration::from_millis(timeout_ms))
            .build()
            .unwrap();
        let cb = CircuitBreaker::with_clock("chain-rpc", config, clock.clone()).unwrap();
        (cb, clock)
    }

    async fn fail(cb: &CircuitBreaker<MockClock>) -> Result<(), BreakerError<OperationError>> {
        cb.execute(|| async { Err(OperationError::network("connection reset")) }).await
    }

    /// Validates `CircuitBreakerConfig::validate` rejects degenerate values.
    ///
    /// Assertions:
    /// - A zero threshold is invalid.
    /// - A zero timeout is invalid.
    /// - Defaults are 5 failures and 60 s.
    #[test]
    fn test_config_validation() {
        assert!(CircuitBreakerConfig::builder().failure_threshold(0).build().is_err());
        assert!(CircuitBreakerConfig::builder().open_timeout(Duration::ZERO).build().is_err());

        let defaults = CircuitBreakerConfig::default();
        assert_eq!(defaults.failure_threshold, 5);
        assert_eq!(defaults.open_timeout, Duration::from_secs(60));
        assert!(defaults.validate().is_ok());
    }

    /// Validates the breaker opens after the threshold and fails fast.
    ///
    /// Assertions:
    /// - State is `Open` after 5 consecutive failures.
    /// - The 6th call returns `CircuitOpen` without invoking the operation.
    #[tokio::test]
    async fn test_opens_after_threshold_and_fails_fast() {
        let (cb, _clock) = breaker(5, 60_000);

        for _ in 0..5 {
            assert!(fail(&cb).await.is_err());
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result = cb
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, OperationError>(())
            })
            .await;

        assert!(matches!(result, Err(BreakerError::CircuitOpen(_))));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(cb.snapshot().rejected_calls, 1);
    }

    /// Validates recovery through a half-open trial call.
    ///
    /// Assertions:
    /// - After the timeout the operation is invoked.
    /// - A successful trial closes the circuit and clears the failure count.
    #[tokio::test]
    async fn test_half_open_trial_success_closes() {
        let (cb, clock) = breaker(5, 60_000);
        for _ in 0..5 {
            let _ = fail(&cb).await;
        }

        clock.advance(Duration::from_secs(60));

        let result = cb.execute(|| async { Ok::<_, OperationError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_half_open_trial_failure_reopens() {
        let (cb, clock) = breaker(2, 1_000);
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance_millis(1_000);
        let result = fail(&cb).await;
        assert!(matches!(result, Err(BreakerError::Operation { .. })));
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.consecutive_failures() >= 2);

        // The failed trial restarts the cooldown.
        clock.advance_millis(999);
        assert!(fail(&cb).await.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn test_rejection_reports_remaining_cooldown() {
        let (cb, clock) = breaker(1, 1_000);
        let _ = fail(&cb).await;

        clock.advance_millis(400);
        match fail(&cb).await {
            Err(BreakerError::CircuitOpen(open)) => {
                assert_eq!(open.resource, "chain-rpc");
                assert_eq!(open.retry_in, Duration::from_millis(600));
                assert_eq!(open.kind(), ErrorKind::CircuitOpen);
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }

    #[test]
    fn test_success_resets_failure_count_while_closed() {
        let (cb, _clock) = breaker(3, 1_000);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 2);
    }

    /// Validates a late success does not break the open-state invariant.
    ///
    /// Assertions:
    /// - State stays `Open`.
    /// - The failure count stays at or above the threshold.
    #[test]
    fn test_late_success_while_open_is_ignored() {
        let (cb, _clock) = breaker(2, 1_000);
        cb.record_failure();
        cb.record_failure();

        cb.record_success();

        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.consecutive_failures(), 2);
    }

    #[test]
    fn test_reopening_is_idempotent() {
        let sink = Arc::new(MemoryEventSink::new());
        let (cb, _clock) = breaker(2, 1_000);
        let cb = cb.with_event_sink(sink.clone());

        for _ in 0..4 {
            cb.record_failure();
        }

        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(sink.count_named("circuit_transition"), 1);
    }

    #[tokio::test]
    async fn test_transitions_are_emitted() {
        let sink = Arc::new(MemoryEventSink::new());
        let (cb, clock) = breaker(1, 1_000);
        let cb = cb.with_event_sink(sink.clone());

        let _ = fail(&cb).await;
        clock.advance_millis(1_000);
        cb.execute(|| async { Ok::<_, OperationError>(()) }).await.unwrap();

        let states: Vec<_> = sink
            .events()
            .into_iter()
            .filter_map(|event| match event {
                ResilienceEvent::CircuitTransition { from, to, .. } => Some((from, to)),
                _ => None,
            })
            .collect();

        assert_eq!(
            states,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[test]
    fn test_reset_closes_circuit() {
        let (cb, _clock) = breaker(1, 60_000);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert!(snapshot.since_last_failure.is_none());
    }

    /// Validates concurrent failures trip the breaker exactly once.
    ///
    /// Assertions:
    /// - One `Closed -> Open` transition is emitted for 32 concurrent failures.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_open_once() {
        let sink = Arc::new(MemoryEventSink::new());
        let (cb, _clock) = breaker(3, 60_000);
        let cb = Arc::new(cb.with_event_sink(sink.clone()));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let cb = Arc::clone(&cb);
                tokio::spawn(async move { cb.record_failure() })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(sink.count_named("circuit_transition"), 1);
    }
}
