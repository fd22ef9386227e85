//! Structured resilience events.
//!
//! Every component logs through `tracing` and additionally emits a
//! [`ResilienceEvent`] to an injected [`EventSink`]. The default sink drops
//! events; metrics exporters, audit trails or tests plug in their own.

use std::fmt::Debug;

use parking_lot::Mutex;
use serde::Serialize;

use crate::resilience::circuit_breaker::CircuitState;

/// Outcome of a single retry attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The attempt returned a value.
    Succeeded,
    /// The attempt failed and another one is scheduled.
    RetryScheduled,
    /// The attempt failed with an error the policy does not retry.
    NonRetryable,
    /// The attempt failed and no attempts remain.
    Exhausted,
    /// The circuit breaker refused the attempt.
    CircuitOpen,
}

/// Event emitted by the resilience layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ResilienceEvent {
    /// A circuit breaker changed state.
    CircuitTransition {
        /// Protected resource name.
        resource: String,
        /// Previous state.
        from: CircuitState,
        /// New state.
        to: CircuitState,
        /// Consecutive failures at the time of the transition.
        consecutive_failures: u32,
    },

    /// A retry executor finished one attempt.
    RetryAttempt {
        /// Operation name.
        operation: String,
        /// 1-based attempt number.
        attempt: u32,
        /// Configured maximum attempts.
        max_attempts: u32,
        /// What happened.
        outcome: AttemptOutcome,
        /// Delay before the next attempt, when one is scheduled.
        delay_ms: Option<u64>,
    },

    /// A transaction entered the deferred-retry queue.
    TransactionQueued {
        /// Transaction id.
        id: String,
        /// Operation name.
        operation: String,
        /// Retry budget.
        max_retries: u32,
        /// Whether an existing entry with the same id was replaced.
        replaced: bool,
    },

    /// A queued transaction succeeded and left the queue.
    TransactionSucceeded {
        /// Transaction id.
        id: String,
        /// Operation name.
        operation: String,
        /// Attempts used, including the successful one.
        attempts: u32,
    },

    /// A queued transaction failed and was rescheduled.
    TransactionRescheduled {
        /// Transaction id.
        id: String,
        /// Operation name.
        operation: String,
        /// Attempts used so far.
        attempts: u32,
        /// Backoff applied before the next attempt.
        delay_ms: u64,
        /// Failure message of this attempt.
        error: String,
    },

    /// A queued transaction exhausted its retries and was dropped.
    TransactionFailedPermanently {
        /// Transaction id.
        id: String,
        /// Operation name.
        operation: String,
        /// Attempts used.
        attempts: u32,
        /// Final failure message.
        error: String,
    },

    /// A queued transaction was removed by a caller.
    TransactionRemoved {
        /// Transaction id.
        id: String,
        /// Operation name.
        operation: String,
    },

    /// A compensating action completed.
    RollbackActionSucceeded {
        /// Operation being rolled back.
        operation: String,
        /// Registration index of the action.
        index: usize,
        /// Action label.
        label: String,
    },

    /// A compensating action failed.
    RollbackActionFailed {
        /// Operation being rolled back.
        operation: String,
        /// Registration index of the action.
        index: usize,
        /// Action label.
        label: String,
        /// Failure message.
        error: String,
    },
}

impl ResilienceEvent {
    /// Short identifier of the event type.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CircuitTransition { .. } => "circuit_transition",
            Self::RetryAttempt { .. } => "retry_attempt",
            Self::TransactionQueued { .. } => "transaction_queued",
            Self::TransactionSucceeded { .. } => "transaction_succeeded",
            Self::TransactionRescheduled { .. } => "transaction_rescheduled",
            Self::TransactionFailedPermanently { .. } => "transaction_failed_permanently",
            Self::TransactionRemoved { .. } => "transaction_removed",
            Self::RollbackActionSucceeded { .. } => "rollback_action_succeeded",
            Self::RollbackActionFailed { .. } => "rollback_action_failed",
        }
    }
}

/// Consumer of resilience events.
///
/// Called synchronously from the emitting component, never while it holds
/// an internal lock.
pub trait EventSink: Send + Sync + Debug {
    /// Receive one event.
    fn emit(&self, event: &ResilienceEvent);
}

/// Sink that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn emit(&self, _event: &ResilienceEvent) {}
}

/// Sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<ResilienceEvent>>,
}

impl MemoryEventSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<ResilienceEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events matching `predicate`.
    #[must_use]
    pub fn count_where(&self, predicate: impl Fn(&ResilienceEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|event| predicate(event)).count()
    }

    /// Number of recorded events with the given [`ResilienceEvent::name`].
    #[must_use]
    pub fn count_named(&self, name: &str) -> usize {
        self.count_where(|event| event.name() == name)
    }

    /// Drop everything recorded so far.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: &ResilienceEvent) {
        self.events.lock().push(event.clone());
    }
}
