//! Compensating actions for multi-step operations
//!
//! A [`RollbackManager`] is created for one logical operation. Each completed
//! forward step registers the action that undoes it; if a later step fails
//! the caller runs [`RollbackManager::execute_rollback`], which invokes the
//! actions last-registered-first.
//!
//! Every action is attempted even when an earlier one fails or panics. Any
//! failure produces a [`RollbackPartialFailureError`], which is never
//! retryable and must reach the top-level caller.
//!
//! ```
//! use swapdesk_resilience::rollback::RollbackManager;
//! use swapdesk_resilience::BoxError;
//!
//! # tokio_test::block_on(async {
//! let mut rollback = RollbackManager::new("create_swap");
//! rollback.add_rollback_action("release_escrow", || async { Ok::<(), BoxError>(()) });
//! rollback.add_rollback_action("cancel_booking", || async { Ok::<(), BoxError>(()) });
//!
//! let report = rollback.execute_rollback().await.unwrap();
//! assert_eq!(report.executed, vec!["cancel_booking", "release_escrow"]);
//! # });
//! ```

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{BoxError, ErrorClassification, ErrorKind, ErrorSeverity};
use crate::events::{EventSink, NoOpEventSink, ResilienceEvent};

type RollbackFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), BoxError>> + Send>;

struct RollbackAction {
    label: String,
    run: RollbackFn,
}

/// One compensating action that did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackFailure {
    /// Registration index (0 is the first action registered).
    pub index: usize,
    /// Action label.
    pub label: String,
    /// Error or panic message.
    pub message: String,
}

impl fmt::Display for RollbackFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}: {}", self.index, self.label, self.message)
    }
}

/// Raised when at least one compensating action failed.
///
/// The partial side effects of the operation may still be in place; this
/// requires manual intervention.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "rollback of '{operation}' failed for {} of {attempted} actions: {}",
    .failures.len(),
    format_failures(.failures)
)]
pub struct RollbackPartialFailureError {
    /// Operation being rolled back.
    pub operation: String,
    /// Actions attempted.
    pub attempted: usize,
    /// Failed actions, in execution order.
    pub failures: Vec<RollbackFailure>,
}

fn format_failures(failures: &[RollbackFailure]) -> String {
    failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

impl ErrorClassification for RollbackPartialFailureError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Internal
    }

    fn code(&self) -> Option<&str> {
        Some("ROLLBACK_PARTIAL_FAILURE")
    }

    fn is_retryable(&self) -> bool {
        false
    }

    fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::Critical
    }
}

/// Outcome of a rollback in which every action succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackReport {
    /// Operation rolled back.
    pub operation: String,
    /// Labels of the executed actions, in execution order.
    pub executed: Vec<String>,
}

/// Ordered compensating actions for one operation.
pub struct RollbackManager {
    operation: String,
    actions: Vec<RollbackAction>,
    sink: Arc<dyn EventSink>,
}

impl fmt::Debug for RollbackManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RollbackManager")
            .field("operation", &self.operation)
            .field("actions", &self.actions.iter().map(|a| a.label.as_str()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl RollbackManager {
    /// Create an empty manager for `operation`.
    #[must_use]
    pub fn new(operation: impl Into<String>) -> Self {
        Self { operation: operation.into(), actions: Vec::new(), sink: Arc::new(NoOpEventSink) }
    }

    /// Route rollback events to `sink`.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Name of the operation being compensated.
    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Register the action that undoes the step just completed.
    pub fn add_rollback_action<F, Fut, E>(&mut self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let label = label.into();
        debug!(operation = %self.operation, action = %label, "Rollback action registered");
        self.actions.push(RollbackAction {
            label,
            run: Box::new(move || async move { action().await.map_err(Into::into) }.boxed()),
        });
    }

    /// Number of registered actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether no action is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Discard all registered actions, typically once the operation committed.
    pub fn clear(&mut self) {
        self.actions.clear();
    }

    /// Run every action in reverse registration order.
    ///
    /// Failures and panics are collected per action; the remaining actions
    /// still run. Consumes the manager.
    ///
    /// # Errors
    ///
    /// Returns [`RollbackPartialFailureError`] when at least one action
    /// failed or panicked.
    #[instrument(skip(self), fields(operation = %self.operation, actions = self.actions.len()))]
    pub async fn execute_rollback(mut self) -> Result<RollbackReport, RollbackPartialFailureError> {
        let actions = std::mem::take(&mut self.actions);
        let attempted = actions.len();
        let operation = self.operation.clone();

        info!(actions = attempted, "Executing rollback");

        let mut executed = Vec::with_capacity(attempted);
        let mut failures = Vec::new();

        for (index, action) in actions.into_iter().enumerate().rev() {
            let RollbackAction { label, run } = action;
            let result = match AssertUnwindSafe(run()).catch_unwind().await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(err.to_string()),
                Err(panic) => Err(format!("rollback action panicked: {}", panic_message(&*panic))),
            };

            match result {
                Ok(()) => {
                    debug!(index, action = %label, "Rollback action succeeded");
                    self.sink.emit(&ResilienceEvent::RollbackActionSucceeded {
                        operation: operation.clone(),
                        index,
                        label: label.clone(),
                    });
                    executed.push(label);
                }
                Err(message) => {
                    warn!(index, action = %label, error = %message, "Rollback action failed");
                    self.sink.emit(&ResilienceEvent::RollbackActionFailed {
                        operation: operation.clone(),
                        index,
                        label: label.clone(),
                        error: message.clone(),
                    });
                    failures.push(RollbackFailure { index, label, message });
                }
            }
        }

        if failures.is_empty() {
            info!(actions = attempted, "Rollback completed");
            return Ok(RollbackReport { operation, executed });
        }

        let err = RollbackPartialFailureError { operation, attempted, failures };
        error!(
            failed = err.failures.len(),
            attempted,
            severity = %err.severity(),
            manual_intervention = true,
            error = %err,
            "Rollback incomplete"
        );
        Err(err)
    }
}

impl Drop for RollbackManager {
    fn drop(&mut self) {
        if !self.actions.is_empty() {
            warn!(
                operation = %self.operation,
                actions = self.actions.len(),
                "Rollback manager dropped with unexecuted actions"
            );
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
