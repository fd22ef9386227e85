//! Integration tests for compensating rollbacks
//!
//! Models a multi-step swap acceptance where a later step fails and the
//! completed steps are undone.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use parking_lot::Mutex;
use swapdesk_resilience::{
    BoxError, ErrorClassification, ErrorSeverity, MemoryEventSink, OperationError,
    ResilienceEvent, RollbackManager,
};

#[derive(Debug, Default)]
struct Ledger {
    steps: Mutex<Vec<String>>,
}

impl Ledger {
    fn record(&self, step: &str) {
        self.steps.lock().push(step.to_string());
    }

    fn steps(&self) -> Vec<String> {
        self.steps.lock().clone()
    }
}

async fn accept_swap(
    ledger: Arc<Ledger>,
    rollback: &mut RollbackManager,
    fail_refund: bool,
) -> Result<(), OperationError> {
    ledger.record("lock_booking");
    let undo = Arc::clone(&ledger);
    rollback.add_rollback_action("unlock_booking", move || async move {
        undo.record("unlock_booking");
        Ok::<(), BoxError>(())
    });

    ledger.record("charge_deposit");
    let undo = Arc::clone(&ledger);
    rollback.add_rollback_action("refund_deposit", move || async move {
        undo.record("refund_deposit");
        if fail_refund {
            return Err(OperationError::network("payment gateway unreachable"));
        }
        Ok(())
    });

    ledger.record("reserve_listing");
    let undo = Arc::clone(&ledger);
    rollback.add_rollback_action("release_listing", move || async move {
        undo.record("release_listing");
        Ok::<(), BoxError>(())
    });

    Err(OperationError::network("transfer transaction dropped"))
}

/// Validates a complete rollback after a failed final step.
///
/// # Test Steps
/// 1. Run three forward steps, each registering its undo action
/// 2. The final step fails
/// 3. Rollback undoes the steps last-first and reports success
#[tokio::test]
async fn test_failed_operation_rolls_back_in_reverse() -> anyhow::Result<()> {
    let ledger = Arc::new(Ledger::default());
    let mut rollback = RollbackManager::new("accept_swap");

    let result = accept_swap(Arc::clone(&ledger), &mut rollback, false).await;
    assert!(result.is_err());
    assert_eq!(rollback.len(), 3);

    let report = rollback.execute_rollback().await?;
    assert_eq!(report.executed, vec!["release_listing", "refund_deposit", "unlock_booking"]);
    assert_eq!(
        ledger.steps(),
        vec![
            "lock_booking",
            "charge_deposit",
            "reserve_listing",
            "release_listing",
            "refund_deposit",
            "unlock_booking",
        ]
    );
    Ok(())
}

/// Validates escalation when a compensating action fails.
///
/// # Test Steps
/// 1. The middle undo action fails
/// 2. The earlier-registered action still runs
/// 3. The error names the failed action and is critical
#[tokio::test]
async fn test_partial_rollback_failure_is_escalated() {
    let ledger = Arc::new(Ledger::default());
    let sink = Arc::new(MemoryEventSink::new());
    let mut rollback = RollbackManager::new("accept_swap").with_event_sink(sink.clone());

    let _ = accept_swap(Arc::clone(&ledger), &mut rollback, true).await;
    let err = rollback.execute_rollback().await.expect_err("refund should fail");

    assert!(ledger.steps().ends_with(&[
        "release_listing".to_string(),
        "refund_deposit".to_string(),
        "unlock_booking".to_string(),
    ]));
    assert_eq!(err.operation, "accept_swap");
    assert_eq!(err.attempted, 3);
    assert_eq!(err.failures.len(), 1);
    assert_eq!(err.failures[0].label, "refund_deposit");
    assert_eq!(err.severity(), ErrorSeverity::Critical);
    assert!(!err.is_retryable());

    assert_eq!(sink.count_named("rollback_action_succeeded"), 2);
    assert_eq!(sink.count_named("rollback_action_failed"), 1);
    assert!(sink.events().iter().any(|event| matches!(
        event,
        ResilienceEvent::RollbackActionFailed { label, error, .. }
            if label == "refund_deposit" && error.contains("gateway unreachable")
    )));
}
