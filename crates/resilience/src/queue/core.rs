use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use super::errors::{QueueError, QueueResult};
use super::metrics::{QueueMetrics, QueueMetricsSnapshot};
use super::types::{ProcessingReport, QueueConfig, QueueStatus, QueuedTransaction, TransactionHandler};
use crate::events::{EventSink, NoOpEventSink, ResilienceEvent};
use crate::time::{Clock, SystemClock};

/// In-memory deferred-retry queue
///
/// ## Ownership
///
/// The entry map is the sole owner of every [`QueuedTransaction`]. Callers
/// and the background processor see clones. One mutex guards the map and is
/// never held across an `.await`; handlers run with the lock released.
///
/// ## Replacement during an attempt
///
/// Every insertion gets a fresh sequence number. When an attempt finishes,
/// its result is applied only if the entry still carries the sequence it
/// had when the attempt started. An entry re-queued or removed in the
/// meantime is left alone.
///
/// ## In-flight marks
///
/// An entry selected by a cycle is marked in flight until its attempt
/// settles, and no other cycle picks it up meanwhile. The mark is released
/// when the attempt's future is dropped as well, so a cycle cancelled part
/// way (for example by a caller-side timeout) leaves its entries eligible
/// for the next cycle.
///
/// ## Durability
///
/// Entries live only in process memory and are lost on restart.
pub struct TransactionQueue<C: Clock = SystemClock> {
    state: Mutex<QueueState>,
    handlers: RwLock<HashMap<String, Arc<dyn TransactionHandler>>>,
    config: QueueConfig,
    clock: C,
    metrics: QueueMetrics,
    sink: Arc<dyn EventSink>,
}

#[derive(Default)]
struct QueueState {
    entries: HashMap<String, Entry>,
    in_flight: HashSet<String>,
    sequence_counter: u64,
}

struct Entry {
    transaction: QueuedTransaction,
    sequence: u64,
}

/// How one attempt ended, as applied to the map.
enum Resolution {
    Succeeded,
    Rescheduled { delay: Duration, error: String },
    FailedPermanently { error: String },
    Discarded,
}

impl<C: Clock> fmt::Debug for TransactionQueue<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionQueue")
            .field("config", &self.config)
            .field("len", &self.len())
            .field("handlers", &self.handlers.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl TransactionQueue<SystemClock> {
    /// Create a queue using the system clock
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Config`] when `config` is invalid.
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> TransactionQueue<C> {
    /// Create a queue with a custom clock (useful for testing)
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Config`] when `config` is invalid.
    pub fn with_clock(config: QueueConfig, clock: C) -> QueueResult<Self> {
        config.validate()?;

        Ok(Self {
            state: Mutex::new(QueueState::default()),
            handlers: RwLock::new(HashMap::new()),
            config,
            clock,
            metrics: QueueMetrics::new(),
            sink: Arc::new(NoOpEventSink),
        })
    }

    /// Route queue events to `sink`.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Counters for monitoring.
    #[must_use]
    pub fn metrics(&self) -> QueueMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Register the handler that re-attempts `operation_name`.
    ///
    /// Replaces any handler previously registered for the same name.
    pub fn register_handler<H>(&self, operation_name: impl Into<String>, handler: H)
    where
        H: TransactionHandler + 'static,
    {
        let operation_name = operation_name.into();
        debug!(operation = %operation_name, "Registering transaction handler");
        self.handlers.write().insert(operation_name, Arc::new(handler));
    }

    /// Queue a transaction with the configured default retry budget.
    ///
    /// # Errors
    ///
    /// See [`Self::queue_transaction_with_max_retries`].
    pub fn queue_transaction<P: Serialize>(
        &self,
        id: impl Into<String>,
        operation_name: impl Into<String>,
        payload: P,
    ) -> QueueResult<QueuedTransaction> {
        let max_retries = self.config.default_max_retries;
        self.queue_transaction_with_max_retries(id, operation_name, payload, max_retries)
    }

    /// Queue a transaction for deferred retry.
    ///
    /// The first attempt happens `initial_delay` from now. Queuing an id that
    /// is already present overwrites the entry and resets its attempts.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidMaxRetries`] when `max_retries` is zero
    /// and [`QueueError::Serialization`] when the payload cannot be
    /// converted to JSON.
    pub fn queue_transaction_with_max_retries<P: Serialize>(
        &self,
        id: impl Into<String>,
        operation_name: impl Into<String>,
        payload: P,
        max_retries: u32,
    ) -> QueueResult<QueuedTransaction> {
        let id = id.into();
        if max_retries == 0 {
            return Err(QueueError::InvalidMaxRetries { id });
        }

        let payload = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(source) => return Err(QueueError::Serialization { id, source }),
        };

        let now = self.clock.millis_since_epoch();
        let transaction = QueuedTransaction {
            id,
            operation_name: operation_name.into(),
            payload,
            attempts: 0,
            max_retries,
            next_retry_at: now.saturating_add(duration_millis(self.config.initial_delay)),
            created_at: now,
            last_error: None,
        };

        let replaced = {
            let mut state = self.state.lock();
            state.sequence_counter += 1;
            let entry = Entry { transaction: transaction.clone(), sequence: state.sequence_counter };
            state.entries.insert(transaction.id.clone(), entry).is_some()
        };

        self.metrics.record_enqueue();
        info!(
            id = %transaction.id,
            operation = %transaction.operation_name,
            max_retries,
            replaced,
            "Transaction queued for deferred retry"
        );
        self.sink.emit(&ResilienceEvent::TransactionQueued {
            id: transaction.id.clone(),
            operation: transaction.operation_name.clone(),
            max_retries,
            replaced,
        });

        Ok(transaction)
    }

    /// Delete an entry. Returns `None` if the id is not queued.
    pub fn remove_from_queue(&self, id: &str) -> Option<QueuedTransaction> {
        let removed = self.state.lock().entries.remove(id).map(|entry| entry.transaction);

        if let Some(transaction) = &removed {
            self.metrics.record_removal();
            info!(id, operation = %transaction.operation_name, "Transaction removed from queue");
            self.sink.emit(&ResilienceEvent::TransactionRemoved {
                id: transaction.id.clone(),
                operation: transaction.operation_name.clone(),
            });
        }

        removed
    }

    /// Copy of a queued entry.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<QueuedTransaction> {
        self.state.lock().entries.get(id).map(|entry| entry.transaction.clone())
    }

    /// Number of queued entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total count, counts per operation and the oldest-created entry.
    #[must_use]
    pub fn queue_status(&self) -> QueueStatus {
        let state = self.state.lock();

        let mut by_operation = BTreeMap::new();
        for entry in state.entries.values() {
            *by_operation.entry(entry.transaction.operation_name.clone()).or_insert(0) += 1;
        }

        let oldest = state
            .entries
            .values()
            .min_by_key(|entry| (entry.transaction.created_at, entry.sequence))
            .map(|entry| entry.transaction.clone());

        QueueStatus { total: state.entries.len(), by_operation, oldest }
    }

    /// Run one processing cycle.
    ///
    /// Attempts every due entry, oldest-due first, concurrently. A failing
    /// or panicking handler affects only its own entry.
    #[instrument(skip(self))]
    pub async fn process_due(&self) -> ProcessingReport {
        let now = self.clock.millis_since_epoch();
        let due = self.take_due(now);

        if due.is_empty() {
            self.metrics.record_cycle(0);
            return ProcessingReport::default();
        }

        debug!(count = due.len(), "Processing due transactions");

        let attempts = due.into_iter().map(|(transaction, sequence, mark)| async move {
            let result = self.attempt(&transaction).await;
            let resolution = self.resolve(&transaction, sequence, result);
            drop(mark);
            resolution
        });
        let resolutions = join_all(attempts).await;

        let mut report = ProcessingReport { attempted: resolutions.len(), ..ProcessingReport::default() };
        for resolution in &resolutions {
            match resolution {
                Resolution::Succeeded => report.succeeded += 1,
                Resolution::Rescheduled { .. } => report.rescheduled += 1,
                Resolution::FailedPermanently { .. } => report.failed_permanently += 1,
                Resolution::Discarded => report.discarded += 1,
            }
        }

        self.metrics.record_cycle(u64::try_from(report.attempted).unwrap_or(u64::MAX));
        report
    }

    /// Select due entries in processing order and mark them in flight.
    fn take_due(&self, now: u64) -> Vec<(QueuedTransaction, u64, InFlightMark<'_>)> {
        let mut state = self.state.lock();
        let QueueState { entries, in_flight, .. } = &mut *state;

        let mut due: Vec<(QueuedTransaction, u64)> = entries
            .values()
            .filter(|entry| entry.transaction.is_due(now) && !in_flight.contains(&entry.transaction.id))
            .map(|entry| (entry.transaction.clone(), entry.sequence))
            .collect();

        due.sort_by(|(a, a_seq), (b, b_seq)| {
            a.next_retry_at
                .cmp(&b.next_retry_at)
                .then(a.created_at.cmp(&b.created_at))
                .then(a_seq.cmp(b_seq))
        });

        due.into_iter()
            .map(|(transaction, sequence)| {
                in_flight.insert(transaction.id.clone());
                let mark = InFlightMark { state: &self.state, id: transaction.id.clone() };
                (transaction, sequence, mark)
            })
            .collect()
    }

    async fn attempt(&self, transaction: &QueuedTransaction) -> Result<(), String> {
        let handler = self.handlers.read().get(&transaction.operation_name).cloned();
        let Some(handler) = handler else {
            return Err(format!(
                "no handler registered for operation '{}'",
                transaction.operation_name
            ));
        };

        match AssertUnwindSafe(handler.execute(transaction)).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(panic) => Err(format!("handler panicked: {}", panic_message(panic.as_ref()))),
        }
    }

    /// Apply one attempt result under the lock, then report it.
    fn resolve(
        &self,
        snapshot: &QueuedTransaction,
        sequence: u64,
        result: Result<(), String>,
    ) -> Resolution {
        let now = self.clock.millis_since_epoch();

        let (resolution, attempts) = {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.get_mut(&snapshot.id).filter(|e| e.sequence == sequence)
            else {
                debug!(id = %snapshot.id, "Entry replaced or removed during attempt; result discarded");
                return Resolution::Discarded;
            };

            let transaction = &mut entry.transaction;
            transaction.attempts = transaction.attempts.saturating_add(1);
            let attempts = transaction.attempts;

            let resolution = match result {
                Ok(()) => Resolution::Succeeded,
                Err(error) if transaction.is_exhausted() => {
                    transaction.last_error = Some(error.clone());
                    Resolution::FailedPermanently { error }
                }
                Err(error) => {
                    let delay = self.config.retry_delay(attempts);
                    transaction.next_retry_at = now.saturating_add(duration_millis(delay));
                    transaction.last_error = Some(error.clone());
                    Resolution::Rescheduled { delay, error }
                }
            };

            if matches!(resolution, Resolution::Succeeded | Resolution::FailedPermanently { .. }) {
                state.entries.remove(&snapshot.id);
            }

            (resolution, attempts)
        };

        self.report(snapshot, attempts, &resolution);
        resolution
    }

    fn report(&self, snapshot: &QueuedTransaction, attempts: u32, resolution: &Resolution) {
        let id = snapshot.id.as_str();
        let operation = snapshot.operation_name.as_str();

        match resolution {
            Resolution::Succeeded => {
                self.metrics.record_success();
                info!(id, operation, attempts, "Queued transaction succeeded");
                self.sink.emit(&ResilienceEvent::TransactionSucceeded {
                    id: id.to_string(),
                    operation: operation.to_string(),
                    attempts,
                });
            }
            Resolution::Rescheduled { delay, error } => {
                self.metrics.record_reschedule();
                warn!(id, operation, attempts, ?delay, error = %error, "Queued transaction failed, rescheduled");
                self.sink.emit(&ResilienceEvent::TransactionRescheduled {
                    id: id.to_string(),
                    operation: operation.to_string(),
                    attempts,
                    delay_ms: duration_millis(*delay),
                    error: error.clone(),
                });
            }
            Resolution::FailedPermanently { error } => {
                self.metrics.record_permanent_failure();
                error!(
                    id,
                    operation,
                    attempts,
                    max_retries = snapshot.max_retries,
                    error = %error,
                    payload = %snapshot.payload,
                    "Queued transaction failed permanently and was dropped"
                );
                self.sink.emit(&ResilienceEvent::TransactionFailedPermanently {
                    id: id.to_string(),
                    operation: operation.to_string(),
                    attempts,
                    error: error.clone(),
                });
            }
            Resolution::Discarded => {}
        }
    }
}

/// Holds one id in the in-flight set until dropped.
struct InFlightMark<'a> {
    state: &'a Mutex<QueueState>,
    id: String,
}

impl Drop for InFlightMark<'_> {
    fn drop(&mut self) {
        self.state.lock().in_flight.remove(&self.id);
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use super::*;
    use crate::error::{BoxError, OperationError};
    use crate::events::MemoryEventSink;
    use crate::queue::types::handler_fn;
    use crate::time::MockClock;

    const START_MS: u64 = 1_700_000_000_000;

    fn queue() -> (TransactionQueue<MockClock>, MockClock, Arc<MemoryEventSink>) {
        let clock = MockClock::with_epoch_millis(START_MS);
        let sink = Arc::new(MemoryEventSink::new());
        let queue = TransactionQueue::with_clock(QueueConfig::default(), clock.clone())
            .unwrap()
            .with_event_sink(sink.clone());
        (queue, clock, sink)
    }

    fn always_failing() -> impl TransactionHandler {
        handler_fn(|_tx| async { Err::<(), BoxError>(Box::new(OperationError::network("rpc down"))) })
    }

    fn recording(order: Arc<Mutex<Vec<String>>>) -> impl TransactionHandler {
        handler_fn(move |tx| {
            let order = Arc::clone(&order);
            async move {
                order.lock().push(tx.id);
                Ok::<(), BoxError>(())
            }
        })
    }

    /// Validates insertion defaults.
    ///
    /// Assertions:
    /// - `attempts = 0` and the default budget of 5.
    /// - First attempt is due 5 s after insertion.
    #[test]
    fn test_queue_transaction_defaults() {
        let (queue, _clock, sink) = queue();

        let tx = queue.queue_transaction("tx1", "mint_nft", json!({"token": 1})).unwrap();

        assert_eq!(tx.attempts, 0);
        assert_eq!(tx.max_retries, 5);
        assert_eq!(tx.created_at, START_MS);
        assert_eq!(tx.next_retry_at, START_MS + 5_000);
        assert_eq!(queue.get("tx1"), Some(tx));
        assert_eq!(sink.count_named("transaction_queued"), 1);
    }

    #[test]
    fn test_requeue_same_id_overwrites() {
        let (queue, clock, _sink) = queue();
        queue.queue_transaction("tx1", "mint_nft", json!({"v": 1})).unwrap();
        clock.advance_millis(100);
        queue.queue_transaction("tx1", "mint_nft", json!({"v": 2})).unwrap();

        assert_eq!(queue.len(), 1);
        let tx = queue.get("tx1").unwrap();
        assert_eq!(tx.payload, json!({"v": 2}));
        assert_eq!(tx.created_at, START_MS + 100);
    }

    #[test]
    fn test_zero_max_retries_rejected() {
        let (queue, _clock, _sink) = queue();
        let result = queue.queue_transaction_with_max_retries("tx1", "mint_nft", json!(null), 0);
        assert!(matches!(result, Err(QueueError::InvalidMaxRetries { .. })));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remove_is_noop_when_absent() {
        let (queue, _clock, sink) = queue();
        assert!(queue.remove_from_queue("missing").is_none());

        queue.queue_transaction("tx1", "mint_nft", json!({})).unwrap();
        assert!(queue.remove_from_queue("tx1").is_some());
        assert!(queue.is_empty());
        assert_eq!(sink.count_named("transaction_removed"), 1);
        assert_eq!(queue.metrics().total_removed, 1);
    }

    #[tokio::test]
    async fn test_entries_not_due_are_skipped() {
        let (queue, clock, _sink) = queue();
        queue.register_handler("mint_nft", always_failing());
        queue.queue_transaction("tx1", "mint_nft", json!({})).unwrap();

        clock.advance_millis(4_999);
        assert_eq!(queue.process_due().await.attempted, 0);

        clock.advance_millis(1);
        assert_eq!(queue.process_due().await.attempted, 1);
    }

    /// Validates a successful attempt removes the entry.
    ///
    /// Assertions:
    /// - The report counts one success.
    /// - The queue is empty afterwards.
    #[tokio::test]
    async fn test_success_removes_entry() {
        let (queue, clock, sink) = queue();
        let order = Arc::new(Mutex::new(Vec::new()));
        queue.register_handler("mint_nft", recording(Arc::clone(&order)));
        queue.queue_transaction("tx1", "mint_nft", json!({})).unwrap();

        clock.advance_millis(5_000);
        let report = queue.process_due().await;

        assert_eq!(report.succeeded, 1);
        assert!(queue.is_empty());
        assert_eq!(*order.lock(), vec!["tx1".to_string()]);
        assert_eq!(sink.count_named("transaction_succeeded"), 1);
    }

    /// Validates capped exponential rescheduling until permanent failure.
    ///
    /// Assertions:
    /// - Each reschedule waits `min(1000 × 2^attempts, 300000)` ms.
    /// - The entry is removed after the 5th failed attempt.
    /// - A single permanent-failure event is emitted.
    #[tokio::test]
    async fn test_backoff_until_permanent_failure() {
        let (queue, clock, sink) = queue();
        queue.register_handler("mint_nft", always_failing());
        queue.queue_transaction("tx1", "mint_nft", json!({})).unwrap();
        clock.advance_millis(5_000);

        for attempts in 1..=4u32 {
            let report = queue.process_due().await;
            assert_eq!(report.rescheduled, 1, "attempt {attempts}");

            let tx = queue.get("tx1").unwrap();
            let expected_delay = (1_000u64 << attempts).min(300_000);
            assert_eq!(tx.attempts, attempts);
            assert_eq!(tx.next_retry_at - clock.millis_since_epoch(), expected_delay);
            assert!(tx.last_error.as_deref().unwrap().contains("rpc down"));

            clock.advance_millis(expected_delay);
        }

        let report = queue.process_due().await;
        assert_eq!(report.failed_permanently, 1);
        assert!(queue.get("tx1").is_none());
        assert_eq!(sink.count_named("transaction_failed_permanently"), 1);
        assert_eq!(queue.metrics().total_failed_permanently, 1);
    }

    #[tokio::test]
    async fn test_due_entries_processed_oldest_due_first() {
        let (queue, clock, _sink) = queue();
        let order = Arc::new(Mutex::new(Vec::new()));
        queue.register_handler("transfer", recording(Arc::clone(&order)));

        queue.queue_transaction("late", "transfer", json!({})).unwrap();
        clock.advance_millis(10);
        queue.queue_transaction("later", "transfer", json!({})).unwrap();
        clock.advance_millis(10);
        queue.queue_transaction("latest", "transfer", json!({})).unwrap();

        clock.advance_millis(10_000);
        queue.process_due().await;

        assert_eq!(*order.lock(), vec!["late", "later", "latest"]);
    }

    /// Validates per-entry isolation.
    ///
    /// Assertions:
    /// - A panicking handler and a missing handler only affect their own entries.
    /// - The healthy entry still succeeds in the same cycle.
    #[tokio::test]
    async fn test_failures_are_isolated() {
        let (queue, clock, _sink) = queue();
        queue.register_handler(
            "explode",
            handler_fn(|tx| async move {
                if tx.id == "a" {
                    panic!("boom");
                }
                Ok::<(), BoxError>(())
            }),
        );
        queue.register_handler("ok", handler_fn(|_tx| async { Ok::<(), BoxError>(()) }));

        queue.queue_transaction("a", "explode", json!({})).unwrap();
        queue.queue_transaction("b", "unregistered", json!({})).unwrap();
        queue.queue_transaction("c", "ok", json!({})).unwrap();

        clock.advance_millis(5_000);
        let report = queue.process_due().await;

        assert_eq!(report.attempted, 3);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.rescheduled, 2);
        assert!(queue.get("a").unwrap().last_error.unwrap().contains("boom"));
        assert!(queue
            .get("b")
            .unwrap()
            .last_error
            .unwrap()
            .contains("no handler registered for operation 'unregistered'"));
        assert!(queue.get("c").is_none());
    }

    #[tokio::test]
    async fn test_requeue_during_attempt_wins() {
        let clock = MockClock::with_epoch_millis(START_MS);
        let queue = Arc::new(TransactionQueue::with_clock(QueueConfig::default(), clock.clone()).unwrap());
        let weak = Arc::downgrade(&queue);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        queue.register_handler(
            "swap",
            handler_fn(move |tx| {
                let weak = weak.clone();
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if let Some(queue) = weak.upgrade() {
                        queue.queue_transaction(tx.id, "swap", json!({"fresh": true}))?;
                    }
                    Err::<(), BoxError>("stale attempt failed".into())
                }
            }),
        );

        queue.queue_transaction("tx1", "swap", json!({"fresh": false})).unwrap();
        clock.advance_millis(5_000);
        let report = queue.process_due().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.discarded, 1);
        let tx = queue.get("tx1").unwrap();
        assert_eq!(tx.attempts, 0);
        assert_eq!(tx.payload, json!({"fresh": true}));
        assert!(tx.last_error.is_none());
    }

    /// Validates that a cancelled cycle releases its entries.
    ///
    /// Assertions:
    /// - A cycle dropped by a timeout leaves the entry queued and unattempted.
    /// - The next cycle attempts the entry again and it succeeds.
    #[tokio::test(start_paused = true)]
    async fn test_cancelled_cycle_releases_entries() {
        let (queue, clock, _sink) = queue();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        queue.register_handler(
            "settle",
            handler_fn(move |_tx| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    }
                    Ok::<(), BoxError>(())
                }
            }),
        );
        queue.queue_transaction("tx1", "settle", json!({})).unwrap();
        clock.advance_millis(5_000);

        let cancelled = tokio::time::timeout(Duration::from_secs(1), queue.process_due()).await;
        assert!(cancelled.is_err());
        assert_eq!(queue.get("tx1").unwrap().attempts, 0);

        clock.advance_millis(600_000);
        let report = queue.process_due().await;
        assert_eq!(report.attempted, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(queue.is_empty());
    }

    /// Validates that overlapping cycles never attempt the same entry twice.
    #[tokio::test(start_paused = true)]
    async fn test_overlapping_cycles_skip_in_flight_entries() {
        let clock = MockClock::with_epoch_millis(START_MS);
        let queue = Arc::new(TransactionQueue::with_clock(QueueConfig::default(), clock.clone()).unwrap());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        queue.register_handler(
            "slow",
            handler_fn(move |_tx| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok::<(), BoxError>(())
                }
            }),
        );
        queue.queue_transaction("tx1", "slow", json!({})).unwrap();
        clock.advance_millis(5_000);

        let first = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.process_due().await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;

        let second = queue.process_due().await;
        assert_eq!(second.attempted, 0);

        let first = first.await.unwrap();
        assert_eq!(first.succeeded, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_queue_status() {
        let (queue, clock, _sink) = queue();
        assert_eq!(queue.queue_status().total, 0);
        assert!(queue.queue_status().oldest.is_none());

        queue.queue_transaction("a", "mint_nft", json!({})).unwrap();
        clock.advance_millis(1);
        queue.queue_transaction("b", "transfer", json!({})).unwrap();
        clock.advance_millis(1);
        queue.queue_transaction("c", "mint_nft", json!({})).unwrap();

        let status = queue.queue_status();
        assert_eq!(status.total, 3);
        assert_eq!(status.by_operation.get("mint_nft"), Some(&2));
        assert_eq!(status.by_operation.get("transfer"), Some(&1));
        assert_eq!(status.oldest.unwrap().id, "a");
    }

    #[test]
    fn test_unserializable_payload_rejected() {
        let (queue, _clock, _sink) = queue();
        let mut payload = HashMap::new();
        payload.insert((1, 2), "tuple keys are not valid JSON object keys");

        let result = queue.queue_transaction("tx1", "mint_nft", payload);
        assert!(matches!(result, Err(QueueError::Serialization { .. })));
    }
}
