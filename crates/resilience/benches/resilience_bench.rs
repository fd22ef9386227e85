//! Resilience benchmarks
//!
//! Covers the breaker's closed and open paths, backoff computation, and
//! queue insertion and processing cycles.
//!
//! Run with: `cargo bench --bench resilience_bench -p swapdesk-resilience`

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use swapdesk_resilience::{
    handler_fn, BoxError, CircuitBreaker, CircuitBreakerConfig, MockClock, OperationError,
    QueueConfig, RetryPolicy, TransactionQueue,
};
use tokio::runtime::Builder as RuntimeBuilder;

// ============================================================================
// Circuit Breaker Benchmarks
// ============================================================================

fn bench_circuit_breaker(c: &mut Criterion) {
    let runtime = RuntimeBuilder::new_current_thread().build().expect("tokio runtime");
    let mut group = c.benchmark_group("circuit_breaker");

    group.bench_function("execute_success", |b| {
        let breaker = CircuitBreaker::new("bench", CircuitBreakerConfig::default())
            .expect("default breaker config");
        b.iter(|| {
            runtime.block_on(async {
                let result = breaker.execute(|| async { Ok::<_, OperationError>(1_u32) }).await;
                black_box(result.is_ok());
            });
        });
    });

    group.bench_function("open_rejection", |b| {
        let clock = MockClock::new();
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(1)
            .open_timeout(Duration::from_secs(60))
            .build()
            .expect("valid breaker config");
        let breaker =
            CircuitBreaker::with_clock("bench", config, clock).expect("breaker should build");
        breaker.record_failure();

        b.iter(|| {
            runtime.block_on(async {
                let result = breaker.execute(|| async { Ok::<_, OperationError>(()) }).await;
                black_box(result.is_err());
            });
        });
    });

    group.finish();
}

// ============================================================================
// Backoff Benchmarks
// ============================================================================

fn bench_backoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_backoff");

    for jitter in [false, true] {
        let policy = RetryPolicy::builder().max_attempts(10).jitter(jitter).build().expect("policy");
        group.bench_with_input(BenchmarkId::new("delay_for_attempt", jitter), &policy, |b, policy| {
            b.iter(|| {
                for attempt in 1..=10 {
                    black_box(policy.delay_for_attempt(black_box(attempt)));
                }
            });
        });
    }

    group.finish();
}

// ============================================================================
// Transaction Queue Benchmarks
// ============================================================================

fn bench_transaction_queue(c: &mut Criterion) {
    let runtime = RuntimeBuilder::new_current_thread().build().expect("tokio runtime");
    let mut group = c.benchmark_group("transaction_queue");

    for size in [10_usize, 100, 1_000] {
        group.bench_with_input(BenchmarkId::new("queue_transaction", size), &size, |b, &size| {
            b.iter(|| {
                let queue = TransactionQueue::with_clock(QueueConfig::default(), MockClock::new())
                    .expect("queue");
                for i in 0..size {
                    let _ = queue.queue_transaction(format!("tx-{i}"), "mint", json!({"i": i}));
                }
                black_box(queue.len());
            });
        });

        group.bench_with_input(BenchmarkId::new("process_due", size), &size, |b, &size| {
            b.iter(|| {
                let clock = MockClock::new();
                let queue =
                    TransactionQueue::with_clock(QueueConfig::default(), clock.clone()).expect("queue");
                queue.register_handler(
                    "mint",
                    handler_fn(|_tx| async { Ok::<(), BoxError>(()) }),
                );
                for i in 0..size {
                    let _ = queue.queue_transaction(format!("tx-{i}"), "mint", json!({}));
                }
                clock.advance(Duration::from_secs(5));
                black_box(runtime.block_on(queue.process_due()));
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_circuit_breaker, bench_backoff, bench_transaction_queue);
criterion_main!(benches);
