//! Resilience layer for calls to unreliable external operations in the
//! SwapDesk marketplace backend (blockchain transactions, downstream
//! services).
//!
//! # Components
//!
//! - [`CircuitBreaker`]: per-resource failure counter that fails fast while open
//! - [`RetryExecutor`]: immediate retries with exponential backoff and jitter
//! - [`TransactionQueue`]: deferred background retries for work that can wait
//! - [`RollbackManager`]: compensating actions for multi-step operations
//!
//! Each component reports its state changes to an [`EventSink`] and through
//! `tracing`.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod config;
pub mod error;
pub mod events;
pub mod queue;
pub mod resilience;
pub mod rollback;
pub mod time;

pub use config::ResilienceConfig;
pub use error::{
    BoxError, ConfigError, ConfigResult, ErrorClassification, ErrorKind, ErrorSeverity,
    OperationError,
};
pub use events::{EventSink, MemoryEventSink, NoOpEventSink, ResilienceEvent};
pub use queue::{
    handler_fn, ProcessingReport, QueueConfig, QueueError, QueueProcessor, QueueStatus,
    QueuedTransaction, TransactionHandler, TransactionQueue,
};
pub use resilience::{
    execute_with_retry, retry, BreakerError, CircuitBreaker, CircuitBreakerConfig,
    CircuitOpenError, CircuitState, ErrorMatcher, RetryError, RetryExecutor, RetryOutcome,
    RetryPolicy,
};
pub use rollback::{RollbackFailure, RollbackManager, RollbackPartialFailureError, RollbackReport};
pub use time::{Clock, MockClock, SystemClock};
