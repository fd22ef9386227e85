//! Deferred-retry transaction queue
//!
//! Holds operations that exhausted their immediate retries and re-attempts
//! them on a longer horizon: first after a fixed initial delay, then with
//! capped exponential backoff, until they succeed or run out of retries.
//! Work is dispatched to a [`TransactionHandler`] registered per operation
//! name. A [`QueueProcessor`] drives the cycles in the background.

mod core;
mod errors;
pub mod metrics;
mod processor;
mod types;

pub use self::core::TransactionQueue;
pub use self::errors::{QueueError, QueueResult};
pub use self::metrics::{QueueMetrics, QueueMetricsSnapshot};
pub use self::processor::QueueProcessor;
pub use self::types::{
    handler_fn, FnHandler, ProcessingReport, QueueConfig, QueueStatus, QueuedTransaction,
    TransactionHandler,
};
