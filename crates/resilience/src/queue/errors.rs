use thiserror::Error;

use crate::error::{ConfigError, ErrorClassification, ErrorKind};

/// Queue operation errors
///
/// Only insertion can fail. Failures of queued work itself are never
/// returned to a caller; they surface through logs and events.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A transaction was queued with a zero retry budget.
    #[error("max_retries must be at least 1 (transaction {id})")]
    InvalidMaxRetries {
        /// Offending transaction id.
        id: String,
    },

    /// The payload could not be converted to JSON.
    #[error("failed to serialize payload of transaction {id}: {source}")]
    Serialization {
        /// Offending transaction id.
        id: String,
        /// Underlying serializer error.
        #[source]
        source: serde_json::Error,
    },
}

impl ErrorClassification for QueueError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::InvalidMaxRetries { .. } => ErrorKind::Validation,
            Self::Serialization { .. } => ErrorKind::MalformedInput,
        }
    }
}

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;
