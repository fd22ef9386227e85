//! Structured error classification shared by every resilience component.
//!
//! Retryability is decided from an [`ErrorKind`] (and optionally a code),
//! never from message text. Callers either implement
//! [`ErrorClassification`] for their own error types or use
//! [`OperationError`] directly.

use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Boxed error used for handler and rollback-action failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Category of a failure, used to partition retryable from terminal errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection refused, reset, DNS failure and similar transport errors.
    Network,
    /// The operation or a downstream call timed out.
    Timeout,
    /// Lock conflict, nonce clash or "resource busy" responses.
    Busy,
    /// A submitted blockchain transaction has no receipt yet.
    ReceiptNotFound,
    /// The downstream service is temporarily unavailable.
    Unavailable,
    /// Input failed validation.
    Validation,
    /// Caller lacks permission.
    PermissionDenied,
    /// Target entity does not exist.
    NotFound,
    /// Input could not be parsed or decoded.
    MalformedInput,
    /// A circuit breaker refused the call.
    CircuitOpen,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// All kinds considered transient by convention.
    pub const TRANSIENT: [Self; 5] =
        [Self::Network, Self::Timeout, Self::Busy, Self::ReceiptNotFound, Self::Unavailable];

    /// Whether failures of this kind may succeed when attempted again.
    ///
    /// `CircuitOpen` is transient, but it should be deferred rather than
    /// retried in a tight loop.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Network
                | Self::Timeout
                | Self::Busy
                | Self::ReceiptNotFound
                | Self::Unavailable
                | Self::CircuitOpen
        )
    }

    /// Stable lowercase identifier, used in logs and events.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Busy => "busy",
            Self::ReceiptNotFound => "receipt_not_found",
            Self::Unavailable => "unavailable",
            Self::Validation => "validation",
            Self::PermissionDenied => "permission_denied",
            Self::NotFound => "not_found",
            Self::MalformedInput => "malformed_input",
            Self::CircuitOpen => "circuit_open",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ErrorSeverity {
    /// Informational, typically for debugging
    Info,
    /// Warning, should be monitored but not critical
    Warning,
    /// Error, requires attention and action
    Error,
    /// Critical, immediate action required
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Classification interface consumed by retry policies and the queue.
pub trait ErrorClassification {
    /// Structured category of this error.
    fn kind(&self) -> ErrorKind;

    /// Optional machine-readable code (for example `"TIMEOUT"` or an RPC
    /// error code) that policies can match on.
    fn code(&self) -> Option<&str> {
        None
    }

    /// Check if this error is retryable
    fn is_retryable(&self) -> bool {
        self.kind().is_transient()
    }

    /// Get the error severity level
    fn severity(&self) -> ErrorSeverity {
        if self.kind().is_transient() {
            ErrorSeverity::Warning
        } else {
            ErrorSeverity::Error
        }
    }

    /// Check if this is a critical error requiring immediate attention
    fn is_critical(&self) -> bool {
        self.severity() == ErrorSeverity::Critical
    }
}

impl ErrorClassification for std::io::Error {
    fn kind(&self) -> ErrorKind {
        use std::io::ErrorKind as Io;

        match std::io::Error::kind(self) {
            Io::TimedOut => ErrorKind::Timeout,
            Io::ConnectionRefused
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::BrokenPipe
            | Io::AddrNotAvailable => ErrorKind::Network,
            Io::WouldBlock | Io::Interrupted => ErrorKind::Busy,
            Io::NotFound => ErrorKind::NotFound,
            Io::PermissionDenied => ErrorKind::PermissionDenied,
            Io::InvalidInput | Io::InvalidData | Io::UnexpectedEof => ErrorKind::MalformedInput,
            _ => ErrorKind::Internal,
        }
    }
}

/// A ready-made classified error for operations that have no richer type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct OperationError {
    kind: ErrorKind,
    code: Option<Cow<'static, str>>,
    message: String,
}

impl OperationError {
    /// Create an error of the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, code: None, message: message.into() }
    }

    /// Attach a machine-readable code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<Cow<'static, str>>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Shorthand for a [`ErrorKind::Network`] error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    /// Shorthand for a [`ErrorKind::Timeout`] error carrying code `TIMEOUT`.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message).with_code("TIMEOUT")
    }

    /// Shorthand for a [`ErrorKind::Validation`] error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// The human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl ErrorClassification for OperationError {
    fn kind(&self) -> ErrorKind {
        self.kind
    }

    fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value failed validation.
    #[error("Invalid configuration: {message}")]
    Invalid {
        /// What was wrong.
        message: String,
    },

    /// The configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// File that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML content could not be parsed.
    #[error("failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON content could not be parsed.
    #[error("failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),

    /// The file extension is neither `.toml` nor `.json`.
    #[error("unsupported config file format: {path}")]
    UnsupportedFormat {
        /// Offending path.
        path: PathBuf,
    },

    /// An environment override could not be parsed.
    #[error("invalid value '{value}' for {var}: {message}")]
    Env {
        /// Variable name.
        var: String,
        /// Raw value.
        value: String,
        /// Parse failure description.
        message: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Validates the retryable/terminal partition of [`ErrorKind`].
    ///
    /// Assertions:
    /// - Every kind in `TRANSIENT` is transient.
    /// - Validation, permission, not-found and malformed input are terminal.
    #[test]
    fn test_transient_partition() {
        for kind in ErrorKind::TRANSIENT {
            assert!(kind.is_transient(), "{kind} should be transient");
        }
        for kind in [
            ErrorKind::Validation,
            ErrorKind::PermissionDenied,
            ErrorKind::NotFound,
            ErrorKind::MalformedInput,
            ErrorKind::Internal,
        ] {
            assert!(!kind.is_transient(), "{kind} should be terminal");
        }
        assert!(ErrorKind::CircuitOpen.is_transient());
    }

    #[test]
    fn test_operation_error_classification() {
        let err = OperationError::timeout("rpc call exceeded 5s");
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.code(), Some("TIMEOUT"));
        assert!(err.is_retryable());
        assert_eq!(err.severity(), ErrorSeverity::Warning);
        assert_eq!(err.to_string(), "timeout: rpc call exceeded 5s");

        let err = OperationError::validation("price must be positive");
        assert!(!err.is_retryable());
        assert_eq!(err.severity(), ErrorSeverity::Error);
        assert!(!err.is_critical());
    }

    #[test]
    fn test_io_error_classification() {
        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "down");
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");

        assert_eq!(ErrorClassification::kind(&timed_out), ErrorKind::Timeout);
        assert_eq!(ErrorClassification::kind(&refused), ErrorKind::Network);
        assert!(!denied.is_retryable());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ReceiptNotFound).unwrap();
        assert_eq!(json, "\"receipt_not_found\"");
    }
}
