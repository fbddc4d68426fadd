//! Error types for the retry coordinator.
//!
//! Errors flow through three layers:
//!
//! - [`DriverError`]: what the transport/driver layer raises, carrying the
//!   vendor's native code (a SQLSTATE, or a SQLite result code name)
//! - [`AttemptError`]: what a single attempt can fail with, either a driver
//!   error or an application error raised by the caller's operation
//! - [`CoordinatorError`]: what [`RetryExecutor`](crate::RetryExecutor)
//!   surfaces to its caller once it stops retrying
//!
//! # Example
//!
//! ```rust
//! use txretry::{sqlstate, AttemptError, DriverError};
//!
//! let err = DriverError::new(sqlstate::UNIQUE_VIOLATION, "duplicate key value");
//! assert_eq!(err.code(), "23505");
//!
//! let attempt: AttemptError = err.into();
//! assert!(attempt.is_database());
//! ```

use std::time::Duration;

use thiserror::Error;

use crate::classify::{Classification, ErrorInfo};

/// Boxed error used for application failures and driver error sources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A raw error raised by the database transport/driver layer.
#[derive(Debug, Error)]
#[error("[{code}] {message}")]
pub struct DriverError {
    code: String,
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl DriverError {
    /// Create a driver error from a native code and a message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Attach the underlying driver error.
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// The native/vendor error code.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// The driver's error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Failure of a single attempt: operation, commit, or unit-of-work creation.
#[derive(Debug, Error)]
pub enum AttemptError {
    /// Raised by the database driver. Subject to classification.
    #[error(transparent)]
    Database(#[from] DriverError),
    /// Raised by the operation itself, unrelated to persistence. Always fatal.
    #[error("{0}")]
    Application(#[source] BoxError),
}

impl AttemptError {
    /// Wrap an application (non-database) error.
    pub fn application(error: impl Into<BoxError>) -> Self {
        Self::Application(error.into())
    }

    /// Returns true if the error came from the driver layer.
    pub fn is_database(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// A driver error together with its classification.
///
/// A transient `DatabaseError` is only ever seen by callers inside
/// [`RetriesExhausted`]; a fatal one inside [`FatalError::Database`].
#[derive(Debug, Error)]
#[error("{} database error [{}]: {}", .info.classification, .info.native_code, .info.message)]
pub struct DatabaseError {
    info: ErrorInfo,
    #[source]
    source: DriverError,
}

impl DatabaseError {
    /// Pair a driver error with the classifier's verdict.
    pub fn new(info: ErrorInfo, source: DriverError) -> Self {
        Self { info, source }
    }

    /// The classified view of the error.
    pub fn info(&self) -> &ErrorInfo {
        &self.info
    }

    /// The native code that triggered the error.
    pub fn native_code(&self) -> &str {
        &self.info.native_code
    }

    /// Returns true if the error was classified as transient.
    pub fn is_transient(&self) -> bool {
        self.info.classification == Classification::Transient
    }

    /// The raw driver error.
    pub fn driver_error(&self) -> &DriverError {
        &self.source
    }

    /// Extract the raw driver error.
    pub fn into_driver_error(self) -> DriverError {
        self.source
    }
}

/// A non-retryable failure.
#[derive(Debug, Error)]
pub enum FatalError {
    /// The driver raised an error classified as fatal.
    #[error(transparent)]
    Database(DatabaseError),
    /// The operation failed for a reason unrelated to the database.
    #[error("operation failed: {0}")]
    Operation(#[source] BoxError),
}

/// Error returned when the retry policy gives up on transient failures.
///
/// Wraps the last transient error along with metadata about the sequence.
#[derive(Debug, Error)]
#[error("retries exhausted after {attempts} attempts ({total_duration:?}): {last_error}")]
pub struct RetriesExhausted {
    /// The transient error from the final attempt.
    #[source]
    pub last_error: DatabaseError,
    /// Total number of attempts made.
    pub attempts: u32,
    /// Total time spent, including backoff.
    pub total_duration: Duration,
}

impl RetriesExhausted {
    /// Create a new RetriesExhausted error.
    pub fn new(last_error: DatabaseError, attempts: u32, total_duration: Duration) -> Self {
        Self {
            last_error,
            attempts,
            total_duration,
        }
    }

    /// Get a reference to the last transient error.
    pub fn error(&self) -> &DatabaseError {
        &self.last_error
    }

    /// Extract the last transient error, discarding metadata.
    pub fn into_error(self) -> DatabaseError {
        self.last_error
    }
}

/// The error surfaced by the coordinator to its caller.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// A fatal failure; no retry was attempted after it.
    #[error(transparent)]
    Fatal(FatalError),
    /// Every allowed attempt hit a transient failure.
    #[error(transparent)]
    RetriesExhausted(RetriesExhausted),
    /// The caller cancelled the invocation.
    #[error("operation cancelled after {attempts} attempt(s)")]
    Cancelled {
        /// Attempts started before cancellation took effect.
        attempts: u32,
    },
}

impl CoordinatorError {
    /// Returns true for [`CoordinatorError::Fatal`].
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Returns true for [`CoordinatorError::RetriesExhausted`].
    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self, Self::RetriesExhausted(_))
    }

    /// Returns true for [`CoordinatorError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// The native code of the triggering database error, if there was one.
    pub fn native_code(&self) -> Option<&str> {
        match self {
            Self::Fatal(FatalError::Database(err)) => Some(err.native_code()),
            Self::RetriesExhausted(exhausted) => Some(exhausted.last_error.native_code()),
            Self::Fatal(FatalError::Operation(_)) | Self::Cancelled { .. } => None,
        }
    }
}

/// Invalid retry policy configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// `max_attempts` was zero.
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,
    /// `backoff_multiplier` was below 1.0, NaN, or infinite.
    #[error("backoff_multiplier must be a finite number >= 1.0, got {0}")]
    InvalidMultiplier(f64),
    /// `base_delay` was larger than `max_delay`.
    #[error("base_delay ({base:?}) exceeds max_delay ({max:?})")]
    DelayBounds {
        /// Configured base delay.
        base: Duration,
        /// Configured delay cap.
        max: Duration,
    },
    /// Jitter factor outside `0.0..=1.0`.
    #[error("jitter factor must be within 0.0..=1.0, got {0}")]
    InvalidJitter(f64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{sqlstate, ErrorInfo};

    fn transient(code: &str) -> DatabaseError {
        let driver = DriverError::new(code, "could not serialize access");
        DatabaseError::new(ErrorInfo::from_driver(&driver, Classification::Transient), driver)
    }

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::new("40001", "could not serialize access");
        assert_eq!(err.to_string(), "[40001] could not serialize access");
    }

    #[test]
    fn test_driver_error_source_is_kept() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = DriverError::new(sqlstate::CONNECTION_FAILURE, "connection lost").with_source(io);
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("reset by peer"));
    }

    #[test]
    fn test_retries_exhausted_display() {
        let err = RetriesExhausted::new(transient("40001"), 3, Duration::from_millis(300));
        let display = err.to_string();
        assert!(display.contains("retries exhausted"));
        assert!(display.contains("3 attempts"));
        assert!(display.contains("40001"));
    }

    #[test]
    fn test_native_code_preserved() {
        let exhausted = CoordinatorError::RetriesExhausted(RetriesExhausted::new(
            transient("40P01"),
            2,
            Duration::ZERO,
        ));
        assert_eq!(exhausted.native_code(), Some("40P01"));
        assert!(exhausted.is_retries_exhausted());

        let operation = CoordinatorError::Fatal(FatalError::Operation("bad input".into()));
        assert_eq!(operation.native_code(), None);
        assert!(operation.is_fatal());

        let cancelled = CoordinatorError::Cancelled { attempts: 1 };
        assert_eq!(cancelled.native_code(), None);
        assert_eq!(cancelled.to_string(), "operation cancelled after 1 attempt(s)");
    }

    #[test]
    fn test_database_error_display_includes_classification() {
        let err = transient("40001");
        assert_eq!(
            err.to_string(),
            "transient database error [40001]: could not serialize access"
        );
        assert!(err.is_transient());
    }
}
