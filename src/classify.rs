//! Conflict classification: which driver errors are worth retrying.
//!
//! Classification is a pure, total function from a [`DriverError`] to an
//! [`ErrorInfo`]. Codes in the transient rule table map to
//! [`Classification::Transient`]; everything else, including codes nobody has
//! heard of, maps to [`Classification::Fatal`].
//!
//! # Example
//!
//! ```rust
//! use txretry::{sqlstate, Classification, ConflictClassifier, DriverError, SqlStateClassifier};
//!
//! let classifier = SqlStateClassifier::new();
//!
//! let conflict = DriverError::new(sqlstate::SERIALIZATION_FAILURE, "could not serialize access");
//! assert_eq!(classifier.classify(&conflict).classification, Classification::Transient);
//!
//! let duplicate = DriverError::new(sqlstate::UNIQUE_VIOLATION, "duplicate key value");
//! assert_eq!(classifier.classify(&duplicate).classification, Classification::Fatal);
//! ```

use std::fmt;

use crate::error::DriverError;

/// Native error codes known to the default classifier.
pub mod sqlstate {
    /// PostgreSQL `serialization_failure`.
    pub const SERIALIZATION_FAILURE: &str = "40001";
    /// PostgreSQL `deadlock_detected`.
    pub const DEADLOCK_DETECTED: &str = "40P01";
    /// PostgreSQL `lock_not_available` (lock timeout, `NOWAIT`).
    pub const LOCK_NOT_AVAILABLE: &str = "55P03";
    /// PostgreSQL `connection_exception`.
    pub const CONNECTION_EXCEPTION: &str = "08000";
    /// PostgreSQL `sqlclient_unable_to_establish_sqlconnection`.
    pub const UNABLE_TO_ESTABLISH_CONNECTION: &str = "08001";
    /// PostgreSQL `connection_does_not_exist`.
    pub const CONNECTION_DOES_NOT_EXIST: &str = "08003";
    /// PostgreSQL `sqlserver_rejected_establishment_of_sqlconnection`.
    pub const CONNECTION_REJECTED: &str = "08004";
    /// PostgreSQL `connection_failure` (connection reset).
    pub const CONNECTION_FAILURE: &str = "08006";
    /// PostgreSQL `admin_shutdown`.
    pub const ADMIN_SHUTDOWN: &str = "57P01";
    /// PostgreSQL `crash_shutdown`.
    pub const CRASH_SHUTDOWN: &str = "57P02";
    /// PostgreSQL `cannot_connect_now`.
    pub const CANNOT_CONNECT_NOW: &str = "57P03";
    /// PostgreSQL `unique_violation`.
    pub const UNIQUE_VIOLATION: &str = "23505";
    /// PostgreSQL `foreign_key_violation`.
    pub const FOREIGN_KEY_VIOLATION: &str = "23503";
    /// PostgreSQL `syntax_error`.
    pub const SYNTAX_ERROR: &str = "42601";
    /// PostgreSQL `insufficient_privilege`.
    pub const INSUFFICIENT_PRIVILEGE: &str = "42501";
    /// SQLite `SQLITE_BUSY`: another connection holds a conflicting lock.
    pub const SQLITE_BUSY: &str = "SQLITE_BUSY";
    /// SQLite `SQLITE_LOCKED`: conflict inside a shared-cache connection.
    pub const SQLITE_LOCKED: &str = "SQLITE_LOCKED";
    /// SQLite `SQLITE_CONSTRAINT`.
    pub const SQLITE_CONSTRAINT: &str = "SQLITE_CONSTRAINT";
}

/// Codes the default classifier treats as transient.
const TRANSIENT_CODES: &[&str] = &[
    sqlstate::SERIALIZATION_FAILURE,
    sqlstate::DEADLOCK_DETECTED,
    sqlstate::LOCK_NOT_AVAILABLE,
    sqlstate::CONNECTION_EXCEPTION,
    sqlstate::UNABLE_TO_ESTABLISH_CONNECTION,
    sqlstate::CONNECTION_DOES_NOT_EXIST,
    sqlstate::CONNECTION_REJECTED,
    sqlstate::CONNECTION_FAILURE,
    sqlstate::ADMIN_SHUTDOWN,
    sqlstate::CRASH_SHUTDOWN,
    sqlstate::CANNOT_CONNECT_NOW,
    sqlstate::SQLITE_BUSY,
    sqlstate::SQLITE_LOCKED,
];

/// Whether an error is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum Classification {
    /// Expected to go away on a fresh attempt.
    Transient,
    /// Retrying cannot help.
    Fatal,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => f.write_str("transient"),
            Self::Fatal => f.write_str("fatal"),
        }
    }
}

/// The classified view of an error, as recorded in attempts and errors.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ErrorInfo {
    /// Transient or fatal.
    pub classification: Classification,
    /// Native/vendor code. Empty for errors raised outside the driver.
    pub native_code: String,
    /// Human-readable message.
    pub message: String,
}

impl ErrorInfo {
    /// Build the info for a driver error with a given classification.
    pub fn from_driver(error: &DriverError, classification: Classification) -> Self {
        Self {
            classification,
            native_code: error.code().to_string(),
            message: error.message().to_string(),
        }
    }

    /// Build the info for an error raised by the operation itself.
    ///
    /// These never reach a classifier and are always fatal.
    pub fn application(message: impl Into<String>) -> Self {
        Self {
            classification: Classification::Fatal,
            native_code: String::new(),
            message: message.into(),
        }
    }

    /// Returns true if classified as transient.
    pub fn is_transient(&self) -> bool {
        self.classification == Classification::Transient
    }
}

/// Maps raw driver errors to a classification.
///
/// Implementations must be total and side-effect free. Closures of type
/// `Fn(&DriverError) -> Classification` implement this trait.
pub trait ConflictClassifier: Send + Sync {
    /// Classify a driver error.
    fn classify(&self, error: &DriverError) -> ErrorInfo;
}

impl<F> ConflictClassifier for F
where
    F: Fn(&DriverError) -> Classification + Send + Sync,
{
    fn classify(&self, error: &DriverError) -> ErrorInfo {
        ErrorInfo::from_driver(error, self(error))
    }
}

/// Classifier driven by a static table of transient native codes.
///
/// Covers PostgreSQL SQLSTATEs for serialization failures, deadlocks, lock
/// timeouts and lost connections, plus SQLite's busy/locked codes. Matching
/// ignores ASCII case and surrounding whitespace. Unknown codes are fatal.
#[derive(Debug, Clone, Default)]
pub struct SqlStateClassifier {
    extra_transient: Vec<String>,
}

impl SqlStateClassifier {
    /// Create a classifier with the built-in rule table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat an additional native code as transient.
    ///
    /// ```rust
    /// use txretry::{ConflictClassifier, DriverError, SqlStateClassifier};
    ///
    /// let classifier = SqlStateClassifier::new().with_transient("HY008");
    /// assert!(classifier.classify(&DriverError::new("HY008", "timeout")).is_transient());
    /// ```
    pub fn with_transient(mut self, code: impl Into<String>) -> Self {
        self.extra_transient.push(code.into().trim().to_string());
        self
    }

    /// Returns true if `code` is in the transient rule table.
    pub fn is_transient(&self, code: &str) -> bool {
        let code = code.trim();
        TRANSIENT_CODES
            .iter()
            .copied()
            .chain(self.extra_transient.iter().map(String::as_str))
            .any(|known| known.eq_ignore_ascii_case(code))
    }
}

impl ConflictClassifier for SqlStateClassifier {
    fn classify(&self, error: &DriverError) -> ErrorInfo {
        let classification = if self.is_transient(error.code()) {
            Classification::Transient
        } else {
            Classification::Fatal
        };
        ErrorInfo::from_driver(error, classification)
    }
}
