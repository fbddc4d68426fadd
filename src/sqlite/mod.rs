//! SQLite backend: a unit-of-work factory and a test provisioner.
//!
//! Every unit of work opens its own [`rusqlite::Connection`] and begins a
//! transaction on it, so no connection state survives from one attempt to
//! the next.
//!
//! SQLite calls are synchronous and run inline on the tokio worker thread
//! that polls the executor. With a nonzero busy timeout, a contended
//! statement blocks that thread for up to the timeout. Run such executors
//! on a multi-threaded runtime, or keep the timeout at zero.
//!
//! Lock conflicts surface as `SQLITE_BUSY`, which the default classifier
//! treats as transient. The factory's busy timeout defaults to zero so that
//! conflicts are reported to the executor instead of being waited out inside
//! the driver.

mod factory;
mod provision;

pub use factory::{BeginMode, SqliteOptions, SqliteUnitOfWork, SqliteUnitOfWorkFactory};
pub use provision::SqliteProvisioner;

use rusqlite::ErrorCode;

use crate::classify::sqlstate;
use crate::error::{AttemptError, DriverError};

/// Native code for errors raised by rusqlite itself rather than the engine.
pub const CLIENT_ERROR: &str = "RUSQLITE_CLIENT";

// Prepare failures arrive as `SqlInputError` but still carry an engine code.
fn native_code(err: &rusqlite::Error) -> String {
    match err.sqlite_error() {
        Some(failure) => match failure.code {
            ErrorCode::DatabaseBusy => sqlstate::SQLITE_BUSY.to_string(),
            ErrorCode::DatabaseLocked => sqlstate::SQLITE_LOCKED.to_string(),
            ErrorCode::ConstraintViolation => sqlstate::SQLITE_CONSTRAINT.to_string(),
            _ => format!("SQLITE_ERROR_{}", failure.extended_code),
        },
        None => CLIENT_ERROR.to_string(),
    }
}

impl From<rusqlite::Error> for DriverError {
    fn from(err: rusqlite::Error) -> Self {
        DriverError::new(native_code(&err), err.to_string()).with_source(err)
    }
}

impl From<rusqlite::Error> for AttemptError {
    fn from(err: rusqlite::Error) -> Self {
        AttemptError::Database(err.into())
    }
}
