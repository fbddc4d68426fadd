//! # txretry
//!
//! Run a database operation inside a fresh transactional unit of work, and
//! run it again in a brand-new one when it fails with a transient
//! concurrency conflict.
//!
//! Under serializable isolation and optimistic concurrency, conflicting
//! transactions are aborted by the database (serialization failures,
//! deadlocks, lock timeouts, dropped connections). Retrying on the same
//! session is unsafe, because it keeps stale cached state. This crate:
//!
//! - creates a new unit of work per attempt and always disposes it,
//! - classifies failures into transient and fatal by native error code,
//! - backs off exponentially between attempts, up to a bounded count,
//! - records every attempt for diagnostics.
//!
//! ## Quick Example
//!
//! ```rust
//! use txretry::sqlite::{SqliteProvisioner, SqliteUnitOfWorkFactory};
//! use txretry::{DatabaseProvisioner, RetryExecutor, RetryPolicy, SeedingOptions};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let provisioner = SqliteProvisioner::new().unwrap();
//! let db = provisioner
//!     .acquire(SeedingOptions::with_seed_script(
//!         "CREATE TABLE products (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE);",
//!     ))
//!     .await
//!     .unwrap();
//!
//! let executor = RetryExecutor::new(
//!     SqliteUnitOfWorkFactory::new(db.connection_string()),
//!     RetryPolicy::exponential(Duration::from_millis(100)).with_max_attempts(5),
//! );
//!
//! let inserted = executor
//!     .execute(|uow| Box::pin(async move {
//!         Ok(uow.execute("INSERT INTO products (name) VALUES ('lamp')", [])?)
//!     }))
//!     .await
//!     .unwrap();
//! assert_eq!(inserted, 1);
//!
//! // A unique violation is fatal: one attempt, no retry.
//! let err = executor
//!     .execute(|uow| Box::pin(async move {
//!         Ok(uow.execute("INSERT INTO products (name) VALUES ('lamp')", [])?)
//!     }))
//!     .await
//!     .unwrap_err();
//! assert!(err.is_fatal());
//!
//! provisioner.release(db).await.unwrap();
//! # });
//! ```
//!
//! ## Features
//!
//! - `sqlite` (default): [`sqlite`] backend built on `rusqlite`
//! - `jitter`: randomized backoff via [`JitterStrategy`]
//! - `serde`: `Serialize`/`Deserialize` for policy configuration and attempt records

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod attempt;
pub mod cancel;
pub mod classify;
pub mod error;
pub mod provision;
pub mod retry;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod testing;
pub mod unit_of_work;

// Re-exports
pub use attempt::{Attempt, AttemptLogger, AttemptOutcome, NoopAttemptLogger, TracingAttemptLogger};
pub use cancel::CancellationToken;
pub use classify::{sqlstate, Classification, ConflictClassifier, ErrorInfo, SqlStateClassifier};
pub use error::{
    AttemptError, BoxError, ConfigError, CoordinatorError, DatabaseError, DriverError, FatalError,
    RetriesExhausted,
};
pub use provision::{DatabaseProvisioner, IsolatedDatabaseHandle, ProvisionError, SeedingOptions};
pub use retry::{JitterStrategy, RetryDecision, RetryExecutor, RetryPolicy, RetryPolicyConfig};
pub use unit_of_work::{UnitOfWork, UnitOfWorkFactory, UnitOfWorkId};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::attempt::{Attempt, AttemptLogger, AttemptOutcome};
    pub use crate::cancel::CancellationToken;
    pub use crate::classify::{sqlstate, Classification, ConflictClassifier};
    pub use crate::error::{AttemptError, CoordinatorError, DriverError};
    pub use crate::retry::{RetryExecutor, RetryPolicy};
    pub use crate::unit_of_work::{UnitOfWork, UnitOfWorkFactory};
}
