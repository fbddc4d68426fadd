//! Isolated databases for integration tests.
//!
//! A [`DatabaseProvisioner`] hands out databases that share nothing with
//! each other, so tests exercising the retry executor can run in parallel
//! without their transactions colliding. How isolation is achieved is up to
//! the backend; see [`SqliteProvisioner`](crate::sqlite::SqliteProvisioner)
//! for a file-backed one that clones seeded templates.

use std::future::Future;

use thiserror::Error;

use crate::error::DriverError;

/// How a provisioned database is prepared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedingOptions {
    /// SQL run once per distinct script to build a template database.
    pub schema_seed_script: Option<String>,
}

impl SeedingOptions {
    /// An empty database.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A database seeded by `script`.
    pub fn with_seed_script(script: impl Into<String>) -> Self {
        Self {
            schema_seed_script: Some(script.into()),
        }
    }
}

/// A database acquired from a provisioner.
///
/// Hand it back with [`DatabaseProvisioner::release`] when the test is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolatedDatabaseHandle {
    name: String,
    connection_string: String,
    template_name: Option<String>,
}

impl IsolatedDatabaseHandle {
    /// Build a handle. Provisioner implementations call this.
    pub fn new(
        name: impl Into<String>,
        connection_string: impl Into<String>,
        template_name: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            connection_string: connection_string.into(),
            template_name,
        }
    }

    /// Unique name of the database within its provisioner.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Where to connect. For SQLite this is the database file path.
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// The template the database was cloned from, if it was seeded.
    pub fn template_name(&self) -> Option<&str> {
        self.template_name.as_deref()
    }
}

/// Errors raised while provisioning or releasing a database.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Filesystem failure.
    #[error("provisioning I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The seed script or the database engine failed.
    #[error("provisioning database failed: {0}")]
    Database(#[from] DriverError),

    /// The handle was never issued by this provisioner, or was already released.
    #[error("unknown database: {0}")]
    UnknownDatabase(String),
}

/// Creates and destroys isolated databases.
pub trait DatabaseProvisioner: Send + Sync {
    /// Create a database no other acquired handle shares state with.
    fn acquire(
        &self,
        options: SeedingOptions,
    ) -> impl Future<Output = Result<IsolatedDatabaseHandle, ProvisionError>> + Send;

    /// Destroy the database behind `handle`.
    fn release(
        &self,
        handle: IsolatedDatabaseHandle,
    ) -> impl Future<Output = Result<(), ProvisionError>> + Send;
}
