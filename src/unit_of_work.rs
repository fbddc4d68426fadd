//! Unit-of-work abstraction: one transactional session per attempt.
//!
//! A [`UnitOfWork`] owns a connection and an open transaction for exactly
//! one attempt. A [`UnitOfWorkFactory`] creates a brand-new one on every
//! call; the executor never reuses one across attempts, since transaction
//! state left behind by a conflict is unsafe to reuse.
//!
//! Implementations should roll back in `Drop` when [`UnitOfWork::dispose`]
//! was never called. That is what keeps a dropped `execute` future (for
//! instance one raced against a timeout) from leaving a dangling transaction.

use std::fmt;
use std::future::Future;

use uuid::Uuid;

use crate::error::DriverError;

/// Opaque identifier of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UnitOfWorkId(Uuid);

impl UnitOfWorkId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UnitOfWorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UnitOfWorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Exclusive, time-bounded access to a transactional database session.
pub trait UnitOfWork: Send + Sized {
    /// Identifier, unique per created unit of work.
    fn id(&self) -> UnitOfWorkId;

    /// Returns true while the transaction is open (not yet committed or released).
    fn is_open(&self) -> bool;

    /// Commit the transaction.
    ///
    /// May fail transiently; serializable conflicts often surface only here.
    fn commit(&mut self) -> impl Future<Output = Result<(), DriverError>> + Send;

    /// Roll back anything uncommitted and release the connection.
    ///
    /// Called exactly once per unit of work by the executor, on every exit
    /// path of the attempt.
    fn dispose(self) -> impl Future<Output = Result<(), DriverError>> + Send;
}

/// Creates independent units of work on demand.
///
/// `Scope` is caller-scoped context handed to every unit of work of one
/// invocation, such as the identity of the current user. Use `()` when
/// there is none.
pub trait UnitOfWorkFactory: Send + Sync {
    /// The unit of work produced.
    type Unit: UnitOfWork;

    /// Caller-scoped dependencies injected into each unit of work.
    type Scope: Clone + Default + Send + Sync;

    /// Open a new connection and transaction carrying `scope`.
    fn create_scoped(
        &self,
        scope: Self::Scope,
    ) -> impl Future<Output = Result<Self::Unit, DriverError>> + Send;

    /// Open a new connection and transaction with the default scope.
    fn create(&self) -> impl Future<Output = Result<Self::Unit, DriverError>> + Send {
        self.create_scoped(Self::Scope::default())
    }
}
