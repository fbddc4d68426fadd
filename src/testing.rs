//! Test doubles for code built on the coordinator.
//!
//! Collaborators are injected explicitly, so tests hand the executor these
//! fakes directly instead of registering mocks anywhere.
//!
//! - [`ScriptedFactory`]: a [`UnitOfWorkFactory`] whose attempts follow a
//!   script and which counts every creation and disposal
//! - [`RecordingLogger`]: an [`AttemptLogger`] that keeps every record
//!
//! # Example
//!
//! ```rust
//! use txretry::testing::{RecordingLogger, Script, ScriptedFactory};
//! use txretry::{sqlstate, DriverError, RetryExecutor, RetryPolicy};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let factory = ScriptedFactory::new()
//!     .then(Script::FailCommit(DriverError::new(sqlstate::SERIALIZATION_FAILURE, "conflict")));
//! let logger = RecordingLogger::new();
//!
//! let executor = RetryExecutor::new(
//!     factory.clone(),
//!     RetryPolicy::constant(Duration::from_millis(1)).with_max_attempts(3),
//! )
//! .with_logger(logger.clone());
//!
//! let value = executor
//!     .execute(|uow| Box::pin(async move {
//!         uow.stage("insert product");
//!         Ok(7)
//!     }))
//!     .await
//!     .unwrap();
//!
//! assert_eq!(value, 7);
//! assert_eq!(factory.created(), 2);
//! assert_eq!(factory.disposed(), 2);
//! assert_eq!(factory.committed(), vec!["insert product".to_string()]);
//! assert_eq!(logger.len(), 2);
//! # });
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::attempt::{Attempt, AttemptLogger, AttemptOutcome};
use crate::error::DriverError;
use crate::unit_of_work::{UnitOfWork, UnitOfWorkFactory, UnitOfWorkId};

/// What the factory does for one attempt.
#[derive(Debug)]
pub enum Script {
    /// Create, commit and dispose succeed.
    Commit,
    /// Creating the unit of work fails.
    FailCreate(DriverError),
    /// The commit fails; the staged writes are discarded.
    FailCommit(DriverError),
    /// Everything succeeds but releasing the connection reports an error.
    FailDispose(DriverError),
}

struct FactoryState<S> {
    scripts: VecDeque<Script>,
    create_calls: u32,
    created: u32,
    disposed: u32,
    leaked: u32,
    committed: Vec<String>,
    scopes: Vec<S>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Factory producing [`ScriptedUnitOfWork`]s according to a script.
///
/// Each created unit of work consumes the next [`Script`]; once the script
/// runs out every attempt behaves like [`Script::Commit`]. Clones share
/// state, so a test can keep a clone to inspect the counters.
pub struct ScriptedFactory<S = ()> {
    state: Arc<Mutex<FactoryState<S>>>,
    create_latency: Option<Duration>,
}

impl<S> Clone for ScriptedFactory<S> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            create_latency: self.create_latency,
        }
    }
}

impl<S> fmt::Debug for ScriptedFactory<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("ScriptedFactory")
            .field("remaining_scripts", &state.scripts.len())
            .field("created", &state.created)
            .field("disposed", &state.disposed)
            .field("leaked", &state.leaked)
            .finish()
    }
}

impl<S> Default for ScriptedFactory<S> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(FactoryState {
                scripts: VecDeque::new(),
                create_calls: 0,
                created: 0,
                disposed: 0,
                leaked: 0,
                committed: Vec::new(),
                scopes: Vec::new(),
            })),
            create_latency: None,
        }
    }
}

impl ScriptedFactory {
    /// A factory without scope whose attempts all succeed.
    ///
    /// Use `ScriptedFactory::<S>::default()` for a scoped one.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<S> ScriptedFactory<S> {
    /// Append a script step.
    pub fn then(self, script: Script) -> Self {
        lock(&self.state).scripts.push_back(script);
        self
    }

    /// Append `n` commit failures with the given native code.
    pub fn then_fail_commits(self, n: usize, code: &str) -> Self {
        (0..n).fold(self, |factory, i| {
            factory.then(Script::FailCommit(DriverError::new(
                code,
                format!("scripted failure #{}", i + 1),
            )))
        })
    }

    /// Sleep this long inside every `create` call.
    pub fn with_create_latency(mut self, latency: Duration) -> Self {
        self.create_latency = Some(latency);
        self
    }

    /// Number of `create` calls, failed ones included.
    pub fn create_calls(&self) -> u32 {
        lock(&self.state).create_calls
    }

    /// Number of units of work successfully created.
    pub fn created(&self) -> u32 {
        lock(&self.state).created
    }

    /// Number of `dispose` calls.
    pub fn disposed(&self) -> u32 {
        lock(&self.state).disposed
    }

    /// Units of work dropped without `dispose`.
    pub fn leaked(&self) -> u32 {
        lock(&self.state).leaked
    }

    /// Writes made durable by successful commits, in commit order.
    pub fn committed(&self) -> Vec<String> {
        lock(&self.state).committed.clone()
    }
}

impl<S: Clone> ScriptedFactory<S> {
    /// The scope handed to each created unit of work, in creation order.
    pub fn scopes(&self) -> Vec<S> {
        lock(&self.state).scopes.clone()
    }
}

impl<S> UnitOfWorkFactory for ScriptedFactory<S>
where
    S: Clone + Default + Send + Sync + 'static,
{
    type Unit = ScriptedUnitOfWork<S>;
    type Scope = S;

    async fn create_scoped(&self, scope: S) -> Result<ScriptedUnitOfWork<S>, DriverError> {
        if let Some(latency) = self.create_latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = lock(&self.state);
        state.create_calls += 1;
        let (commit_failure, dispose_failure) = match state.scripts.pop_front() {
            Some(Script::FailCreate(err)) => return Err(err),
            Some(Script::FailCommit(err)) => (Some(err), None),
            Some(Script::FailDispose(err)) => (None, Some(err)),
            Some(Script::Commit) | None => (None, None),
        };
        state.created += 1;
        state.scopes.push(scope.clone());
        let attempt = state.created;
        drop(state);

        Ok(ScriptedUnitOfWork {
            id: UnitOfWorkId::new(),
            attempt,
            scope,
            staged: Vec::new(),
            open: true,
            released: false,
            commit_failure,
            dispose_failure,
            state: Arc::clone(&self.state),
        })
    }
}

/// Unit of work created by [`ScriptedFactory`].
///
/// Writes passed to [`stage`](Self::stage) become visible in
/// [`ScriptedFactory::committed`] only when the commit succeeds.
pub struct ScriptedUnitOfWork<S = ()> {
    id: UnitOfWorkId,
    attempt: u32,
    scope: S,
    staged: Vec<String>,
    open: bool,
    released: bool,
    commit_failure: Option<DriverError>,
    dispose_failure: Option<DriverError>,
    state: Arc<Mutex<FactoryState<S>>>,
}

impl<S> fmt::Debug for ScriptedUnitOfWork<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedUnitOfWork")
            .field("id", &self.id)
            .field("attempt", &self.attempt)
            .field("staged", &self.staged)
            .field("open", &self.open)
            .finish()
    }
}

impl<S> ScriptedUnitOfWork<S> {
    /// 1-indexed creation number within the factory.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The scope this unit of work was created with.
    pub fn scope(&self) -> &S {
        &self.scope
    }

    /// Stage a write in the open transaction.
    pub fn stage(&mut self, write: impl Into<String>) {
        self.staged.push(write.into());
    }

    /// Writes staged so far.
    pub fn staged(&self) -> &[String] {
        &self.staged
    }
}

impl<S> UnitOfWork for ScriptedUnitOfWork<S>
where
    S: Send + 'static,
{
    fn id(&self) -> UnitOfWorkId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open && !self.released
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        if let Some(err) = self.commit_failure.take() {
            return Err(err);
        }
        lock(&self.state).committed.append(&mut self.staged);
        self.open = false;
        Ok(())
    }

    async fn dispose(mut self) -> Result<(), DriverError> {
        self.released = true;
        self.open = false;
        self.staged.clear();
        lock(&self.state).disposed += 1;
        match self.dispose_failure.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl<S> Drop for ScriptedUnitOfWork<S> {
    fn drop(&mut self) {
        if !self.released {
            lock(&self.state).leaked += 1;
        }
    }
}

/// Logger that keeps every attempt record. Clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct RecordingLogger {
    attempts: Arc<Mutex<Vec<Attempt>>>,
}

impl RecordingLogger {
    /// Create an empty logger.
    pub fn new() -> Self {
        Self::default()
    }

    /// All records so far.
    pub fn attempts(&self) -> Vec<Attempt> {
        lock(&self.attempts).clone()
    }

    /// Outcomes of all records so far.
    pub fn outcomes(&self) -> Vec<AttemptOutcome> {
        lock(&self.attempts).iter().map(|a| a.outcome).collect()
    }

    /// Backoff delays of all records that carry one.
    pub fn delays(&self) -> Vec<Duration> {
        lock(&self.attempts)
            .iter()
            .filter_map(|a| a.delay_before_next)
            .collect()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        lock(&self.attempts).len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        lock(&self.attempts).is_empty()
    }
}

impl AttemptLogger for RecordingLogger {
    fn record(&self, attempt: &Attempt) {
        lock(&self.attempts).push(attempt.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::sqlstate;

    #[tokio::test]
    async fn test_commit_publishes_staged_writes() {
        let factory = ScriptedFactory::new();
        let mut uow = factory.create().await.unwrap();
        uow.stage("a");
        uow.stage("b");
        assert!(uow.is_open());

        uow.commit().await.unwrap();
        assert!(!uow.is_open());
        uow.dispose().await.unwrap();

        assert_eq!(factory.committed(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(factory.created(), 1);
        assert_eq!(factory.disposed(), 1);
        assert_eq!(factory.leaked(), 0);
    }

    #[tokio::test]
    async fn test_failed_commit_discards_writes() {
        let factory = ScriptedFactory::new().then_fail_commits(1, sqlstate::SERIALIZATION_FAILURE);
        let mut uow = factory.create().await.unwrap();
        uow.stage("lost");

        let err = uow.commit().await.unwrap_err();
        assert_eq!(err.code(), "40001");
        uow.dispose().await.unwrap();

        assert!(factory.committed().is_empty());
    }

    #[tokio::test]
    async fn test_failed_create_is_not_counted_as_created() {
        let factory = ScriptedFactory::new()
            .then(Script::FailCreate(DriverError::new(sqlstate::CONNECTION_FAILURE, "reset")));

        assert!(factory.create().await.is_err());
        assert!(factory.create().await.is_ok());
        assert_eq!(factory.create_calls(), 2);
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn test_drop_without_dispose_counts_as_leak() {
        let factory = ScriptedFactory::new();
        let uow = factory.create().await.unwrap();
        drop(uow);
        assert_eq!(factory.leaked(), 1);
        assert_eq!(factory.disposed(), 0);
    }

    #[tokio::test]
    async fn test_scope_is_recorded() {
        let factory = ScriptedFactory::<String>::default();
        let uow = factory.create_scoped("alice".to_string()).await.unwrap();
        assert_eq!(uow.scope(), "alice");
        uow.dispose().await.unwrap();
        assert_eq!(factory.scopes(), vec!["alice".to_string()]);
    }
}
