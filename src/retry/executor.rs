//! The retry loop: one fresh unit of work per attempt.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, SystemTime};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::Instant;
use tracing::Instrument;

use crate::attempt::{Attempt, AttemptLogger, AttemptOutcome, TracingAttemptLogger};
use crate::cancel::CancellationToken;
use crate::classify::{Classification, ConflictClassifier, ErrorInfo, SqlStateClassifier};
use crate::error::{AttemptError, CoordinatorError, DatabaseError, FatalError, RetriesExhausted};
use crate::retry::policy::{RetryDecision, RetryPolicy};
use crate::unit_of_work::{UnitOfWork, UnitOfWorkFactory, UnitOfWorkId};

/// Runs operations in a fresh unit of work, retrying transient conflicts.
///
/// Every attempt:
///
/// 1. creates a new unit of work from the factory,
/// 2. runs the operation against it, then commits,
/// 3. disposes the unit of work, whatever happened,
/// 4. records an [`Attempt`] with the logger.
///
/// Transient failures (per the classifier) are retried after the policy's
/// backoff; fatal failures and application errors propagate immediately.
/// If the operation panics, the unit of work is disposed and the attempt
/// recorded as a fatal failure before the panic resumes.
/// The executor holds no per-invocation state, so one executor can serve any
/// number of concurrent callers.
///
/// # Example
///
/// ```rust
/// use txretry::testing::ScriptedFactory;
/// use txretry::{sqlstate, RetryExecutor, RetryPolicy};
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let factory = ScriptedFactory::new().then_fail_commits(2, sqlstate::SERIALIZATION_FAILURE);
/// let executor = RetryExecutor::new(
///     factory.clone(),
///     RetryPolicy::exponential(Duration::from_millis(1)).with_max_attempts(3),
/// );
///
/// let answer = executor
///     .execute(|_uow| Box::pin(async { Ok(42) }))
///     .await
///     .unwrap();
///
/// assert_eq!(answer, 42);
/// assert_eq!(factory.created(), 3);
/// assert_eq!(factory.disposed(), 3);
/// # });
/// ```
pub struct RetryExecutor<F, C = SqlStateClassifier, L = TracingAttemptLogger> {
    factory: F,
    policy: RetryPolicy,
    classifier: C,
    logger: L,
}

impl<F, C, L> fmt::Debug for RetryExecutor<F, C, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("factory", &std::any::type_name::<F>())
            .field("policy", &self.policy)
            .field("classifier", &std::any::type_name::<C>())
            .field("logger", &std::any::type_name::<L>())
            .finish()
    }
}

impl<F> RetryExecutor<F> {
    /// Executor with the SQLSTATE classifier and the tracing logger.
    pub fn new(factory: F, policy: RetryPolicy) -> Self {
        Self {
            factory,
            policy,
            classifier: SqlStateClassifier::new(),
            logger: TracingAttemptLogger,
        }
    }
}

impl<F, C, L> RetryExecutor<F, C, L> {
    /// Replace the classifier.
    pub fn with_classifier<C2>(self, classifier: C2) -> RetryExecutor<F, C2, L> {
        RetryExecutor {
            factory: self.factory,
            policy: self.policy,
            classifier,
            logger: self.logger,
        }
    }

    /// Replace the attempt logger.
    pub fn with_logger<L2>(self, logger: L2) -> RetryExecutor<F, C, L2> {
        RetryExecutor {
            factory: self.factory,
            policy: self.policy,
            classifier: self.classifier,
            logger,
        }
    }

    /// The default retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// The unit-of-work factory.
    pub fn factory(&self) -> &F {
        &self.factory
    }
}

/// How a single attempt ended, before classification.
enum AttemptStep<T> {
    Committed(T),
    Failed(AttemptError),
    Cancelled,
    Panicked(Box<dyn Any + Send>),
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl<F, C, L> RetryExecutor<F, C, L>
where
    F: UnitOfWorkFactory,
    C: ConflictClassifier,
    L: AttemptLogger,
{
    /// Run `operation` in a fresh unit of work per attempt until it commits.
    ///
    /// The operation receives the attempt's unit of work by mutable
    /// reference and must not keep it past the returned future.
    pub async fn execute<T, Op>(&self, operation: Op) -> Result<T, CoordinatorError>
    where
        T: Send,
        Op: for<'u> FnMut(&'u mut F::Unit) -> BoxFuture<'u, Result<T, AttemptError>> + Send,
    {
        let never = CancellationToken::new();
        self.run(F::Scope::default(), &self.policy, &never, operation)
            .await
    }

    /// Like [`execute`](Self::execute), handing `scope` to every unit of work.
    pub async fn execute_scoped<T, Op>(
        &self,
        scope: F::Scope,
        operation: Op,
    ) -> Result<T, CoordinatorError>
    where
        T: Send,
        Op: for<'u> FnMut(&'u mut F::Unit) -> BoxFuture<'u, Result<T, AttemptError>> + Send,
    {
        let never = CancellationToken::new();
        self.run(scope, &self.policy, &never, operation).await
    }

    /// Like [`execute`](Self::execute), with a per-call policy.
    pub async fn execute_with_policy<T, Op>(
        &self,
        policy: &RetryPolicy,
        operation: Op,
    ) -> Result<T, CoordinatorError>
    where
        T: Send,
        Op: for<'u> FnMut(&'u mut F::Unit) -> BoxFuture<'u, Result<T, AttemptError>> + Send,
    {
        let never = CancellationToken::new();
        self.run(F::Scope::default(), policy, &never, operation)
            .await
    }

    /// Like [`execute`](Self::execute), stopping when `cancel` fires.
    ///
    /// Cancellation is observed while a unit of work is being created, while
    /// the operation or commit runs, and during backoff. The current unit of
    /// work is disposed before [`CoordinatorError::Cancelled`] is returned,
    /// and no further attempt starts.
    pub async fn execute_with_cancel<T, Op>(
        &self,
        cancel: &CancellationToken,
        operation: Op,
    ) -> Result<T, CoordinatorError>
    where
        T: Send,
        Op: for<'u> FnMut(&'u mut F::Unit) -> BoxFuture<'u, Result<T, AttemptError>> + Send,
    {
        self.run(F::Scope::default(), &self.policy, cancel, operation)
            .await
    }

    /// Scoped and cancellable.
    pub async fn execute_scoped_with_cancel<T, Op>(
        &self,
        scope: F::Scope,
        cancel: &CancellationToken,
        operation: Op,
    ) -> Result<T, CoordinatorError>
    where
        T: Send,
        Op: for<'u> FnMut(&'u mut F::Unit) -> BoxFuture<'u, Result<T, AttemptError>> + Send,
    {
        self.run(scope, &self.policy, cancel, operation).await
    }

    async fn run<T, Op>(
        &self,
        scope: F::Scope,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        mut operation: Op,
    ) -> Result<T, CoordinatorError>
    where
        T: Send,
        Op: for<'u> FnMut(&'u mut F::Unit) -> BoxFuture<'u, Result<T, AttemptError>> + Send,
    {
        let start = Instant::now();
        let mut attempt: u32 = 1;
        let mut prev_delay: Option<Duration> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(CoordinatorError::Cancelled {
                    attempts: attempt - 1,
                });
            }

            let started_at = SystemTime::now();
            let attempt_start = Instant::now();
            let span = tracing::debug_span!("unit_of_work", attempt, id = tracing::field::Empty);
            let (step, unit_of_work) = self
                .run_attempt(scope.clone(), cancel, &mut operation)
                .instrument(span)
                .await;

            let mut record = Attempt {
                attempt_number: attempt,
                started_at,
                elapsed: attempt_start.elapsed(),
                unit_of_work,
                outcome: AttemptOutcome::Success,
                error: None,
                delay_before_next: None,
            };

            let driver_error = match step {
                AttemptStep::Committed(value) => {
                    self.record(&record);
                    return Ok(value);
                }
                AttemptStep::Cancelled => {
                    record.outcome = AttemptOutcome::Cancelled;
                    self.record(&record);
                    return Err(CoordinatorError::Cancelled { attempts: attempt });
                }
                AttemptStep::Panicked(payload) => {
                    let reason = panic_message(payload.as_ref());
                    record.outcome = AttemptOutcome::FatalFailure;
                    record.error = Some(ErrorInfo::application(format!(
                        "operation panicked: {reason}"
                    )));
                    self.record(&record);
                    panic::resume_unwind(payload);
                }
                AttemptStep::Failed(AttemptError::Application(err)) => {
                    record.outcome = AttemptOutcome::FatalFailure;
                    record.error = Some(ErrorInfo::application(err.to_string()));
                    self.record(&record);
                    return Err(CoordinatorError::Fatal(FatalError::Operation(err)));
                }
                AttemptStep::Failed(AttemptError::Database(err)) => err,
            };

            let info = self.classifier.classify(&driver_error);
            if info.classification == Classification::Fatal {
                record.outcome = AttemptOutcome::FatalFailure;
                record.error = Some(info.clone());
                self.record(&record);
                return Err(CoordinatorError::Fatal(FatalError::Database(
                    DatabaseError::new(info, driver_error),
                )));
            }

            let decision = policy.delay_with_jitter(attempt, prev_delay);
            record.outcome = AttemptOutcome::TransientFailure;
            record.error = Some(info.clone());
            record.delay_before_next = decision.delay();
            self.record(&record);

            let delay = match decision {
                RetryDecision::Retry(delay) => delay,
                RetryDecision::Abort => {
                    return Err(CoordinatorError::RetriesExhausted(RetriesExhausted::new(
                        DatabaseError::new(info, driver_error),
                        attempt,
                        start.elapsed(),
                    )));
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(attempt, "cancelled during backoff");
                    return Err(CoordinatorError::Cancelled { attempts: attempt });
                }
                _ = tokio::time::sleep(delay) => {}
            }

            prev_delay = Some(delay);
            attempt += 1;
        }
    }

    /// One attempt, bracketed: the unit of work is disposed before returning.
    async fn run_attempt<T, Op>(
        &self,
        scope: F::Scope,
        cancel: &CancellationToken,
        operation: &mut Op,
    ) -> (AttemptStep<T>, Option<UnitOfWorkId>)
    where
        T: Send,
        Op: for<'u> FnMut(&'u mut F::Unit) -> BoxFuture<'u, Result<T, AttemptError>> + Send,
    {
        let created = tokio::select! {
            biased;
            _ = cancel.cancelled() => return (AttemptStep::Cancelled, None),
            created = self.factory.create_scoped(scope) => created,
        };
        let mut unit = match created {
            Ok(unit) => unit,
            Err(err) => return (AttemptStep::Failed(err.into()), None),
        };
        let id = unit.id();
        tracing::Span::current().record("id", tracing::field::display(id));

        let outcome = {
            let work = AssertUnwindSafe(async {
                let value = operation(&mut unit).await?;
                unit.commit().await?;
                Ok::<T, AttemptError>(value)
            })
            .catch_unwind();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = work => Some(result),
            }
        };

        // Released before a caught panic is resumed by the caller.
        self.release(unit).await;

        let step = match outcome {
            Some(Ok(Ok(value))) => AttemptStep::Committed(value),
            Some(Ok(Err(err))) => AttemptStep::Failed(err),
            Some(Err(payload)) => AttemptStep::Panicked(payload),
            None => AttemptStep::Cancelled,
        };
        (step, Some(id))
    }

    async fn release(&self, unit: F::Unit) {
        let id = unit.id();
        if let Err(err) = unit.dispose().await {
            tracing::warn!(
                unit_of_work = %id,
                native_code = err.code(),
                "unit of work release failed: {}",
                err
            );
        }
    }

    fn record(&self, attempt: &Attempt) {
        let logged = panic::catch_unwind(AssertUnwindSafe(|| self.logger.record(attempt)));
        if let Err(payload) = logged {
            let reason = panic_message(payload.as_ref());
            tracing::error!(
                attempt = attempt.attempt_number,
                "attempt logger panicked: {}",
                reason
            );
        }
    }
}
