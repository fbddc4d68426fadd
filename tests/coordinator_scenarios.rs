//! End-to-end scenarios for the retry executor, through the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use txretry::prelude::*;
use txretry::testing::{RecordingLogger, Script, ScriptedFactory};
use txretry::{DriverError, RetryPolicyConfig, UnitOfWorkId};

fn scenario_policy() -> RetryPolicy {
    RetryPolicy::new(RetryPolicyConfig {
        max_attempts: 3,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        backoff_multiplier: 2.0,
        ..RetryPolicyConfig::default()
    })
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn serialization_failures_then_success() {
    let factory = ScriptedFactory::new().then_fail_commits(2, sqlstate::SERIALIZATION_FAILURE);
    let logger = RecordingLogger::new();
    let executor = RetryExecutor::new(factory.clone(), scenario_policy()).with_logger(logger.clone());

    let total = executor
        .execute(|uow| {
            Box::pin(async move {
                uow.stage("UPDATE stock SET qty = qty - 1");
                Ok(41 + 1)
            })
        })
        .await
        .unwrap();

    assert_eq!(total, 42);
    assert_eq!(factory.created(), 3);
    assert_eq!(factory.disposed(), 3);
    assert_eq!(
        logger.delays(),
        vec![Duration::from_millis(100), Duration::from_millis(200)]
    );
    assert_eq!(
        logger.outcomes(),
        vec![
            AttemptOutcome::TransientFailure,
            AttemptOutcome::TransientFailure,
            AttemptOutcome::Success,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn unique_violation_propagates_immediately() {
    let factory = ScriptedFactory::new().then(Script::FailCommit(DriverError::new(
        sqlstate::UNIQUE_VIOLATION,
        "duplicate key value violates unique constraint \"products_name_key\"",
    )));
    let logger = RecordingLogger::new();
    let executor = RetryExecutor::new(factory.clone(), scenario_policy()).with_logger(logger.clone());

    let started = tokio::time::Instant::now();
    let err = executor
        .execute(|_uow| Box::pin(async { Ok(()) }))
        .await
        .unwrap_err();

    assert!(err.is_fatal());
    assert_eq!(err.native_code(), Some("23505"));
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(factory.created(), 1);
    assert_eq!(factory.disposed(), 1);
    assert_eq!(logger.outcomes(), vec![AttemptOutcome::FatalFailure]);
}

#[tokio::test(start_paused = true)]
async fn exhaustion_preserves_last_native_code() {
    let factory = ScriptedFactory::new()
        .then_fail_commits(1, sqlstate::SERIALIZATION_FAILURE)
        .then_fail_commits(1, sqlstate::SERIALIZATION_FAILURE)
        .then_fail_commits(1, sqlstate::DEADLOCK_DETECTED);
    let executor = RetryExecutor::new(factory.clone(), scenario_policy());

    let err = executor
        .execute(|_uow| Box::pin(async { Ok(()) }))
        .await
        .unwrap_err();

    assert!(err.is_retries_exhausted());
    assert_eq!(err.native_code(), Some(sqlstate::DEADLOCK_DETECTED));
    assert!(err.to_string().contains("retries exhausted after 3 attempts"));
    assert_eq!(factory.created(), 3);
    assert_eq!(factory.disposed(), 3);
}

#[tokio::test(start_paused = true)]
async fn cancellation_mid_delay_creates_no_second_unit_of_work() {
    let factory = ScriptedFactory::new().then_fail_commits(1, sqlstate::SERIALIZATION_FAILURE);
    let executor = RetryExecutor::new(factory.clone(), scenario_policy());
    let token = CancellationToken::new();

    let (result, ()) = tokio::join!(
        executor.execute_with_cancel(&token, |_uow| Box::pin(async { Ok(()) })),
        async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            token.cancel();
        }
    );

    let err = result.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(err.to_string(), "operation cancelled after 1 attempt(s)");
    assert_eq!(factory.create_calls(), 1);
    assert_eq!(factory.disposed(), 1);
}

#[tokio::test(start_paused = true)]
async fn per_call_policy() {
    let factory = ScriptedFactory::new().then_fail_commits(4, sqlstate::LOCK_NOT_AVAILABLE);
    let executor = RetryExecutor::new(factory.clone(), scenario_policy());

    let value = executor
        .execute_with_policy(
            &RetryPolicy::constant(Duration::from_millis(10)).with_max_attempts(5),
            |_uow| Box::pin(async { Ok("fifth time lucky") }),
        )
        .await
        .unwrap();

    assert_eq!(value, "fifth time lucky");
    assert_eq!(factory.created(), 5);
}

/// Tracks how many units of work are open at once.
#[derive(Clone, Default)]
struct OverlapFactory {
    open: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    failures_left: Arc<AtomicUsize>,
}

struct OverlapUnit {
    id: UnitOfWorkId,
    open: Arc<AtomicUsize>,
    fail_commit: bool,
}

impl UnitOfWorkFactory for OverlapFactory {
    type Unit = OverlapUnit;
    type Scope = ();

    async fn create_scoped(&self, _scope: ()) -> Result<OverlapUnit, DriverError> {
        let now_open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_open, Ordering::SeqCst);
        let fail_commit = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Ok(OverlapUnit {
            id: UnitOfWorkId::new(),
            open: Arc::clone(&self.open),
            fail_commit,
        })
    }
}

impl UnitOfWork for OverlapUnit {
    fn id(&self) -> UnitOfWorkId {
        self.id
    }

    fn is_open(&self) -> bool {
        true
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        if self.fail_commit {
            Err(DriverError::new(sqlstate::SERIALIZATION_FAILURE, "conflict"))
        } else {
            Ok(())
        }
    }

    async fn dispose(self) -> Result<(), DriverError> {
        tokio::task::yield_now().await;
        self.open.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn attempts_of_one_invocation_never_overlap() {
    let factory = OverlapFactory::default();
    factory.failures_left.store(3, Ordering::SeqCst);
    let executor = RetryExecutor::new(
        factory.clone(),
        RetryPolicy::exponential(Duration::from_millis(5)).with_max_attempts(5),
    );

    executor
        .execute(|_uow| Box::pin(async { Ok(()) }))
        .await
        .unwrap();

    assert_eq!(factory.peak.load(Ordering::SeqCst), 1);
    assert_eq!(factory.open.load(Ordering::SeqCst), 0);
}
