//! Attempt records and the loggers that receive them.
//!
//! The executor produces one [`Attempt`] per attempt and hands it to an
//! [`AttemptLogger`]. Logging is best-effort: the executor contains a
//! panicking logger and carries on with the retry flow.

use std::time::{Duration, SystemTime};

use crate::classify::ErrorInfo;
use crate::unit_of_work::UnitOfWorkId;

/// How an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum AttemptOutcome {
    /// The operation and the commit succeeded.
    Success,
    /// A transient failure; another attempt may follow.
    TransientFailure,
    /// A fatal failure; the error is propagated.
    FatalFailure,
    /// The caller cancelled while the attempt was in flight.
    Cancelled,
}

impl AttemptOutcome {
    /// Stable lowercase name, as used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::TransientFailure => "transient_failure",
            Self::FatalFailure => "fatal_failure",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Immutable record of one attempt.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Attempt {
    /// 1-indexed attempt number.
    pub attempt_number: u32,
    /// Wall-clock start of the attempt.
    pub started_at: SystemTime,
    /// Time spent in the attempt, release included.
    pub elapsed: Duration,
    /// The unit of work used, if one was created.
    pub unit_of_work: Option<UnitOfWorkId>,
    /// How the attempt ended.
    pub outcome: AttemptOutcome,
    /// The classified error, for failed attempts.
    pub error: Option<ErrorInfo>,
    /// Backoff before the next attempt, for transient failures that will be retried.
    pub delay_before_next: Option<Duration>,
}

impl Attempt {
    /// The native code of the attempt's error, if any.
    pub fn native_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.native_code.as_str())
    }
}

/// Receives attempt records.
///
/// Closures of type `Fn(&Attempt)` implement this trait.
pub trait AttemptLogger: Send + Sync {
    /// Record an attempt. Must not block.
    fn record(&self, attempt: &Attempt);
}

impl<F> AttemptLogger for F
where
    F: Fn(&Attempt) + Send + Sync,
{
    fn record(&self, attempt: &Attempt) {
        self(attempt)
    }
}

/// Emits each attempt as a `tracing` event.
///
/// Successes log at `debug`, transient failures at `warn`, fatal failures
/// at `error` and cancellations at `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAttemptLogger;

impl AttemptLogger for TracingAttemptLogger {
    fn record(&self, attempt: &Attempt) {
        let number = attempt.attempt_number;
        let outcome = attempt.outcome.as_str();
        let elapsed_ms = attempt.elapsed.as_millis() as u64;
        let native_code = attempt.native_code().unwrap_or_default();
        let message = attempt
            .error
            .as_ref()
            .map(|e| e.message.as_str())
            .unwrap_or_default();
        let unit_of_work_id = attempt.unit_of_work.map(|id| id.to_string());
        let unit_of_work = unit_of_work_id.as_deref();

        match attempt.outcome {
            AttemptOutcome::Success => tracing::debug!(
                attempt = number,
                outcome,
                elapsed_ms,
                unit_of_work,
                "unit of work committed"
            ),
            AttemptOutcome::TransientFailure => tracing::warn!(
                attempt = number,
                outcome,
                native_code,
                elapsed_ms,
                delay_ms = attempt.delay_before_next.map(|d| d.as_millis() as u64),
                unit_of_work,
                "transient database failure: {}",
                message
            ),
            AttemptOutcome::FatalFailure => tracing::error!(
                attempt = number,
                outcome,
                native_code,
                elapsed_ms,
                unit_of_work,
                "fatal failure: {}",
                message
            ),
            AttemptOutcome::Cancelled => tracing::info!(
                attempt = number,
                outcome,
                elapsed_ms,
                unit_of_work,
                "attempt cancelled"
            ),
        }
    }
}

/// Discards every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAttemptLogger;

impl AttemptLogger for NoopAttemptLogger {
    fn record(&self, _attempt: &Attempt) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{Classification, ErrorInfo};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tracing_test::traced_test;

    fn attempt(outcome: AttemptOutcome, error: Option<ErrorInfo>) -> Attempt {
        Attempt {
            attempt_number: 2,
            started_at: SystemTime::now(),
            elapsed: Duration::from_millis(3),
            unit_of_work: Some(UnitOfWorkId::new()),
            outcome,
            error,
            delay_before_next: Some(Duration::from_millis(200)),
        }
    }

    fn serialization_failure() -> ErrorInfo {
        ErrorInfo {
            classification: Classification::Transient,
            native_code: "40001".to_string(),
            message: "could not serialize access".to_string(),
        }
    }

    #[test]
    fn test_closure_logger() {
        let calls = AtomicU32::new(0);
        let logger = |_: &Attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
        };
        logger.record(&attempt(AttemptOutcome::Success, None));
        logger.record(&attempt(AttemptOutcome::Success, None));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_native_code() {
        let failed = attempt(AttemptOutcome::TransientFailure, Some(serialization_failure()));
        assert_eq!(failed.native_code(), Some("40001"));
        assert_eq!(attempt(AttemptOutcome::Success, None).native_code(), None);
    }

    #[traced_test]
    #[test]
    fn test_tracing_logger_reports_transient_failure() {
        TracingAttemptLogger.record(&attempt(
            AttemptOutcome::TransientFailure,
            Some(serialization_failure()),
        ));

        assert!(logs_contain("transient database failure"));
        assert!(logs_contain("native_code=\"40001\""));
        assert!(logs_contain("delay_ms=200"));
    }

    #[traced_test]
    #[test]
    fn test_tracing_logger_reports_fatal_failure() {
        let info = ErrorInfo {
            classification: Classification::Fatal,
            native_code: "23505".to_string(),
            message: "duplicate key value".to_string(),
        };
        TracingAttemptLogger.record(&attempt(AttemptOutcome::FatalFailure, Some(info)));

        assert!(logs_contain("fatal failure: duplicate key value"));
        assert!(logs_contain("ERROR"));
    }

    #[test]
    fn test_outcome_names() {
        assert_eq!(AttemptOutcome::Success.as_str(), "success");
        assert_eq!(AttemptOutcome::TransientFailure.as_str(), "transient_failure");
        assert_eq!(AttemptOutcome::FatalFailure.as_str(), "fatal_failure");
        assert_eq!(AttemptOutcome::Cancelled.as_str(), "cancelled");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_attempt_serializes_to_json() {
        let failed = attempt(AttemptOutcome::TransientFailure, Some(serialization_failure()));
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["outcome"], "transient_failure");
        assert_eq!(json["error"]["classification"], "transient");
        assert_eq!(json["error"]["native_code"], "40001");

        let back: Attempt = serde_json::from_value(json).unwrap();
        assert_eq!(back, failed);
    }
}
