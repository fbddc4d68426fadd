//! Retry policy and the executor that applies it.
//!
//! [`RetryPolicy`] is plain data: it decides, from the number of the attempt
//! that just failed, whether to wait and try again or give up. The
//! [`RetryExecutor`] owns the side effects: it creates a fresh unit of work
//! per attempt, runs the caller's operation, commits, disposes, classifies
//! failures and sleeps between attempts.
//!
//! # Quick Start
//!
//! ```rust
//! use txretry::testing::ScriptedFactory;
//! use txretry::{RetryExecutor, RetryPolicy};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let executor = RetryExecutor::new(
//!     ScriptedFactory::new(),
//!     RetryPolicy::exponential(Duration::from_millis(100)).with_max_attempts(5),
//! );
//!
//! let value = executor.execute(|_uow| Box::pin(async { Ok("done") })).await.unwrap();
//! assert_eq!(value, "done");
//! # });
//! ```
//!
//! # Backoff
//!
//! The delay after failed attempt `n` is
//! `min(max_delay, base_delay * backoff_multiplier^(n - 1))`. With the
//! defaults (100ms base, multiplier 2.0, 5s cap) that gives 100ms, 200ms,
//! 400ms and so on. No delay follows the last permitted attempt.
//!
//! # Jitter
//!
//! Jitter is off by default, which keeps delays deterministic. Enable the
//! `jitter` feature to randomize them:
//!
//! ```toml
//! txretry = { version = "...", features = ["jitter"] }
//! ```
//!
//! ```rust,ignore
//! use txretry::RetryPolicy;
//! use std::time::Duration;
//!
//! // Add ±25% randomness to delays
//! let policy = RetryPolicy::exponential(Duration::from_millis(100)).with_jitter(0.25);
//! ```

mod executor;
mod policy;

pub use executor::RetryExecutor;
pub use policy::{JitterStrategy, RetryDecision, RetryPolicy, RetryPolicyConfig};
