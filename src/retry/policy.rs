//! Retry policy types and configuration.

use std::time::Duration;

use crate::error::ConfigError;

/// Immutable retry configuration supplied at coordinator construction.
///
/// # Examples
///
/// ```rust
/// use txretry::{RetryPolicy, RetryPolicyConfig};
/// use std::time::Duration;
///
/// let config = RetryPolicyConfig {
///     max_attempts: 3,
///     base_delay: Duration::from_millis(100),
///     max_delay: Duration::from_secs(1),
///     backoff_multiplier: 2.0,
///     ..RetryPolicyConfig::default()
/// };
///
/// let policy = RetryPolicy::new(config).unwrap();
/// assert_eq!(policy.max_attempts(), 3);
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct RetryPolicyConfig {
    /// Total attempts allowed, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,
    /// Randomness applied on top of the computed delay.
    pub jitter: JitterStrategy,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: JitterStrategy::None,
        }
    }
}

impl RetryPolicyConfig {
    /// Check the configuration for values the policy cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidMultiplier(self.backoff_multiplier));
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigError::DelayBounds {
                base: self.base_delay,
                max: self.max_delay,
            });
        }
        if let JitterStrategy::Proportional(factor) = self.jitter {
            if !(0.0..=1.0).contains(&factor) {
                return Err(ConfigError::InvalidJitter(factor));
            }
        }
        Ok(())
    }
}

/// Strategy for adding randomness to delays.
///
/// Randomness requires the `jitter` feature. Without it every strategy
/// returns the deterministic delay.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum JitterStrategy {
    /// No jitter applied.
    #[default]
    None,
    /// Add ±percentage randomness to delay.
    Proportional(f64),
    /// Random delay between 0 and calculated delay (AWS recommended).
    Full,
    /// Random delay between the calculated delay and 3x the previous one.
    Decorrelated,
}

/// What to do after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then start a new attempt.
    Retry(Duration),
    /// Stop retrying.
    Abort,
}

impl RetryDecision {
    /// The delay, if retrying.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Self::Retry(d) => Some(*d),
            Self::Abort => None,
        }
    }

    /// Returns true for [`RetryDecision::Abort`].
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Abort)
    }
}

/// A retry policy deciding attempt count and backoff.
///
/// Policies are pure data: they describe retry behavior but don't execute
/// it. The delay after attempt `n` (1-indexed) is
/// `min(base_delay * backoff_multiplier^(n-1), max_delay)`, and the policy
/// aborts once `n` reaches `max_attempts`.
///
/// # Examples
///
/// ```rust
/// use txretry::{RetryDecision, RetryPolicy};
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential(Duration::from_millis(100))
///     .with_max_attempts(3)
///     .with_max_delay(Duration::from_secs(1));
///
/// assert_eq!(policy.next_delay(1), RetryDecision::Retry(Duration::from_millis(100)));
/// assert_eq!(policy.next_delay(2), RetryDecision::Retry(Duration::from_millis(200)));
/// assert_eq!(policy.next_delay(3), RetryDecision::Abort);
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RetryPolicy {
    config: RetryPolicyConfig,
}

impl RetryPolicy {
    /// Create a policy from a configuration, rejecting invalid values.
    pub fn new(config: RetryPolicyConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Delay doubles after every failed attempt.
    pub fn exponential(base: Duration) -> Self {
        Self {
            config: RetryPolicyConfig {
                base_delay: base,
                max_delay: RetryPolicyConfig::default().max_delay.max(base),
                ..RetryPolicyConfig::default()
            },
        }
    }

    /// The same delay after every failed attempt.
    pub fn constant(delay: Duration) -> Self {
        Self {
            config: RetryPolicyConfig {
                base_delay: delay,
                max_delay: delay,
                backoff_multiplier: 1.0,
                ..RetryPolicyConfig::default()
            },
        }
    }

    /// Set the total number of attempts. Values below 1 are raised to 1.
    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n.max(1);
        self
    }

    /// Set the maximum delay cap.
    ///
    /// Delays will never exceed this value, jitter included.
    pub fn with_max_delay(mut self, d: Duration) -> Self {
        self.config.max_delay = d;
        self
    }

    /// Set the growth factor. Values below 1.0, NaN or infinity become 1.0.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.config.backoff_multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            1.0
        };
        self
    }

    /// Add proportional jitter to delays.
    ///
    /// The factor determines the range of randomness. For example, `0.25`
    /// means the actual delay will be ±25% of the calculated delay.
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.config.jitter = JitterStrategy::Proportional(factor.clamp(0.0, 1.0));
        self
    }

    /// Use full jitter: a random delay between 0 and the calculated delay.
    pub fn with_full_jitter(mut self) -> Self {
        self.config.jitter = JitterStrategy::Full;
        self
    }

    /// Use decorrelated jitter.
    pub fn with_decorrelated_jitter(mut self) -> Self {
        self.config.jitter = JitterStrategy::Decorrelated;
        self
    }

    /// The underlying configuration.
    pub fn config(&self) -> &RetryPolicyConfig {
        &self.config
    }

    /// Total attempts allowed.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// The maximum delay cap.
    pub fn max_delay(&self) -> Duration {
        self.config.max_delay
    }

    /// The jitter strategy.
    pub fn jitter(&self) -> &JitterStrategy {
        &self.config.jitter
    }

    /// Validate the policy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.config.validate()
    }

    /// Decide what follows failed attempt `attempt` (1-indexed), without jitter.
    ///
    /// Attempt `0` is treated as attempt `1`, so the first attempt always
    /// runs before the policy can abort.
    pub fn next_delay(&self, attempt: u32) -> RetryDecision {
        let attempt = attempt.max(1);
        if attempt >= self.config.max_attempts {
            return RetryDecision::Abort;
        }
        RetryDecision::Retry(self.backoff(attempt))
    }

    /// Like [`next_delay`](Self::next_delay), with the jitter strategy applied.
    ///
    /// `prev_delay` is the delay used before the failed attempt, if any.
    pub fn delay_with_jitter(&self, attempt: u32, prev_delay: Option<Duration>) -> RetryDecision {
        match self.next_delay(attempt) {
            RetryDecision::Retry(base) => RetryDecision::Retry(self.config.jitter.apply(
                base,
                prev_delay,
                self.config.max_delay,
            )),
            RetryDecision::Abort => RetryDecision::Abort,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let cap = self.config.max_delay;
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let factor = self.config.backoff_multiplier.max(1.0).powi(exponent);
        // Computed in whole nanoseconds so integral multipliers stay exact.
        let nanos = self.config.base_delay.as_nanos() as f64 * factor;
        if !nanos.is_finite() || nanos >= cap.as_nanos() as f64 {
            return cap;
        }
        Duration::from_nanos(nanos.round() as u64)
    }
}

impl JitterStrategy {
    /// Apply jitter to a base delay, capped at `max_delay`.
    pub fn apply(
        &self,
        base_delay: Duration,
        #[cfg_attr(not(feature = "jitter"), allow(unused_variables))] prev_delay: Option<Duration>,
        max_delay: Duration,
    ) -> Duration {
        let jittered = match self {
            JitterStrategy::None => base_delay,
            #[cfg(feature = "jitter")]
            JitterStrategy::Proportional(factor) => {
                use rand::Rng;
                let base_millis = base_delay.as_millis() as f64;
                let jitter_range = base_millis * factor.clamp(0.0, 1.0);
                let min = (base_millis - jitter_range).max(0.0);
                let max = base_millis + jitter_range;
                if max <= min {
                    base_delay
                } else {
                    Duration::from_millis(rand::rng().random_range(min..=max) as u64)
                }
            }
            #[cfg(not(feature = "jitter"))]
            JitterStrategy::Proportional(_) => base_delay,
            #[cfg(feature = "jitter")]
            JitterStrategy::Full => {
                use rand::Rng;
                let max_millis = base_delay.as_millis() as u64;
                if max_millis == 0 {
                    Duration::ZERO
                } else {
                    Duration::from_millis(rand::rng().random_range(0..=max_millis))
                }
            }
            #[cfg(not(feature = "jitter"))]
            JitterStrategy::Full => base_delay,
            #[cfg(feature = "jitter")]
            JitterStrategy::Decorrelated => {
                use rand::Rng;
                let prev = prev_delay.unwrap_or(base_delay);
                let base_millis = base_delay.as_millis() as u64;
                let max_millis = prev.as_millis().saturating_mul(3) as u64;
                if max_millis <= base_millis {
                    base_delay
                } else {
                    Duration::from_millis(rand::rng().random_range(base_millis..=max_millis))
                }
            }
            #[cfg(not(feature = "jitter"))]
            JitterStrategy::Decorrelated => base_delay,
        };

        jittered.min(max_delay)
    }
}

#[cfg(test)]
mod policy_tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_exponential_delay() {
        let policy = RetryPolicy::exponential(ms(100))
            .with_max_attempts(6)
            .with_max_delay(Duration::from_secs(10));

        assert_eq!(policy.next_delay(1), RetryDecision::Retry(ms(100)));
        assert_eq!(policy.next_delay(2), RetryDecision::Retry(ms(200)));
        assert_eq!(policy.next_delay(3), RetryDecision::Retry(ms(400)));
        assert_eq!(policy.next_delay(4), RetryDecision::Retry(ms(800)));
        assert_eq!(policy.next_delay(5), RetryDecision::Retry(ms(1600)));
        assert_eq!(policy.next_delay(6), RetryDecision::Abort);
    }

    #[test]
    fn test_constant_delay() {
        let policy = RetryPolicy::constant(ms(50)).with_max_attempts(4);

        assert_eq!(policy.next_delay(1), RetryDecision::Retry(ms(50)));
        assert_eq!(policy.next_delay(2), RetryDecision::Retry(ms(50)));
        assert_eq!(policy.next_delay(3), RetryDecision::Retry(ms(50)));
        assert_eq!(policy.next_delay(4), RetryDecision::Abort);
    }

    #[test]
    fn test_fractional_multiplier() {
        let policy = RetryPolicy::exponential(ms(100))
            .with_multiplier(1.5)
            .with_max_attempts(4);

        assert_eq!(policy.next_delay(1), RetryDecision::Retry(ms(100)));
        assert_eq!(policy.next_delay(2), RetryDecision::Retry(ms(150)));
        assert_eq!(policy.next_delay(3), RetryDecision::Retry(ms(225)));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = RetryPolicy::exponential(ms(100))
            .with_max_attempts(10)
            .with_max_delay(ms(500));

        assert_eq!(policy.next_delay(3), RetryDecision::Retry(ms(400)));
        assert_eq!(policy.next_delay(4), RetryDecision::Retry(ms(500))); // capped
        assert_eq!(policy.next_delay(9), RetryDecision::Retry(ms(500))); // capped
    }

    #[test]
    fn test_huge_exponent_saturates_at_cap() {
        let policy = RetryPolicy::exponential(ms(100))
            .with_max_attempts(u32::MAX)
            .with_max_delay(Duration::from_secs(30));

        assert_eq!(
            policy.next_delay(10_000),
            RetryDecision::Retry(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_single_attempt_aborts_immediately() {
        let policy = RetryPolicy::exponential(ms(100)).with_max_attempts(1);
        assert_eq!(policy.next_delay(1), RetryDecision::Abort);
    }

    #[test]
    fn test_attempt_zero_treated_as_first() {
        let policy = RetryPolicy::exponential(ms(100)).with_max_attempts(3);
        assert_eq!(policy.next_delay(0), policy.next_delay(1));
    }

    #[test]
    fn test_builder_clamps_invalid_values() {
        let policy = RetryPolicy::exponential(ms(100))
            .with_max_attempts(0)
            .with_multiplier(0.5);
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.config().backoff_multiplier, 1.0);

        let policy = RetryPolicy::exponential(ms(100)).with_multiplier(f64::NAN);
        assert_eq!(policy.config().backoff_multiplier, 1.0);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let zero = RetryPolicyConfig {
            max_attempts: 0,
            ..RetryPolicyConfig::default()
        };
        assert_eq!(RetryPolicy::new(zero), Err(ConfigError::ZeroAttempts));

        let shrinking = RetryPolicyConfig {
            backoff_multiplier: 0.5,
            ..RetryPolicyConfig::default()
        };
        assert_eq!(
            RetryPolicy::new(shrinking),
            Err(ConfigError::InvalidMultiplier(0.5))
        );

        let inverted = RetryPolicyConfig {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(1),
            ..RetryPolicyConfig::default()
        };
        assert!(matches!(
            RetryPolicy::new(inverted),
            Err(ConfigError::DelayBounds { .. })
        ));

        let wild_jitter = RetryPolicyConfig {
            jitter: JitterStrategy::Proportional(3.0),
            ..RetryPolicyConfig::default()
        };
        assert_eq!(
            RetryPolicy::new(wild_jitter),
            Err(ConfigError::InvalidJitter(3.0))
        );
    }

    #[test]
    fn test_default_config_is_valid() {
        let policy = RetryPolicy::new(RetryPolicyConfig::default()).unwrap();
        assert_eq!(policy, RetryPolicy::default());
        assert_eq!(policy.max_attempts(), 5);
    }

    #[test]
    fn test_jitter_none_returns_base_delay() {
        let jitter = JitterStrategy::None;
        assert_eq!(jitter.apply(ms(100), None, ms(1000)), ms(100));
    }

    #[test]
    fn test_jitter_respects_cap() {
        for jitter in [
            JitterStrategy::None,
            JitterStrategy::Proportional(1.0),
            JitterStrategy::Full,
            JitterStrategy::Decorrelated,
        ] {
            for _ in 0..50 {
                let delay = jitter.apply(ms(100), Some(ms(400)), ms(120));
                assert!(delay <= ms(120), "{jitter:?} produced {delay:?}");
            }
        }
    }

    #[cfg(feature = "jitter")]
    #[test]
    fn test_proportional_jitter_range() {
        let jitter = JitterStrategy::Proportional(0.25);
        for _ in 0..100 {
            let delay = jitter.apply(ms(100), None, Duration::from_secs(1));
            assert!(delay >= ms(75) && delay <= ms(125), "got {delay:?}");
        }
    }

    #[cfg(not(feature = "jitter"))]
    #[test]
    fn test_jitter_is_deterministic_without_feature() {
        let policy = RetryPolicy::exponential(ms(100))
            .with_full_jitter()
            .with_max_attempts(3);
        assert_eq!(
            policy.delay_with_jitter(1, None),
            RetryDecision::Retry(ms(100))
        );
    }

    #[test]
    fn test_delay_with_jitter_aborts_like_next_delay() {
        let policy = RetryPolicy::exponential(ms(10))
            .with_decorrelated_jitter()
            .with_max_attempts(2);
        assert!(policy.delay_with_jitter(2, Some(ms(10))).is_abort());
    }
}
