//! Retry and completion policies.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^attempt
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

impl FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            other => Err(format!("unknown backoff strategy: {other} (expected fixed, exponential or linear)")),
        }
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per task, the first one included (minimum 1)
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with a single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self::with_strategy(BackoffStrategy::Exponential, max_attempts, base_delay, max_delay)
    }

    pub fn with_strategy(
        strategy: BackoffStrategy,
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy,
        }
    }

    /// Calculate the delay after a failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => self
                .base_delay
                .saturating_mul(1 << (attempt - 1).min(30))
                .min(self.max_delay),
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt).min(self.max_delay),
        }
    }

    /// Attempts allowed, never fewer than one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Check if another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.attempts()
    }
}

/// Decides whether a finished job ends `done` or `error`.
///
/// A job fails when more than `max_failed_tasks` tasks ended in `error`, or when
/// the failed share exceeds `max_failed_ratio` (if set). Tasks still waiting on
/// a scheduled timeout retry are pending, not failed, and never count here.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompletionPolicy {
    pub max_failed_tasks: u64,
    pub max_failed_ratio: Option<f64>,
}

impl CompletionPolicy {
    /// Tolerate any number of failed tasks.
    pub fn lenient() -> Self {
        Self {
            max_failed_tasks: u64::MAX,
            max_failed_ratio: None,
        }
    }

    pub fn tolerates(&self, failed: u64, total: u64) -> bool {
        if failed == 0 {
            return true;
        }
        if failed > self.max_failed_tasks {
            return false;
        }
        match self.max_failed_ratio {
            Some(ratio) if total > 0 => (failed as f64 / total as f64) <= ratio,
            _ => true,
        }
    }

    /// Job-level error message, or `None` when the failures are tolerated.
    pub fn evaluate(&self, failed: u64, total: u64, last_error: Option<&str>) -> Option<String> {
        if self.tolerates(failed, total) {
            return None;
        }
        Some(match last_error {
            Some(err) => format!("{failed} of {total} tasks failed: {err}"),
            None => format!("{failed} of {total} tasks failed"),
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Linear,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn backoff_strategy_parses_config_names() {
        assert_eq!("Linear".parse::<BackoffStrategy>(), Ok(BackoffStrategy::Linear));
        assert_eq!(" fixed ".parse::<BackoffStrategy>(), Ok(BackoffStrategy::Fixed));
        assert!("random".parse::<BackoffStrategy>().is_err());
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }

    #[test]
    fn completion_policy_defaults_to_strict() {
        let policy = CompletionPolicy::default();
        assert_eq!(policy.evaluate(0, 10, None), None);
        assert_eq!(
            policy.evaluate(2, 10, Some("device not found: x")).as_deref(),
            Some("2 of 10 tasks failed: device not found: x")
        );
    }

    #[test]
    fn completion_policy_applies_count_and_ratio() {
        let policy = CompletionPolicy {
            max_failed_tasks: 3,
            max_failed_ratio: Some(0.25),
        };
        assert!(policy.tolerates(2, 10));
        assert!(!policy.tolerates(3, 10));
        assert!(!policy.tolerates(4, 100));
        assert!(CompletionPolicy::lenient().tolerates(99, 100));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: exponential delays never shrink and never exceed the cap.
        #[test]
        fn exponential_schedule_is_monotonic_and_capped(
            base_ms in 1u64..5_000,
            cap_ms in 1u64..120_000,
            attempts in 1u32..40,
        ) {
            let policy = RetryPolicy {
                max_attempts: attempts,
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(cap_ms),
                strategy: BackoffStrategy::Exponential,
            };

            let mut previous = Duration::ZERO;
            for attempt in 1..=attempts {
                let delay = policy.delay_for_attempt(attempt);
                prop_assert!(delay >= previous);
                prop_assert!(delay <= Duration::from_millis(cap_ms.max(base_ms)));
                previous = delay;
            }
        }
    }
}
