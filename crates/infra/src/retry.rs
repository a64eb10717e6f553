//! Retry and backoff policy shared by the ERP reconnect loop and the sync scheduler.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time.
    Fixed,
    /// base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts allowed before giving up (0 = never retry).
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Fraction of the delay (0.0-1.0) to spread attempts by.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before attempt number `attempt` (1-indexed). Attempt 0 never waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                // Clamp the exponent so large retry counts cannot overflow to inf.
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic spread keyed on the attempt number.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let spread = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (spread - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Earliest time the next attempt may run, given the previous attempt time.
    pub fn next_attempt_at(&self, last_attempt_at: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for_attempt(attempt))
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)));
        last_attempt_at + delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_until_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(200), Duration::from_millis(500));
    }

    #[test]
    fn linear_and_fixed_strategies() {
        let linear = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(linear.delay_for_attempt(3), Duration::from_millis(300));

        let fixed = RetryPolicy::fixed(3, Duration::from_millis(250));
        assert_eq!(fixed.delay_for_attempt(1), fixed.delay_for_attempt(3));
    }

    #[test]
    fn jitter_stays_within_range() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(1000), Duration::from_secs(60));
        for attempt in 1..5 {
            let nominal = 1000.0 * 2_f64.powi(attempt as i32 - 1);
            let actual = policy.delay_for_attempt(attempt).as_millis() as f64;
            assert!((actual - nominal).abs() <= nominal * 0.1 + 1.0);
        }
    }

    #[test]
    fn should_retry_respects_ceiling() {
        let policy = RetryPolicy {
            max_attempts: 2,
            ..Default::default()
        };
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
        assert!(!RetryPolicy::no_retry().should_retry(0));
    }

    #[test]
    fn next_attempt_is_offset_by_delay() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(30));
        let last = Utc::now();
        assert_eq!(policy.next_attempt_at(last, 1), last + chrono::Duration::seconds(30));
    }
}
