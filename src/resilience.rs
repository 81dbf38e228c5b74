//! Backoff schedule for storage retries.
//!
//! The matcher never gives up on a batch that failed with a storage timeout:
//! it waits according to [`RetryConfig`] and tries the same batch again.
//! Backlog grows in the meantime; nothing is dropped.

use std::time::Duration;

/// Exponential backoff between retries of a timed-out storage write.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Wait after the first failed attempt.
    pub first_delay: Duration,

    /// No wait is ever longer than this.
    pub ceiling: Duration,

    /// Growth of the wait per further failure.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::storage()
    }
}

impl RetryConfig {
    /// Schedule for a store that is expected to come back.
    ///
    /// ```text
    /// failure  wait
    /// -------  -----
    /// 1        100ms
    /// 2        200ms
    /// 3        400ms
    /// ...
    /// 7+       5s
    /// ```
    pub fn storage() -> Self {
        Self {
            first_delay: Duration::from_millis(100),
            ceiling: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }

    /// Millisecond waits so retry tests stay quick.
    pub fn testing() -> Self {
        Self {
            first_delay: Duration::from_millis(5),
            ceiling: Duration::from_millis(50),
            multiplier: 2.0,
        }
    }

    /// Wait after the `failures`-th consecutive failure (counted from 1).
    pub fn delay_for_attempt(&self, failures: usize) -> Duration {
        let Some(step) = failures.checked_sub(1) else {
            return self.first_delay;
        };

        let scale = self.multiplier.powi(i32::try_from(step).unwrap_or(i32::MAX));
        let wait = self.first_delay.as_secs_f64() * scale;
        if wait.is_finite() && wait < self.ceiling.as_secs_f64() {
            Duration::from_secs_f64(wait).min(self.ceiling)
        } else {
            self.ceiling
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_schedule() {
        let retry = RetryConfig::storage();
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(retry.delay_for_attempt(7), Duration::from_secs(5));
        assert_eq!(retry.delay_for_attempt(50), Duration::from_secs(5));
    }

    #[test]
    fn test_waits_double_until_ceiling() {
        let retry = RetryConfig {
            first_delay: Duration::from_millis(250),
            ceiling: Duration::from_secs(2),
            multiplier: 2.0,
        };

        let waits: Vec<_> = (0..=5).map(|n| retry.delay_for_attempt(n)).collect();
        assert_eq!(
            waits,
            vec![
                Duration::from_millis(250),
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(2),
            ]
        );
    }

    #[test]
    fn test_huge_failure_count_hits_ceiling() {
        let retry = RetryConfig::testing();
        assert_eq!(retry.delay_for_attempt(usize::MAX), retry.ceiling);
    }
}
