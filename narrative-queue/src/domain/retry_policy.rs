//! Backoff bounds for store-level retries.

use std::time::Duration;

/// Doubling backoff with a cap, used when a store operation has to be
/// repeated from scratch: contended transactions (claim, batch counters,
/// progress merge) and the storage collaborator's JSON read/write.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Adds up to a quarter of the delay at random, so contending writers drift apart.
    pub use_jitter: bool,
}

impl RetryPolicy {
    /// Transaction aborts on the queue store clear within milliseconds.
    pub fn contention() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 10,
            max_delay_ms: 2000,
            use_jitter: true,
        }
    }

    /// Whether retry number `attempt` (0-based) is still allowed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Wait before retry number `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay_ms = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);

        let jitter_ms = if self.use_jitter {
            (delay_ms as f64 * 0.25 * rand::random::<f64>()) as u64
        } else {
            0
        };
        Duration::from_millis(delay_ms + jitter_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(initial_delay_ms: u64, max_delay_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries: 10,
            initial_delay_ms,
            max_delay_ms,
            use_jitter: false,
        }
    }

    #[test]
    fn test_contention_policy_is_bounded() {
        let policy = RetryPolicy::contention();
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
    }

    #[test]
    fn test_delay_doubles_up_to_cap() {
        let policy = fixed(10, 2000);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(80));
        assert_eq!(policy.delay_for_attempt(8), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(200), Duration::from_millis(2000));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let policy = RetryPolicy {
            use_jitter: true,
            ..fixed(100, 1000)
        };
        let delay = policy.delay_for_attempt(1);
        assert!(delay >= Duration::from_millis(200));
        assert!(delay <= Duration::from_millis(250));
    }
}
