//! Retry budget and exponential backoff

use std::time::Duration;

use crate::config::{RetryConfig, Tuning};

/// Retry policy for transport-level failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay at zero failed attempts
    pub base_delay: Duration,
    /// Maximum backoff
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Create from config and the deployment's tuning
    #[must_use]
    pub fn new(config: &RetryConfig, tuning: &Tuning) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: tuning.backoff_base,
            max_backoff: config.max_backoff,
        }
    }

    /// `min(base * 2^failed_attempts, max_backoff)`
    #[must_use]
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        // 2^31 already overflows any sane base, so clamp the exponent
        let factor = 1u32 << failed_attempts.min(31);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(base_ms),
            max_backoff: Duration::from_millis(15_000),
        }
    }

    #[test]
    fn doubles_from_base() {
        let p = policy(1000);
        assert_eq!(p.delay_for(0), Duration::from_millis(1000));
        assert_eq!(p.delay_for(1), Duration::from_millis(2000));
        assert_eq!(p.delay_for(3), Duration::from_millis(8000));
    }

    #[test]
    fn monotonic_and_capped() {
        for base in [500, 1000] {
            let p = policy(base);
            let mut previous = Duration::ZERO;
            for attempts in 0..=10 {
                let delay = p.delay_for(attempts);
                assert!(delay >= previous, "attempt {attempts}: {delay:?} < {previous:?}");
                assert!(delay <= Duration::from_millis(15_000));
                previous = delay;
            }
            assert_eq!(p.delay_for(10), Duration::from_millis(15_000));
        }
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let p = policy(1000);
        assert_eq!(p.delay_for(u32::MAX), Duration::from_millis(15_000));
    }

    #[test]
    fn built_from_tuning() {
        let p = RetryPolicy::new(&RetryConfig::default(), &Tuning::local());
        assert_eq!(p.base_delay, Duration::from_millis(500));
        assert_eq!(p.max_retries, 3);
    }
}
