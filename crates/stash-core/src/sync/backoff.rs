//! Retry backoff policy
//!
//! Backoff state is a first-class value rather than closure-captured
//! timers, so transitions are directly testable.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with a cap, jitter, and a retry limit.
///
/// `delay(n) = min(max_delay, base_delay * 2^n) + jitter`, where the
/// jitter is uniform in `[0, jitter_fraction * delay]`. After
/// `max_retries` transient failures an operation parks instead of
/// retrying forever.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
    /// Fraction of the computed delay added as random jitter (0 to 1)
    pub jitter_fraction: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5 * 60),
            max_retries: 6,
            jitter_fraction: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Deterministic delay for the given retry count, before jitter
    #[must_use]
    pub fn base_for_retry(&self, retry_count: u32) -> Duration {
        let shift = retry_count.min(31);
        let scaled = self
            .base_delay
            .saturating_mul(1_u32.checked_shl(shift).unwrap_or(u32::MAX));
        scaled.min(self.max_delay)
    }

    /// Delay before the next attempt, with jitter applied
    #[must_use]
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        let base = self.base_for_retry(retry_count);
        if self.jitter_fraction <= 0.0 {
            return base;
        }
        let spread = base.as_millis() as f64 * self.jitter_fraction;
        let jitter = rand::thread_rng().gen_range(0.0..=spread.max(f64::MIN_POSITIVE));
        base + Duration::from_millis(jitter as u64)
    }

    /// Absolute Unix-ms time of the next attempt
    #[must_use]
    pub fn next_attempt_at(&self, now_ms: i64, retry_count: u32) -> i64 {
        let delay = self.delay_for_retry(retry_count);
        now_ms.saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            max_retries: 5,
            jitter_fraction: 0.0,
        }
    }

    #[test]
    fn test_delay_doubles_per_retry() {
        let policy = no_jitter();
        assert_eq!(policy.base_for_retry(0), Duration::from_millis(100));
        assert_eq!(policy.base_for_retry(1), Duration::from_millis(200));
        assert_eq!(policy.base_for_retry(2), Duration::from_millis(400));
        assert_eq!(policy.base_for_retry(3), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_is_strictly_increasing_below_cap() {
        let policy = no_jitter();
        let mut previous = Duration::ZERO;
        for retry in 0..6 {
            let delay = policy.delay_for_retry(retry);
            assert!(delay > previous, "retry {retry} should back off further");
            previous = delay;
        }
    }

    #[test]
    fn test_delay_caps_at_max() {
        let policy = no_jitter();
        assert_eq!(policy.base_for_retry(20), Duration::from_secs(10));
        // Huge retry counts must not overflow
        assert_eq!(policy.base_for_retry(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_fraction() {
        let policy = BackoffPolicy {
            jitter_fraction: 0.5,
            ..no_jitter()
        };
        for _ in 0..100 {
            let delay = policy.delay_for_retry(2);
            let base = Duration::from_millis(400);
            assert!(delay >= base);
            assert!(delay <= base + Duration::from_millis(200));
        }
    }

    #[test]
    fn test_next_attempt_at_offsets_from_now() {
        let policy = no_jitter();
        assert_eq!(policy.next_attempt_at(1_000, 0), 1_100);
        assert_eq!(policy.next_attempt_at(i64::MAX, 0), i64::MAX);
    }
}
