/// Exponential backoff for the group queue's retry loop.
///
/// The first failure waits `base`, each further failure doubles the
/// wait (or multiplies by `multiplier`), capped at `max_delay`.
/// `failures` is the retry counter exposed in queue snapshots.
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max_delay: Duration,
    multiplier: u32,
    /// Consecutive failures so far.
    pub failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_delay: Duration, multiplier: u32) -> Self {
        Self {
            base,
            max_delay,
            multiplier,
            failures: 0,
        }
    }

    /// Doubling backoff with no practical cap.
    pub fn doubling(base: Duration) -> Self {
        Self::new(base, Duration::MAX, 2)
    }

    /// Delay to wait after the `failure`-th consecutive failure (1-based).
    pub fn delay_for(&self, failure: u32) -> Duration {
        let exponent = failure.saturating_sub(1);
        let factor = self.multiplier.saturating_pow(exponent);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Records a failure and returns how long to wait before retrying.
    pub fn record_failure(&mut self) -> Duration {
        self.failures += 1;
        self.delay_for(self.failures)
    }

    /// True once the failure count has reached `max`.
    pub fn exhausted(&self, max: u32) -> bool {
        self.failures >= max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_schedule_base_five_seconds() {
        let b = Backoff::doubling(Duration::from_secs(5));
        assert_eq!(b.delay_for(1), Duration::from_secs(5));
        assert_eq!(b.delay_for(2), Duration::from_secs(10));
        assert_eq!(b.delay_for(3), Duration::from_secs(20));
        assert_eq!(b.delay_for(4), Duration::from_secs(40));
    }

    #[test]
    fn test_record_failure_advances() {
        let mut b = Backoff::doubling(Duration::from_secs(5));
        assert_eq!(b.record_failure(), Duration::from_secs(5));
        assert_eq!(b.record_failure(), Duration::from_secs(10));
        assert_eq!(b.failures, 2);
    }

    #[test]
    fn test_max_delay_cap() {
        let mut b = Backoff::new(Duration::from_secs(2), Duration::from_secs(10), 2);
        assert_eq!(b.record_failure(), Duration::from_secs(2));
        assert_eq!(b.record_failure(), Duration::from_secs(4));
        assert_eq!(b.record_failure(), Duration::from_secs(8));
        // 8 * 2 = 16, capped at 10
        assert_eq!(b.record_failure(), Duration::from_secs(10));
        assert_eq!(b.record_failure(), Duration::from_secs(10));
    }

    #[test]
    fn test_huge_failure_count_does_not_overflow() {
        let b = Backoff::new(Duration::from_secs(5), Duration::from_secs(3600), 2);
        assert_eq!(b.delay_for(200), Duration::from_secs(3600));
    }

    #[test]
    fn test_exhausted() {
        let mut b = Backoff::doubling(Duration::from_millis(1));
        for _ in 0..4 {
            b.record_failure();
            assert!(!b.exhausted(5));
        }
        b.record_failure();
        assert!(b.exhausted(5));
    }

    #[test]
    fn test_multiplier_three() {
        let b = Backoff::new(Duration::from_secs(1), Duration::from_secs(100), 3);
        assert_eq!(b.delay_for(1), Duration::from_secs(1));
        assert_eq!(b.delay_for(2), Duration::from_secs(3));
        assert_eq!(b.delay_for(3), Duration::from_secs(9));
        assert_eq!(b.delay_for(5), Duration::from_secs(81));
        assert_eq!(b.delay_for(6), Duration::from_secs(100));
    }
}
