//! Exponential backoff for the change tracker.

use std::time::Duration;

/// Exponential backoff policy.
///
/// `delay(n)` is a pure function of the number of consecutive failures that
/// preceded the current one: `min_delay * multiplier^n`, capped at
/// `max_delay`. A successful exchange resets the count, so the next delay is
/// `min_delay` again.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub min_delay: Duration,
    /// Ceiling for the delay.
    pub max_delay: Duration,
    /// Growth factor per consecutive failure (at least 1.0).
    pub multiplier: f64,
}

impl BackoffPolicy {
    /// Creates a policy with the given bounds and a multiplier of 2.
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay: max_delay.max(min_delay),
            multiplier: 2.0,
        }
    }

    /// Sets the growth factor. Values below 1.0 are clamped to 1.0.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 };
        self
    }

    /// A policy with millisecond delays for tests.
    pub fn testing() -> Self {
        Self::new(Duration::from_millis(10), Duration::from_millis(80))
    }

    /// Delay to sleep given `failures` earlier consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        let min = self.min_delay.as_secs_f64();
        let max = self.max_delay.as_secs_f64();
        let exponent = failures.min(1024) as i32;
        let secs = min * self.multiplier.powi(exponent);

        if !secs.is_finite() || secs >= max {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(5 * 60))
    }
}

/// Consecutive-failure counter driving a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    failures: u32,
}

impl Backoff {
    /// Creates a counter with no recorded failures.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, failures: 0 }
    }

    /// Records a failure and returns how long to sleep before retrying.
    pub fn record_failure(&mut self) -> Duration {
        let delay = self.policy.delay(self.failures);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Resets after a fully successful exchange.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Number of consecutive failures recorded.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn grows_exponentially_to_cap() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_secs(1));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn counter_resets_to_minimum() {
        let mut backoff = Backoff::new(BackoffPolicy::testing());
        assert_eq!(backoff.record_failure(), Duration::from_millis(10));
        assert_eq!(backoff.record_failure(), Duration::from_millis(20));
        assert_eq!(backoff.failures(), 2);

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.record_failure(), Duration::from_millis(10));
    }

    #[test]
    fn multiplier_is_clamped() {
        let policy = BackoffPolicy::testing().with_multiplier(0.5);
        assert_eq!(policy.delay(3), policy.delay(0));
        let policy = BackoffPolicy::testing().with_multiplier(f64::NAN);
        assert_eq!(policy.multiplier, 1.0);
    }

    proptest! {
        #[test]
        fn delay_is_monotonic_and_bounded(
            min_ms in 1u64..5_000,
            extra_ms in 0u64..600_000,
            multiplier in 1.0f64..10.0,
            n in 0u32..2_000,
        ) {
            let policy = BackoffPolicy::new(
                Duration::from_millis(min_ms),
                Duration::from_millis(min_ms + extra_ms),
            )
            .with_multiplier(multiplier);

            prop_assert!(policy.delay(n + 1) >= policy.delay(n));
            prop_assert!(policy.delay(n) <= policy.max_delay);
            prop_assert!(policy.delay(n) >= policy.min_delay);
        }
    }
}
