//! Reconnect backoff policy

use std::time::Duration;

/// Exponential backoff: `min(base * growth^(attempt-1), cap)`
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    base: Duration,
    growth: f64,
    cap: Duration,
    max_attempts: u32,
}

impl BackoffPolicy {
    /// Create a new policy
    ///
    /// - `base`: delay before the first retry
    /// - `growth`: multiplier applied per consecutive failure
    /// - `cap`: upper bound on any single delay
    /// - `max_attempts`: consecutive failures after which retrying stops
    pub fn new(base: Duration, growth: f64, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            growth,
            cap,
            max_attempts,
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base.as_secs_f64() * self.growth.powi(exponent);
        if !secs.is_finite() || secs >= self.cap.as_secs_f64() {
            return self.cap;
        }
        Duration::from_secs_f64(secs).min(self.cap)
    }

    /// Whether `attempts` consecutive failures exhaust the policy
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }
}

impl Default for BackoffPolicy {
    /// 3s base, ×1.5 growth, 30s cap, 10 attempts
    fn default() -> Self {
        Self::new(Duration::from_secs(3), 1.5, Duration::from_secs(30), 10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_delay_is_base() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(3));
        assert_eq!(policy.delay(0), Duration::from_secs(3));
    }

    #[test]
    fn test_delay_grows() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(2), Duration::from_millis(4_500));
        assert_eq!(policy.delay(3), Duration::from_millis(6_750));
        assert_eq!(policy.delay(4), Duration::from_millis(10_125));
    }

    #[test]
    fn test_delay_monotonic_and_capped() {
        let policy = BackoffPolicy::default();
        let mut previous = Duration::ZERO;
        for attempt in 1..=10 {
            let delay = policy.delay(attempt);
            assert!(delay >= previous, "attempt {} went backwards", attempt);
            assert!(delay <= Duration::from_secs(30));
            previous = delay;
        }
        assert_eq!(policy.delay(10), Duration::from_secs(30));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_huge_attempts_stay_capped() {
        let policy = BackoffPolicy::default();
        for attempt in [1_000, 1 << 31, (1 << 31) + 1, u32::MAX - 1, u32::MAX] {
            assert_eq!(policy.delay(attempt), Duration::from_secs(30), "attempt {}", attempt);
        }

        // Shrinking growth never dips below zero either
        let shrinking =
            BackoffPolicy::new(Duration::from_secs(3), 0.5, Duration::from_secs(30), 10);
        assert_eq!(shrinking.delay(u32::MAX), Duration::ZERO);
    }

    #[test]
    fn test_exhaustion() {
        let policy = BackoffPolicy::default();
        assert!(!policy.is_exhausted(9));
        assert!(policy.is_exhausted(10));
        assert!(policy.is_exhausted(11));
    }
}
