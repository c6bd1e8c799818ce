//! Retry schedule for transient token endpoint failures.

use std::time::Duration;

use backoff::ExponentialBackoff;

/// Bounded retry schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delays between attempts: doubling from `base_delay` up to
    /// `max_delay`, each randomized by ±50%. Attempts are bounded by
    /// `max_attempts`, not elapsed time.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.base_delay,
            initial_interval: self.base_delay,
            max_interval: self.max_delay.max(self.base_delay),
            multiplier: 2.0,
            randomization_factor: 0.5,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backoff::backoff::Backoff;

    fn within(d: Duration, lo_ms: u64, hi_ms: u64) -> bool {
        d >= Duration::from_millis(lo_ms) && d <= Duration::from_millis(hi_ms)
    }

    #[test]
    fn test_default_schedule() {
        let mut schedule = RetryPolicy::default().backoff();
        let first = schedule.next_backoff().unwrap();
        let second = schedule.next_backoff().unwrap();
        assert!(within(first, 500, 1501), "{:?}", first);
        assert!(within(second, 1000, 3001), "{:?}", second);
    }

    #[test]
    fn test_delay_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
        };
        let mut schedule = policy.backoff();
        for _ in 0..20 {
            let d = schedule.next_backoff().unwrap();
            assert!(d <= Duration::from_millis(601), "{:?}", d);
        }
    }

    #[test]
    fn test_immediate_policy() {
        let policy = RetryPolicy::immediate(0);
        assert_eq!(policy.attempts(), 1);
        let mut schedule = policy.backoff();
        assert_eq!(schedule.next_backoff(), Some(Duration::ZERO));
    }
}
