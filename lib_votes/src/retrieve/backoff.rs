//! # Reconnect Backoff
//!
//! Exponential delays between stream sessions, capped and jittered so a
//! fleet of clients does not reconnect in lockstep.

use std::time::Duration;

use rand::Rng;

/// Minimum wait after the endpoint answered 420 or 429.
pub const RATE_LIMIT_FLOOR: Duration = Duration::from_secs(60);

/// How a supervisor retries failed sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Consecutive failed sessions tolerated; zero runs a single session.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// A policy with the given bounds.
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    /// Never reconnect: the first session to end is the last.
    pub fn never() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Whether `attempt` (1-based) is still allowed.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }

    /// Delay before reconnect `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`, minus up to a fifth as jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let capped = self.ceiling_for(attempt);
        let spread = (capped.as_millis() / 5) as u64;
        if spread == 0 {
            return capped;
        }
        capped.saturating_sub(Duration::from_millis(rand::rng().random_range(0..=spread)))
    }

    /// The un-jittered delay for `attempt`.
    pub fn ceiling_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base_delay.saturating_mul(1u32 << exponent).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_then_cap() {
        let policy = ReconnectPolicy::new(Duration::from_millis(100), Duration::from_secs(1), 10);
        assert_eq!(policy.ceiling_for(1), Duration::from_millis(100));
        assert_eq!(policy.ceiling_for(2), Duration::from_millis(200));
        assert_eq!(policy.ceiling_for(4), Duration::from_millis(800));
        assert_eq!(policy.ceiling_for(5), Duration::from_secs(1));
        assert_eq!(policy.ceiling_for(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_a_fifth() {
        let policy = ReconnectPolicy::new(Duration::from_millis(500), Duration::from_secs(60), 10);
        for attempt in 1..=8 {
            let ceiling = policy.ceiling_for(attempt);
            for _ in 0..50 {
                let delay = policy.delay_for(attempt);
                assert!(delay <= ceiling);
                assert!(delay >= ceiling * 4 / 5);
            }
        }
    }

    #[test]
    fn test_attempt_limit() {
        let policy = ReconnectPolicy::new(Duration::from_millis(1), Duration::from_millis(10), 2);
        assert!(policy.allows(1));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
        assert!(!ReconnectPolicy::never().allows(1));
    }

    #[test]
    fn test_zero_base_delay_never_waits() {
        let policy = ReconnectPolicy::new(Duration::ZERO, Duration::from_secs(1), 3);
        assert_eq!(policy.delay_for(3), Duration::ZERO);
    }
}
