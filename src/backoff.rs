//! Reconnect backoff policy shared by both links.

use std::time::Duration;

/// Tiered reconnect delay as a pure function of the consecutive-failure count.
///
/// Tiers: attempts 0-2 wait 3s, 3-5 wait 6s, 6-9 wait 60s, 10+ wait an hour.
pub fn delay_for_attempt(attempt: u32) -> Duration {
    let millis = match attempt {
        0..=2 => 3_000,
        3..=5 => 6_000,
        6..=9 => 60_000,
        _ => 3_600_000,
    };
    Duration::from_millis(millis)
}

/// Per-link attempt counter with tiered delays.
///
/// The counter is monotonic since the last successful connect and resets to
/// zero only on success.
#[derive(Debug, Default)]
pub struct ReconnectPolicy {
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay to wait before the next attempt, then bump the counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = delay_for_attempt(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Reset after a successful connect.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_tiers() {
        for attempt in 0..3 {
            assert_eq!(delay_for_attempt(attempt), Duration::from_millis(3_000));
        }
        for attempt in 3..6 {
            assert_eq!(delay_for_attempt(attempt), Duration::from_millis(6_000));
        }
        for attempt in 6..10 {
            assert_eq!(delay_for_attempt(attempt), Duration::from_millis(60_000));
        }
        assert_eq!(delay_for_attempt(10), Duration::from_millis(3_600_000));
        assert_eq!(delay_for_attempt(500), Duration::from_millis(3_600_000));
    }

    #[test]
    fn test_policy_counts_and_resets() {
        let mut policy = ReconnectPolicy::new();
        assert_eq!(policy.next_delay(), Duration::from_millis(3_000));
        assert_eq!(policy.next_delay(), Duration::from_millis(3_000));
        assert_eq!(policy.next_delay(), Duration::from_millis(3_000));
        assert_eq!(policy.next_delay(), Duration::from_millis(6_000));
        assert_eq!(policy.attempts(), 4);

        policy.reset();
        assert_eq!(policy.attempts(), 0);
        assert_eq!(policy.next_delay(), Duration::from_millis(3_000));
    }
}
