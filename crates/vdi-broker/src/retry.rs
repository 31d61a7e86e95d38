//! Unattended reconnection policy.
//!
//! Pure backoff bookkeeping — the policy owns no network resources and
//! only tells the front end how long to wait before re-invoking
//! `connect` after a transport failure. Interactive sessions never
//! consult it.

use std::time::Duration;

/// Bounded exponential backoff with a run-once escape hatch.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    initial: Duration,
    maximum: Duration,
    current: Duration,
    attempts: u32,
    once: bool,
}

impl RetryPolicy {
    pub fn new(initial: Duration, maximum: Duration, once: bool) -> Self {
        Self {
            initial,
            maximum: maximum.max(initial),
            current: initial,
            attempts: 0,
            once,
        }
    }

    /// Build from configured periods in seconds.
    pub fn from_periods(initial_secs: u64, maximum_secs: u64, once: bool) -> Self {
        Self::new(
            Duration::from_secs(initial_secs),
            Duration::from_secs(maximum_secs),
            once,
        )
    }

    /// Delay before the next reconnection attempt, or `None` when the
    /// policy is exhausted (`once` mode never retries).
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.once {
            return None;
        }
        let delay = self.current;
        self.attempts += 1;
        self.current = (self.current * 2).min(self.maximum);
        Some(delay)
    }

    /// A connection authenticated successfully; reset the backoff.
    pub fn record_success(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    /// Failed attempts since the last success.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_maximum() {
        let mut p = RetryPolicy::from_periods(30, 240, false);
        let delays: Vec<u64> = (0..5)
            .map(|_| p.next_delay().unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![30, 60, 120, 240, 240]);
        assert_eq!(p.attempts(), 5);
    }

    #[test]
    fn success_resets_backoff() {
        let mut p = RetryPolicy::from_periods(30, 240, false);
        p.next_delay();
        p.next_delay();
        p.next_delay();
        p.record_success();
        assert_eq!(p.next_delay().unwrap().as_secs(), 30);
        assert_eq!(p.attempts(), 1);
    }

    #[test]
    fn once_mode_never_retries() {
        let mut p = RetryPolicy::from_periods(30, 240, true);
        assert_eq!(p.next_delay(), None);
    }

    #[test]
    fn maximum_is_floored_at_initial() {
        let mut p = RetryPolicy::from_periods(60, 30, false);
        assert_eq!(p.next_delay().unwrap().as_secs(), 60);
        assert_eq!(p.next_delay().unwrap().as_secs(), 60);
    }
}
