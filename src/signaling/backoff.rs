use std::time::Duration;

use crate::config::SignalingConfig;

/// Bounded exponential reconnect schedule
///
/// Delays double from `initial` until they reach `max` (1s, 2s, 4s, 8s,
/// 16s, 30s, 30s, ... with the defaults). `reset` starts over.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            attempt: 0,
        }
    }

    pub fn from_config(config: &SignalingConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }

    /// Delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32 << self.attempt.min(20);
        let delay = self.initial.saturating_mul(factor).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts handed out since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&SignalingConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn test_monotonic_up_to_cap() {
        for (initial, max) in [(100, 750), (1_000, 30_000), (250, 250), (3, 10_000)] {
            let mut backoff =
                Backoff::new(Duration::from_millis(initial), Duration::from_millis(max));
            let mut previous = Duration::ZERO;
            for _ in 0..64 {
                let delay = backoff.next_delay();
                assert!(delay >= previous, "delay went down: {:?} < {:?}", delay, previous);
                assert!(delay <= Duration::from_millis(max));
                previous = delay;
            }
            assert_eq!(previous, Duration::from_millis(max));
        }
    }

    #[test]
    fn test_reset_returns_to_initial() {
        let mut backoff = Backoff::default();
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempts(), 3);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }
}
