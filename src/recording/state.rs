use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    Inactive,
    Recording,
    Paused,
}

impl Default for RecordingState {
    fn default() -> Self {
        RecordingState::Inactive
    }
}

/// Recorded time: wall clock since start minus every paused interval
#[derive(Debug, Clone, Default)]
pub struct DurationClock {
    started: Option<Instant>,
    paused_total: Duration,
    paused_since: Option<Instant>,
    /// Set by `stop`, the clock no longer moves afterwards
    frozen: Option<Duration>,
}

impl DurationClock {
    pub fn start(&mut self, now: Instant) {
        *self = Self {
            started: Some(now),
            ..Self::default()
        };
    }

    pub fn pause(&mut self, now: Instant) {
        if self.paused_since.is_none() && self.frozen.is_none() {
            self.paused_since = Some(now);
        }
    }

    pub fn resume(&mut self, now: Instant) {
        if let Some(since) = self.paused_since.take() {
            self.paused_total += now.saturating_duration_since(since);
        }
    }

    /// Freeze the clock and return the final duration
    pub fn stop(&mut self, now: Instant) -> Duration {
        let total = self.elapsed_at(now);
        self.frozen = Some(total);
        total
    }

    pub fn elapsed_at(&self, now: Instant) -> Duration {
        if let Some(frozen) = self.frozen {
            return frozen;
        }
        let Some(started) = self.started else {
            return Duration::ZERO;
        };

        // An open pause counts up to its start only
        let end = self.paused_since.unwrap_or(now);
        end.saturating_duration_since(started)
            .saturating_sub(self.paused_total)
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed_at(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paused_intervals_excluded() {
        let t0 = Instant::now();
        let ms = Duration::from_millis;
        let mut clock = DurationClock::default();

        clock.start(t0);
        assert_eq!(clock.elapsed_at(t0 + ms(400)), ms(400));

        clock.pause(t0 + ms(1_000));
        assert_eq!(clock.elapsed_at(t0 + ms(1_700)), ms(1_000));

        clock.resume(t0 + ms(1_500));
        clock.pause(t0 + ms(2_000));
        clock.resume(t0 + ms(2_250));

        assert_eq!(clock.stop(t0 + ms(3_000)), ms(2_250));
        assert_eq!(clock.elapsed_at(t0 + ms(9_000)), ms(2_250));
    }

    #[test]
    fn test_unstarted_clock_is_zero() {
        let clock = DurationClock::default();
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }
}
