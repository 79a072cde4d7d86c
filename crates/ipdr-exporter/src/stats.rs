//! Record counters and interval rates.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Point-in-time counter values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub transmitted: u64,
    pub acknowledged: u64,
    pub enqueued: u64,
    pub lost: u64,
}

/// Records per second over the last reporting interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rates {
    pub transmitted: u64,
    pub acknowledged: u64,
    pub enqueued: u64,
    pub lost: u64,
}

/// Counters plus the snapshot taken at the previous report.
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    pub(crate) counters: Counters,
    previous: Counters,
    previous_at: Option<Instant>,
}

/// Rate over `elapsed_ms` in integer arithmetic; zero when no time elapsed.
fn rate(current: u64, previous: u64, elapsed_ms: u64) -> u64 {
    current
        .saturating_sub(previous)
        .saturating_mul(1000)
        .checked_div(elapsed_ms)
        .unwrap_or(0)
}

impl Statistics {
    pub fn counters(&self) -> Counters {
        self.counters
    }

    /// Computes rates since the previous snapshot without moving it.
    pub fn rates(&self, now: Instant) -> Rates {
        let elapsed_ms = self
            .previous_at
            .map(|at| now.saturating_duration_since(at).as_millis() as u64)
            .unwrap_or(0);
        let c = &self.counters;
        let p = &self.previous;
        Rates {
            transmitted: rate(c.transmitted, p.transmitted, elapsed_ms),
            acknowledged: rate(c.acknowledged, p.acknowledged, elapsed_ms),
            enqueued: rate(c.enqueued, p.enqueued, elapsed_ms),
            lost: rate(c.lost, p.lost, elapsed_ms),
        }
    }

    /// Returns the interval rates and starts a new interval at `now`.
    pub(crate) fn roll(&mut self, now: Instant) -> Rates {
        let rates = self.rates(now);
        self.previous = self.counters;
        self.previous_at = Some(now);
        rates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_zero_elapsed_gives_zero_rate() {
        let now = Instant::now();
        let mut stats = Statistics::default();
        stats.roll(now);
        stats.counters.transmitted = 100;
        assert_eq!(stats.rates(now).transmitted, 0);
    }

    #[test]
    fn test_rate_over_interval() {
        let start = Instant::now();
        let mut stats = Statistics::default();
        stats.roll(start);
        stats.counters.transmitted = 500;
        stats.counters.acknowledged = 250;

        let rates = stats.roll(start + Duration::from_millis(2000));
        assert_eq!(rates.transmitted, 250);
        assert_eq!(rates.acknowledged, 125);

        stats.counters.transmitted = 600;
        let rates = stats.rates(start + Duration::from_millis(3000));
        assert_eq!(rates.transmitted, 100);
    }

    #[test]
    fn test_first_interval_without_snapshot() {
        let mut stats = Statistics::default();
        stats.counters.enqueued = 10;
        assert_eq!(stats.rates(Instant::now()), Rates::default());
    }
}
