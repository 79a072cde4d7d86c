//! Clocks and the exporter timer queue.
//!
//! Timers never run on their own: whoever drives the exporter calls
//! `Exporter::process_timers`, which pops every expired entry under the lock.
//! Tests substitute [`ManualClock`] to step time deterministically.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::types::{CollectorId, CollectorSessionId, ConnectionId};

/// Source of monotonic time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    /// Time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// What a timer does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// No acknowledgment within the window timeout.
    WindowAck(CollectorSessionId),
    StatisticsReport,
    Autoconnect,
    /// Time to send a KEEP_ALIVE.
    KeepAliveOut(CollectorId, ConnectionId),
    /// Nothing heard from the peer for too long.
    KeepAliveIn(CollectorId, ConnectionId),
}

#[derive(Debug, Clone)]
struct Timer {
    kind: TimerKind,
    deadline: Instant,
    period: Option<Duration>,
}

/// One-shot and periodic timers ordered by id.
#[derive(Debug, Default)]
pub struct TimerQueue {
    next_id: u64,
    timers: BTreeMap<TimerId, Timer>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, timer: Timer) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.timers.insert(id, timer);
        id
    }

    /// Arms a one-shot timer.
    pub fn schedule(&mut self, kind: TimerKind, deadline: Instant) -> TimerId {
        self.insert(Timer {
            kind,
            deadline,
            period: None,
        })
    }

    /// Arms a timer that fires every `period`, first at `now + period`.
    pub fn schedule_periodic(&mut self, kind: TimerKind, now: Instant, period: Duration) -> TimerId {
        self.insert(Timer {
            kind,
            deadline: now + period,
            period: Some(period),
        })
    }

    /// Cancels a timer. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.timers.remove(&id).is_some()
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.timers.contains_key(&id)
    }

    pub fn deadline(&self, id: TimerId) -> Option<Instant> {
        self.timers.get(&id).map(|t| t.deadline)
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.values().map(|t| t.deadline).min()
    }

    /// Removes expired one-shot timers, re-arms expired periodic ones and
    /// returns both in deadline order.
    pub fn expire(&mut self, now: Instant) -> Vec<(TimerId, TimerKind)> {
        let mut fired: Vec<(Instant, TimerId, TimerKind)> = Vec::new();
        let mut finished = Vec::new();
        for (id, timer) in self.timers.iter_mut() {
            if timer.deadline > now {
                continue;
            }
            fired.push((timer.deadline, *id, timer.kind));
            match timer.period {
                // A periodic timer that fell behind fires once and catches up.
                Some(period) => {
                    while timer.deadline <= now {
                        timer.deadline += period;
                    }
                }
                None => finished.push(*id),
            }
        }
        for id in finished {
            self.timers.remove(&id);
        }
        fired.sort_by_key(|(deadline, id, _)| (*deadline, *id));
        fired.into_iter().map(|(_, id, kind)| (id, kind)).collect()
    }

    pub fn clear(&mut self) {
        self.timers.clear();
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new();
        let t0 = clock.now();
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now() - t0, Duration::from_millis(250));
        assert_eq!(clock.elapsed(), Duration::from_millis(250));
    }

    #[test]
    fn test_one_shot_fires_once() {
        let now = Instant::now();
        let mut timers = TimerQueue::new();
        let id = timers.schedule(TimerKind::Autoconnect, now + Duration::from_millis(100));

        assert!(timers.expire(now + Duration::from_millis(99)).is_empty());
        assert_eq!(
            timers.expire(now + Duration::from_millis(100)),
            vec![(id, TimerKind::Autoconnect)]
        );
        assert!(!timers.is_pending(id));
        assert!(timers.expire(now + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn test_periodic_rearms() {
        let now = Instant::now();
        let mut timers = TimerQueue::new();
        let id = timers.schedule_periodic(TimerKind::StatisticsReport, now, Duration::from_secs(1));

        assert_eq!(timers.expire(now + Duration::from_millis(1000)).len(), 1);
        assert_eq!(timers.deadline(id), Some(now + Duration::from_secs(2)));
        // Several missed periods collapse into one firing.
        assert_eq!(timers.expire(now + Duration::from_millis(5500)).len(), 1);
        assert_eq!(timers.deadline(id), Some(now + Duration::from_secs(6)));
    }

    #[test]
    fn test_expire_in_deadline_order() {
        let now = Instant::now();
        let mut timers = TimerQueue::new();
        let late = timers.schedule(TimerKind::Autoconnect, now + Duration::from_millis(20));
        let early = timers.schedule(TimerKind::StatisticsReport, now + Duration::from_millis(10));

        let fired: Vec<TimerId> = timers
            .expire(now + Duration::from_millis(30))
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(fired, vec![early, late]);
    }
}
