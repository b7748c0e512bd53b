//! Timeout flush scheduler: fires a flush for any queue key whose batch has
//! sat open past its timeout, even if it never filled by size. The catch-up
//! rule (never schedule into the past) keeps a scheduler that fell behind
//! from flooding the sink with a burst of immediately-due timers once it
//! catches up.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use crate::model::QueueKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScheduledFlush {
    due: Instant,
    key: QueueKey,
}

impl Ord for ScheduledFlush {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due.cmp(&other.due)
    }
}

impl PartialOrd for ScheduledFlush {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Single-threaded min-heap timer keyed by [`QueueKey`]. One entry per key
/// is live at a time; rescheduling a key that already has an entry replaces
/// it lazily (the stale entry is discarded when it surfaces).
pub struct TimeoutScheduler {
    heap: BinaryHeap<Reverse<ScheduledFlush>>,
    period: std::collections::HashMap<QueueKey, Duration>,
}

impl Default for TimeoutScheduler {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            period: std::collections::HashMap::new(),
        }
    }
}

impl TimeoutScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `key` to fire after `period`, starting from `now`.
    pub fn schedule(&mut self, key: QueueKey, period: Duration, now: Instant) {
        self.period.insert(key, period);
        self.heap.push(Reverse(ScheduledFlush { due: now + period, key }));
    }

    /// Drains every key due at or before `now`. For each drained key that is
    /// still registered, immediately reschedules it using the catch-up rule:
    /// the next fire time is the smallest `now + k * period` for `k >= 1`
    /// strictly in the future, so a scheduler that stalled for a while does
    /// not emit a burst of back-to-back fires once it resumes polling.
    pub fn drain_due(&mut self, now: Instant) -> Vec<QueueKey> {
        let mut fired = Vec::new();
        while let Some(Reverse(top)) = self.heap.peek() {
            if top.due > now {
                break;
            }
            let Reverse(entry) = self.heap.pop().unwrap();
            if let Some(&period) = self.period.get(&entry.key) {
                fired.push(entry.key);
                let elapsed_periods = ((now - entry.due).as_nanos() / period.as_nanos().max(1)) + 1;
                let next_due = entry.due + period * (elapsed_periods as u32);
                self.heap.push(Reverse(ScheduledFlush { due: next_due, key: entry.key }));
            }
        }
        fired
    }

    /// Stops scheduling further fires for `key`. Any already-queued entry
    /// for it becomes inert and is dropped the next time it surfaces.
    pub fn cancel(&mut self, key: QueueKey) {
        self.period.remove(&key);
    }

    pub fn is_scheduled(&self, key: QueueKey) -> bool {
        self.period.contains_key(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_only_due_entries() {
        let mut scheduler = TimeoutScheduler::new();
        let now = Instant::now();
        let a = QueueKey(1);
        let b = QueueKey(2);
        scheduler.schedule(a, Duration::from_millis(10), now);
        scheduler.schedule(b, Duration::from_secs(10), now);

        let fired = scheduler.drain_due(now + Duration::from_millis(20));
        assert_eq!(fired, vec![a]);
    }

    #[test]
    fn catch_up_does_not_burst_fire() {
        let mut scheduler = TimeoutScheduler::new();
        let now = Instant::now();
        let key = QueueKey(1);
        scheduler.schedule(key, Duration::from_millis(10), now);

        // Simulate the scheduler stalling for a long time before its first check.
        let much_later = now + Duration::from_secs(5);
        let fired = scheduler.drain_due(much_later);
        assert_eq!(fired, vec![key]);

        // Immediately checking again must not fire a second time.
        let fired_again = scheduler.drain_due(much_later);
        assert!(fired_again.is_empty());
    }

    #[test]
    fn cancelled_key_does_not_fire() {
        let mut scheduler = TimeoutScheduler::new();
        let now = Instant::now();
        let key = QueueKey(1);
        scheduler.schedule(key, Duration::from_millis(10), now);
        scheduler.cancel(key);
        let fired = scheduler.drain_due(now + Duration::from_secs(1));
        assert!(fired.is_empty());
    }
}
