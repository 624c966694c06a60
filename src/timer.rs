use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use crate::error::Error;

/// A stable 64-bit identifier for a timer entry, unique for the loop's
/// lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Application-supplied callback. Rather than a pointer triple (function
/// pointer + context pointer + opaque data), idiomatic Rust collapses this
/// to a boxed closure that already carries its own
/// context.
pub type TimerCallback = Box<dyn FnMut(TimerId)>;

/// Rule for computing a cyclic timer's next fire time after it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPolicy {
    /// next = scheduled_time + interval. Catches up by firing back-to-back
    /// after a lag, visiting every scheduled slot exactly once.
    OnceInCurrent,
    /// next = fire_time + interval. Skips missed slots, keeping cadence
    /// relative to real elapsed time.
    CurrentTime,
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Cyclic {
        interval: Duration,
        base_time: Option<Instant>,
        policy: TimerPolicy,
    },
    OneShot,
}

struct Entry {
    kind: Kind,
    fire_time: Instant,
    sequence: u64,
    callback: TimerCallback,
}

/// Ordered store of pending cyclic/one-shot timer entries, keyed by
/// `(fire_time, insertion_sequence)` so multiple timers due at the same
/// monotonic instant still have a total, insertion-stable order. A reverse
/// `TimerId -> fire_time` index gives
/// `modifyCyclic`/`removeCyclic` O(log n) access without needing arbitrary
/// removal from a `BinaryHeap`.
#[derive(Default)]
pub struct TimerHeap {
    by_time: BTreeMap<(Instant, u64), TimerId>,
    entries: HashMap<TimerId, Entry>,
    next_id: u64,
    next_sequence: u64,
}

impl TimerHeap {
    pub fn new() -> Self {
        TimerHeap {
            by_time: BTreeMap::new(),
            entries: HashMap::new(),
            next_id: 1,
            next_sequence: 0,
        }
    }

    fn alloc_id(&mut self) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        id
    }

    fn alloc_sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    fn aligned_first_fire(now: Instant, interval: Duration, base_time: Option<Instant>) -> Instant {
        let base_time = match base_time {
            Some(b) => b,
            None => return now,
        };
        if interval.is_zero() || base_time >= now {
            return base_time.max(now);
        }
        // Smallest base_time + k*interval >= now.
        let elapsed = now.duration_since(base_time);
        let interval_nanos = interval.as_nanos().max(1);
        let elapsed_nanos = elapsed.as_nanos();
        let k = elapsed_nanos.div_ceil(interval_nanos);
        base_time + interval * (k as u32)
    }

    /// Adds a cyclic callback. `interval` must be non-zero. If `base_time` is
    /// supplied, the phase is aligned so the first fire is the smallest
    /// `base_time + k*interval >= now`.
    pub fn add_cyclic(
        &mut self,
        now: Instant,
        interval: Duration,
        base_time: Option<Instant>,
        policy: TimerPolicy,
        callback: TimerCallback,
    ) -> Result<TimerId, Error> {
        if interval.is_zero() {
            return Err(Error::InvalidArgument(
                "cyclic timer interval must be > 0".into(),
            ));
        }

        let fire_time = Self::aligned_first_fire(now, interval, base_time);
        let id = self.alloc_id();
        let sequence = self.alloc_sequence();

        self.by_time.insert((fire_time, sequence), id);
        self.entries.insert(
            id,
            Entry {
                kind: Kind::Cyclic {
                    interval,
                    base_time,
                    policy,
                },
                fire_time,
                sequence,
                callback,
            },
        );

        Ok(id)
    }

    /// Adds a one-shot callback, fired exactly once at `when` then removed.
    pub fn add_timed(&mut self, when: Instant, callback: TimerCallback) -> TimerId {
        let id = self.alloc_id();
        let sequence = self.alloc_sequence();

        self.by_time.insert((when, sequence), id);
        self.entries.insert(
            id,
            Entry {
                kind: Kind::OneShot,
                fire_time: when,
                sequence,
                callback,
            },
        );

        id
    }

    /// Recomputes `id`'s next-fire time as if it were newly added, then
    /// reinserts it in heap order. No-op (with error) if `id` is unknown or
    /// not cyclic.
    pub fn modify_cyclic(
        &mut self,
        now: Instant,
        id: TimerId,
        interval: Duration,
        base_time: Option<Instant>,
        policy: TimerPolicy,
    ) -> Result<(), Error> {
        if interval.is_zero() {
            return Err(Error::InvalidArgument(
                "cyclic timer interval must be > 0".into(),
            ));
        }

        let entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("timer {:?}", id)))?;

        if !matches!(entry.kind, Kind::Cyclic { .. }) {
            return Err(Error::InvalidArgument(format!(
                "timer {:?} is not cyclic",
                id
            )));
        }

        self.by_time.remove(&(entry.fire_time, entry.sequence));

        let fire_time = Self::aligned_first_fire(now, interval, base_time);
        let sequence = self.alloc_sequence();

        entry.kind = Kind::Cyclic {
            interval,
            base_time,
            policy,
        };
        entry.fire_time = fire_time;
        entry.sequence = sequence;

        self.by_time.insert((fire_time, sequence), id);

        Ok(())
    }

    /// Removes a cyclic (or one-shot) timer. Idempotent: unknown ids are a
    /// no-op, not an error.
    pub fn remove(&mut self, id: TimerId) {
        if let Some(entry) = self.entries.remove(&id) {
            self.by_time.remove(&(entry.fire_time, entry.sequence));
        }
    }

    /// The smallest next-fire time across every pending entry, or `None` if
    /// the heap is empty ("far future").
    pub fn next_time(&self) -> Option<Instant> {
        self.by_time.keys().next().map(|(t, _)| *t)
    }

    /// Fires every timer whose fire time is `<= now`, in stable
    /// (fire_time, insertion order) order, recomputing and reinserting
    /// cyclic entries per their policy. Returns the number of timers fired.
    pub fn fire_due(&mut self, now: Instant) -> usize {
        let due: Vec<(Instant, u64)> = self
            .by_time
            .range(..=(now, u64::MAX))
            .map(|(k, _)| *k)
            .collect();

        let mut fired = 0;

        for key in due {
            let id = match self.by_time.remove(&key) {
                Some(id) => id,
                None => continue,
            };

            let mut entry = match self.entries.remove(&id) {
                Some(entry) => entry,
                None => continue,
            };

            // A panicking timer callback must not take down the dispatch
            // cycle or strand the remaining due timers: catch at the
            // dispatcher boundary, log, and continue.
            if catch_unwind(AssertUnwindSafe(|| (entry.callback)(id))).is_err() {
                log::error!("timer {:?} callback panicked", id);
            }
            fired += 1;

            if let Kind::Cyclic {
                interval,
                base_time: _,
                policy,
            } = entry.kind
            {
                let next_fire = match policy {
                    TimerPolicy::OnceInCurrent => entry.fire_time + interval,
                    TimerPolicy::CurrentTime => now + interval,
                };

                let sequence = self.alloc_sequence();
                entry.fire_time = next_fire;
                entry.sequence = sequence;

                self.by_time.insert((next_fire, sequence), id);
                self.entries.insert(id, entry);
            }
        }

        fired
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn removing_unknown_timer_is_noop() {
        let mut heap = TimerHeap::new();
        heap.remove(TimerId(9999));
        assert!(heap.is_empty());
    }

    #[test]
    fn one_shot_fires_once_then_is_gone() {
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        let fires = Rc::new(RefCell::new(0));

        {
            let fires = fires.clone();
            heap.add_timed(now, Box::new(move |_| *fires.borrow_mut() += 1));
        }

        assert_eq!(heap.fire_due(now), 1);
        assert_eq!(*fires.borrow(), 1);
        assert!(heap.is_empty());

        // Firing again (nothing pending) is a no-op.
        assert_eq!(heap.fire_due(now + Duration::from_secs(1)), 0);
    }

    #[test]
    fn cyclic_reinserts_after_firing() {
        let mut heap = TimerHeap::new();
        let now = Instant::now();

        let id = heap
            .add_cyclic(
                now,
                Duration::from_millis(50),
                None,
                TimerPolicy::CurrentTime,
                Box::new(|_| {}),
            )
            .unwrap();

        assert_eq!(heap.len(), 1);
        let first = heap.next_time().unwrap();
        heap.fire_due(first);
        assert_eq!(heap.len(), 1);
        assert!(heap.next_time().unwrap() > first);

        heap.remove(id);
        assert!(heap.is_empty());
    }

    #[test]
    fn zero_interval_is_rejected() {
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        let result = heap.add_cyclic(
            now,
            Duration::ZERO,
            None,
            TimerPolicy::OnceInCurrent,
            Box::new(|_| {}),
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn once_in_current_catches_up_through_missed_slots() {
        // Scenario 4: interval 50ms, base_time = epoch (t=0), first fire at
        // wall time 120ms lands on 150ms; after a 500ms gap OnceInCurrent
        // must visit every missed scheduled slot in order, while
        // CurrentTime skips straight to now + interval.
        let epoch = Instant::now();
        let interval = Duration::from_millis(50);

        let mut once_in_current = TimerHeap::new();
        let mut fire_log = Vec::new();

        let t_120 = epoch + Duration::from_millis(120);
        let id = once_in_current
            .add_cyclic(t_120, interval, Some(epoch), TimerPolicy::OnceInCurrent, Box::new(|_| {}))
            .unwrap();

        let first_fire = once_in_current.next_time().unwrap();
        assert_eq!(first_fire, epoch + Duration::from_millis(150));

        // Jump 500ms past the first scheduled fire and drain every slot
        // that has become due, one fire_due call per scheduled slot
        // (mirroring how the dispatch loop calls fire_due once per cycle).
        let t_gap = first_fire + Duration::from_millis(500);
        let mut now = first_fire;
        while let Some(next) = once_in_current.next_time() {
            if next > t_gap {
                break;
            }
            fire_log.push(next);
            now = next;
            once_in_current.fire_due(now);
        }

        // 150, 200, 250, ..., every 50ms slot up to and including 650ms is
        // visited once in order ("guarantees each scheduled slot is
        // visited once").
        assert_eq!(fire_log.first().copied(), Some(t_120 + Duration::from_millis(30)));
        for pair in fire_log.windows(2) {
            assert_eq!(pair[1] - pair[0], interval);
        }
        once_in_current.remove(id);

        let mut current_time = TimerHeap::new();
        let id2 = current_time
            .add_cyclic(t_120, interval, Some(epoch), TimerPolicy::CurrentTime, Box::new(|_| {}))
            .unwrap();
        let first_fire2 = current_time.next_time().unwrap();
        current_time.fire_due(t_gap);
        // CurrentTime reschedules from the actual fire time, not the
        // scheduled slot, so after a gap it lands at t_gap + interval
        // rather than replaying every missed slot.
        assert_eq!(current_time.next_time().unwrap(), t_gap + interval);
        assert!(first_fire2 < t_gap);
        current_time.remove(id2);
    }
}
