//! Capacity-limited timer heap ordered by fire time.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use crate::core::error::PushError;

/// Default bound on scheduled entries.
pub const DEFAULT_TIMER_CAPACITY: usize = 65_536;

/// Wrapper making entries orderable by fire time (earliest first), FIFO on ties.
struct TimerEntry<T> {
    fire_at: Instant,
    seq: u64,
    key: u64,
    item: T,
}

impl<T> PartialEq for TimerEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl<T> Eq for TimerEntry<T> {}

impl<T> PartialOrd for TimerEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for TimerEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap.
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap of timed entries. `push` is O(log n), `pop_due` O(log n).
pub struct TimerHeap<T> {
    capacity: usize,
    next_seq: u64,
    entries: BinaryHeap<TimerEntry<T>>,
}

impl<T> TimerHeap<T> {
    /// Create a heap holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_seq: 0,
            entries: BinaryHeap::with_capacity(capacity.min(1024)),
        }
    }

    /// Insert `item` to fire at `fire_at`. `key` identifies the entry for
    /// [`remove`](Self::remove) and survives re-insertion.
    ///
    /// # Errors
    ///
    /// Hands the item back as `PushError::Full` at capacity.
    pub fn push(&mut self, fire_at: Instant, key: u64, item: T) -> Result<(), PushError<T>> {
        if self.entries.len() >= self.capacity {
            return Err(PushError::Full(item));
        }
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.entries.push(TimerEntry {
            fire_at,
            seq,
            key,
            item,
        });
        Ok(())
    }

    /// Earliest fire time, if any entry is pending.
    pub fn next_fire_time(&self) -> Option<Instant> {
        self.entries.peek().map(|entry| entry.fire_at)
    }

    /// Pop the earliest entry if it is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<(Instant, u64, T)> {
        if self.entries.peek()?.fire_at > now {
            return None;
        }
        self.entries
            .pop()
            .map(|entry| (entry.fire_at, entry.key, entry.item))
    }

    /// Remove the entry with `key`, wherever it sits. O(n).
    pub fn remove(&mut self, key: u64) -> Option<T> {
        let mut removed = None;
        let kept: Vec<_> = self
            .entries
            .drain()
            .filter_map(|entry| {
                if removed.is_none() && entry.key == key {
                    removed = Some(entry.item);
                    None
                } else {
                    Some(entry)
                }
            })
            .collect();
        self.entries = kept.into();
        removed
    }

    /// Remove every entry, earliest first.
    pub fn drain_sorted(&mut self) -> Vec<(u64, T)> {
        let mut out = Vec::with_capacity(self.entries.len());
        while let Some(entry) = self.entries.pop() {
            out.push((entry.key, entry.item));
        }
        out
    }

    /// Configured bound.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for TimerHeap<T> {
    fn default() -> Self {
        Self::new(DEFAULT_TIMER_CAPACITY)
    }
}
