use crate::{SchedError, ThreadId};
use alloc::collections::VecDeque;

/// Scheduling state of one thread.
///
/// The entry travels by value between the active queue, the waiters queue,
/// the running slot of a core and wait queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedEntry {
    pub thread: ThreadId,
    /// CPU time consumed so far.
    pub exec_time: u64,
    /// Length of the slice granted by the last pick.
    pub max_exec_time: u64,
    /// When the current slice started.
    pub start_time: u64,
    /// Absolute wake-up time while sleeping.
    pub wake_time: u64,
}

impl SchedEntry {
    #[must_use]
    pub const fn new(thread: ThreadId) -> Self {
        Self {
            thread,
            exec_time: 0,
            max_exec_time: 0,
            start_time: 0,
            wake_time: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    key: u64,
    seq: u64,
    entry: SchedEntry,
}

/// Bounded queue kept sorted by `(key, seq)`.
///
/// Insertion shifts the tail to make room, so the head is always the
/// smallest key; equal keys leave in insertion order when callers pass a
/// monotonically increasing `seq`. Storage is reserved up front and never
/// grows, which keeps inserts allocation free.
pub struct TimeQueue {
    slots: VecDeque<Slot>,
    capacity: usize,
}

impl TimeQueue {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Insert `entry` behind every slot with a smaller or equal `(key, seq)`.
    ///
    /// # Errors
    /// [`SchedError::QueueFull`] when the queue holds `capacity` entries.
    pub fn insert(&mut self, key: u64, seq: u64, entry: SchedEntry) -> Result<(), SchedError> {
        if self.slots.len() >= self.capacity {
            return Err(SchedError::QueueFull(self.capacity));
        }
        let at = self
            .slots
            .partition_point(|s| (s.key, s.seq) <= (key, seq));
        self.slots.insert(at, Slot { key, seq, entry });
        Ok(())
    }

    /// Smallest key in the queue.
    #[inline]
    #[must_use]
    pub fn peek_key(&self) -> Option<u64> {
        self.slots.front().map(|s| s.key)
    }

    #[inline]
    pub fn pop_front(&mut self) -> Option<SchedEntry> {
        self.slots.pop_front().map(|s| s.entry)
    }

    /// Pop the head if its key is `<= limit`.
    #[inline]
    pub fn pop_due(&mut self, limit: u64) -> Option<SchedEntry> {
        if self.peek_key()? <= limit {
            self.pop_front()
        } else {
            None
        }
    }

    /// Unlink the entry of `thread`, wherever it sits.
    pub fn remove(&mut self, thread: ThreadId) -> Option<SchedEntry> {
        let at = self.slots.iter().position(|s| s.entry.thread == thread)?;
        self.slots.remove(at).map(|s| s.entry)
    }

    #[must_use]
    pub fn contains(&self, thread: ThreadId) -> bool {
        self.slots.iter().any(|s| s.entry.thread == thread)
    }

    /// Entries from head to tail.
    pub fn iter(&self) -> impl Iterator<Item = &SchedEntry> {
        self.slots.iter().map(|s| &s.entry)
    }
}
