use crate::{SchedEntry, ThreadId};
use alloc::collections::VecDeque;
use kernel_sync::SpinLock;

/// A blocked thread and the core it has to return to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parked {
    pub core: usize,
    pub entry: SchedEntry,
}

/// FIFO of threads blocked on some condition.
///
/// Waking only hands the entries back; re-admitting them to their core's
/// [`Scheduler`](crate::Scheduler) (and kicking that core if it idles) is
/// the caller's job, so a wait queue never takes a scheduler lock itself.
pub struct WaitQueue {
    parked: SpinLock<VecDeque<Parked>>,
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueue {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            parked: SpinLock::new(VecDeque::new()),
        }
    }

    pub fn park(&self, core: usize, entry: SchedEntry) {
        self.parked.lock_irq().push_back(Parked { core, entry });
    }

    /// Release the thread that has waited longest.
    pub fn wake_one(&self) -> Option<Parked> {
        self.parked.lock_irq().pop_front()
    }

    /// Release every waiter, oldest first.
    pub fn wake_all(&self) -> VecDeque<Parked> {
        core::mem::take(&mut *self.parked.lock_irq())
    }

    /// Take `thread` off the queue without waking the others.
    pub fn remove(&self, thread: ThreadId) -> Option<Parked> {
        let mut parked = self.parked.lock_irq();
        let at = parked.iter().position(|p| p.entry.thread == thread)?;
        parked.remove(at)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.parked.lock_irq().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parked.lock_irq().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(i: u32) -> SchedEntry {
        SchedEntry::new(ThreadId::new(i, 0))
    }

    #[test]
    fn wakes_in_fifo_order() {
        let q = WaitQueue::new();
        q.park(0, entry(1));
        q.park(1, entry(2));
        q.park(0, entry(3));

        let first = q.wake_one().unwrap();
        assert_eq!((first.core, first.entry.thread.index()), (0, 1));
        let rest: Vec<_> = q.wake_all().into_iter().map(|p| p.entry.thread.index()).collect();
        assert_eq!(rest, [2, 3]);
        assert!(q.is_empty());
        assert!(q.wake_one().is_none());
    }

    #[test]
    fn remove_leaves_others_parked() {
        let q = WaitQueue::new();
        for i in 0..3 {
            q.park(0, entry(i));
        }
        assert!(q.remove(ThreadId::new(1, 0)).is_some());
        assert!(q.remove(ThreadId::new(1, 0)).is_none());
        assert_eq!(q.len(), 2);
        assert_eq!(q.wake_one().unwrap().entry.thread.index(), 0);
    }
}
