use crate::{SchedEntry, SchedError, ThreadId, TimeQueue};
use kernel_info::config::{IDLE_SLEEP_US, SCHED_GRANULARITY_US, SCHED_QUANTA_US};
use kernel_sync::InterruptContext;
use log::trace;

/// Outcome of [`Scheduler::pick_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pick {
    /// Run `thread` until the preemption `deadline`.
    Run { thread: ThreadId, deadline: u64 },
    /// Nothing runnable; halt until `wake_at`.
    Idle { wake_at: u64 },
}

impl Pick {
    /// Absolute time the one-shot timer must fire at.
    #[inline]
    #[must_use]
    pub const fn deadline(&self) -> u64 {
        match *self {
            Self::Run { deadline, .. } => deadline,
            Self::Idle { wake_at } => wake_at,
        }
    }

    #[inline]
    #[must_use]
    pub const fn thread(&self) -> Option<ThreadId> {
        match *self {
            Self::Run { thread, .. } => Some(thread),
            Self::Idle { .. } => None,
        }
    }
}

/// Fair-share scheduler of one core.
///
/// Runnable threads are ordered by accumulated `exec_time`; the one that has
/// run least goes next. Sleeping threads are ordered by wake-up time.
///
/// `capacity` bounds the number of threads the core hosts (runnable, sleeping
/// and running together), so moving a thread between the queues never fails.
pub struct Scheduler {
    active: TimeQueue,
    waiters: TimeQueue,
    running: Option<SchedEntry>,
    capacity: usize,
    next_seq: u64,
    /// `exec_time` of the last thread picked; the least any runnable thread has run.
    min_exec_time: u64,
    ideal_exec_time: u64,
}

/// Round `t` up to the scheduling granularity.
#[inline]
const fn round_up(t: u64) -> u64 {
    t.div_ceil(SCHED_GRANULARITY_US) * SCHED_GRANULARITY_US
}

impl Scheduler {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            active: TimeQueue::with_capacity(capacity),
            waiters: TimeQueue::with_capacity(capacity),
            running: None,
            capacity,
            next_seq: 0,
            min_exec_time: 0,
            ideal_exec_time: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Threads hosted by this core.
    #[inline]
    #[must_use]
    pub fn population(&self) -> usize {
        self.active.len() + self.waiters.len() + usize::from(self.running.is_some())
    }

    #[inline]
    #[must_use]
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    #[inline]
    #[must_use]
    pub fn waiting_len(&self) -> usize {
        self.waiters.len()
    }

    /// The thread picked last, unless it slept, blocked or was removed since.
    #[inline]
    #[must_use]
    pub fn current(&self) -> Option<ThreadId> {
        self.running.map(|e| e.thread)
    }

    #[inline]
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.running.is_none()
    }

    /// Slice length computed by the last pick.
    #[inline]
    #[must_use]
    pub const fn ideal_exec_time(&self) -> u64 {
        self.ideal_exec_time
    }

    #[inline]
    #[must_use]
    pub const fn min_exec_time(&self) -> u64 {
        self.min_exec_time
    }

    #[must_use]
    pub fn contains(&self, thread: ThreadId) -> bool {
        self.current() == Some(thread)
            || self.active.contains(thread)
            || self.waiters.contains(thread)
    }

    #[inline]
    const fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn requeue_active(&mut self, entry: SchedEntry) {
        let seq = self.bump_seq();
        let pushed = self.active.insert(entry.exec_time, seq, entry);
        debug_assert!(pushed.is_ok(), "population bound exceeded");
    }

    fn requeue_waiting(&mut self, entry: SchedEntry) {
        let seq = self.bump_seq();
        let pushed = self.waiters.insert(entry.wake_time, seq, entry);
        debug_assert!(pushed.is_ok(), "population bound exceeded");
    }

    /// Charge the running thread for the time since its slice started.
    fn take_running(&mut self, now: u64) -> Option<SchedEntry> {
        let mut entry = self.running.take()?;
        entry.exec_time = entry
            .exec_time
            .saturating_add(now.saturating_sub(entry.start_time));
        Some(entry)
    }

    /// Make `entry` runnable on this core.
    ///
    /// Its `exec_time` is raised to the current minimum so a thread that
    /// slept or blocked for long cannot monopolize the core afterwards.
    ///
    /// # Errors
    /// [`SchedError::QueueFull`] if the core already hosts `capacity` threads.
    pub fn admit(&mut self, mut entry: SchedEntry) -> Result<(), SchedError> {
        if self.population() >= self.capacity {
            return Err(SchedError::QueueFull(self.capacity));
        }
        entry.exec_time = entry.exec_time.max(self.min_exec_time);
        self.requeue_active(entry);
        Ok(())
    }

    /// Admit a freshly created thread.
    ///
    /// # Errors
    /// See [`Scheduler::admit`].
    pub fn spawn(&mut self, thread: ThreadId) -> Result<(), SchedError> {
        self.admit(SchedEntry::new(thread))
    }

    /// Re-admit a thread released from a wait queue.
    ///
    /// Returns whether the core was idle, in which case the caller has to
    /// send it a wake-up IPI.
    ///
    /// # Errors
    /// See [`Scheduler::admit`].
    pub fn wake(&mut self, entry: SchedEntry) -> Result<bool, SchedError> {
        let was_idle = self.is_idle();
        self.admit(entry)?;
        Ok(was_idle)
    }

    /// Move the running thread to the waiters queue until `now + duration`.
    ///
    /// # Errors
    /// [`SchedError::NotRunning`] if no thread is running.
    pub fn sleep_current(&mut self, now: u64, duration: u64) -> Result<ThreadId, SchedError> {
        let mut entry = self.take_running(now).ok_or(SchedError::NotRunning)?;
        entry.wake_time = now.saturating_add(duration);
        let thread = entry.thread;
        self.requeue_waiting(entry);
        Ok(thread)
    }

    /// Detach the running thread so it can be parked on a wait queue.
    ///
    /// # Errors
    /// [`SchedError::NotRunning`] if no thread is running.
    pub fn block_current(&mut self, now: u64) -> Result<SchedEntry, SchedError> {
        self.take_running(now).ok_or(SchedError::NotRunning)
    }

    /// Unlink `thread` from this core, whatever state it is in.
    pub fn remove(&mut self, thread: ThreadId) -> Option<SchedEntry> {
        if self.current() == Some(thread) {
            return self.running.take();
        }
        self.active
            .remove(thread)
            .or_else(|| self.waiters.remove(thread))
    }

    /// Choose what this core runs next.
    ///
    /// 1. The running thread is charged and becomes runnable again.
    /// 2. Sleepers whose wake-up time has passed become runnable.
    /// 3. The period is `max(SCHED_QUANTA_US, n * SCHED_GRANULARITY_US)` for
    ///    `n` runnable threads, the ideal slice is `period / n`.
    /// 4. With nothing runnable the core idles until the next sleeper is due
    ///    (rounded up to the granularity) or for [`IDLE_SLEEP_US`].
    /// 5. Otherwise the thread with the lowest `exec_time` runs for
    ///    `max(ideal - exec_time, 1)`, rounded up to the granularity.
    pub fn pick_next(&mut self, _ctx: &InterruptContext, now: u64) -> Pick {
        if let Some(previous) = self.take_running(now) {
            self.requeue_active(previous);
        }

        while let Some(mut woken) = self.waiters.pop_due(now) {
            woken.exec_time = woken.exec_time.max(self.min_exec_time);
            self.requeue_active(woken);
        }

        let runnable = self.active.len() as u64;
        self.ideal_exec_time = if runnable == 0 {
            0
        } else {
            SCHED_QUANTA_US.max(SCHED_GRANULARITY_US * runnable) / runnable
        };

        let Some(mut next) = self.active.pop_front() else {
            let wake_at = self
                .waiters
                .peek_key()
                .map_or(now.saturating_add(IDLE_SLEEP_US), round_up);
            trace!("idle until {wake_at}us, {} sleeping", self.waiters.len());
            return Pick::Idle { wake_at };
        };

        self.min_exec_time = next.exec_time;
        let slice = round_up(self.ideal_exec_time.saturating_sub(next.exec_time).max(1));
        next.max_exec_time = slice;
        next.start_time = now;
        self.running = Some(next);

        Pick::Run {
            thread: next.thread,
            deadline: now.saturating_add(slice),
        }
    }
}
