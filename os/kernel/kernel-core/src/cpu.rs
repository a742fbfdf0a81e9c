use core::sync::atomic::{AtomicU64, Ordering};
use kernel_sched::{Scheduler, ThreadId};
use kernel_sync::SpinLock;

/// Register file of a preempted thread, as pushed by the interrupt stubs.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuState {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl CpuState {
    /// Interrupts enabled, reserved bit 1 set.
    pub const RFLAGS_IF: u64 = 0x202;

    /// Initial state of a thread entering at `rip` with stack `rsp`.
    #[must_use]
    pub const fn entry(rip: u64, rsp: u64, cs: u64, ss: u64) -> Self {
        Self {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip,
            cs,
            rflags: Self::RFLAGS_IF,
            rsp,
            ss,
        }
    }
}

const _: () = assert!(size_of::<CpuState>() == 20 * 8);

/// Per-core kernel state.
#[repr(C, align(64))] // one core's record never shares a cache line
pub struct PerCpu {
    core_id: usize,
    lapic_id: u32,
    pub(crate) sched: SpinLock<Scheduler>,
    /// [`ThreadId::as_u64`] of the running thread, 0 when idle.
    current: AtomicU64,
    ticks: AtomicU64,
}

impl PerCpu {
    #[must_use]
    pub fn new(core_id: usize, lapic_id: u32, run_queue_capacity: usize) -> Self {
        Self {
            core_id,
            lapic_id,
            sched: SpinLock::new(Scheduler::new(run_queue_capacity)),
            current: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub const fn core_id(&self) -> usize {
        self.core_id
    }

    #[inline]
    #[must_use]
    pub const fn lapic_id(&self) -> u32 {
        self.lapic_id
    }

    /// The thread the core is running, as of its last timer interrupt.
    #[must_use]
    pub fn current(&self) -> Option<ThreadId> {
        match self.current.load(Ordering::Acquire) {
            0 => None,
            raw => Some(ThreadId::from_u64(raw)),
        }
    }

    pub(crate) fn set_current(&self, thread: Option<ThreadId>) {
        self.current
            .store(thread.map_or(0, ThreadId::as_u64), Ordering::Release);
    }

    /// Timer interrupts handled by this core.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub(crate) fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Threads hosted by the core.
    #[must_use]
    pub fn population(&self) -> usize {
        self.sched.lock_irq().population()
    }
}
