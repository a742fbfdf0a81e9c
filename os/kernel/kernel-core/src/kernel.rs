//! # The kernel context
//!
//! [`Kernel`] owns every process-wide structure: the page pool, the kernel
//! address space, the epoch collector, the per-core records, the thread and
//! environment arenas and the interrupt-line table. Entry points that run
//! on an interrupt path take an [`InterruptContext`].
//!
//! Lock order, outermost first: a core's scheduler, the thread arena, the
//! environment arena. Wait queues are only locked on their own, or inside a
//! scheduler lock when a thread blocks.

use crate::arch::{ArchHooks, Shootdown};
use crate::arena::Arena;
use crate::cpu::{CpuState, PerCpu};
use crate::irq::{IrqHandler, IrqTable};
use crate::KernelError;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_alloc::{CorePool, PagePool, PhysicalAllocator};
use kernel_env::{Env, EnvId};
use kernel_info::boot::BootView;
use kernel_info::config::KernelConfig;
use kernel_info::memory::PAGES_PER_CHUNK;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_nbhm::ebr::{Collector, Guard};
use kernel_sched::{Parked, Pick, Scheduler, ThreadId, WaitQueue};
use kernel_sync::{InterruptContext, SpinLock, SpinLockIrqGuard};
use kernel_vmem::{AddressSpace, PageEntryBits, PageFaultError, PhysMapper};
use log::{debug, info, trace, warn};

/// A thread as the kernel tracks it.
struct Thread {
    env: Option<EnvId>,
    home: usize,
    /// Page-table root loaded while the thread runs.
    root: PhysicalPage<Size4K>,
    state: CpuState,
}

/// What the timer interrupt has to do before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerOutcome {
    /// Thread to resume, `None` to halt.
    pub thread: Option<ThreadId>,
    /// Absolute time for the one-shot timer.
    pub rearm_at: u64,
    /// Page-table root to load.
    pub root: PhysicalPage<Size4K>,
    /// Whether `thread` differs from what ran before the interrupt.
    pub switched: bool,
}

pub struct Kernel<M: PhysMapper + Clone, A: ArchHooks> {
    config: KernelConfig,
    pool: PagePool<M>,
    space: AddressSpace<M>,
    collector: Collector,
    cpus: Box<[PerCpu]>,
    threads: SpinLock<Arena<Thread>>,
    envs: SpinLock<Arena<Arc<Env<M>>>>,
    irqs: IrqTable,
    next_core: AtomicUsize,
    arch: A,
}

impl<M: PhysMapper + Clone, A: ArchHooks> Kernel<M, A> {
    /// Bring up a kernel with a fresh kernel address space.
    ///
    /// `chunks` are 2 MiB runs of free physical memory for the page pool;
    /// one core is created per entry of `lapic_ids`, as limited by
    /// [`KernelConfig::effective_cores`].
    ///
    /// # Errors
    /// [`KernelError::NoCores`], or [`KernelError::Vmem`] when the pool
    /// cannot supply the root table.
    pub fn new(
        config: KernelConfig,
        mapper: M,
        chunks: impl IntoIterator<Item = PhysicalAddress>,
        lapic_ids: &[u32],
        arch: A,
    ) -> Result<Self, KernelError> {
        Self::assemble(config, mapper, chunks, lapic_ids, None, arch)
    }

    /// Bring up a kernel from the loader's hand-off: adopt its PML4 and move
    /// all physical memory still free in `pmm` into the page pool.
    ///
    /// # Errors
    /// See [`Kernel::new`].
    pub fn boot<P: PhysMapper>(
        config: KernelConfig,
        mapper: M,
        view: &BootView<'_>,
        pmm: &PhysicalAllocator<'_, P>,
        arch: A,
    ) -> Result<Self, KernelError> {
        let chunks: Vec<_> = core::iter::from_fn(|| pmm.alloc_pages(PAGES_PER_CHUNK)).collect();
        let lapic_ids: Vec<u32> = view.cores.iter().map(|c| c.lapic_id).collect();
        let root = PhysicalAddress::new(view.pml4_root).page();
        Self::assemble(config, mapper, chunks, &lapic_ids, Some(root), arch)
    }

    fn assemble(
        config: KernelConfig,
        mapper: M,
        chunks: impl IntoIterator<Item = PhysicalAddress>,
        lapic_ids: &[u32],
        root: Option<PhysicalPage<Size4K>>,
        arch: A,
    ) -> Result<Self, KernelError> {
        let cores = config.effective_cores(lapic_ids.len());
        if cores == 0 {
            return Err(KernelError::NoCores);
        }
        let pool = PagePool::new(mapper.clone(), cores, chunks);
        pool.subdivide();
        let space = match root {
            Some(root) => AddressSpace::from_root(mapper, root),
            None => AddressSpace::new(mapper, &pool.for_core(0))?,
        };
        let cpus: Box<[PerCpu]> = lapic_ids
            .iter()
            .take(cores)
            .enumerate()
            .map(|(core, &lapic)| PerCpu::new(core, lapic, config.run_queue_capacity))
            .collect();

        info!(
            "kernel: {cores} cores, {} pool chunks, root {}",
            pool.total_chunks(),
            space.root().base()
        );
        Ok(Self {
            config,
            pool,
            space,
            collector: Collector::new(cores),
            cpus,
            threads: SpinLock::new(Arena::new()),
            envs: SpinLock::new(Arena::new()),
            irqs: IrqTable::new(),
            next_core: AtomicUsize::new(0),
            arch,
        })
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> &KernelConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn cores(&self) -> usize {
        self.cpus.len()
    }

    #[must_use]
    pub fn cpu(&self, core: usize) -> Option<&PerCpu> {
        self.cpus.get(core)
    }

    /// The arenas are also locked from the timer and fault paths, so every
    /// holder masks interrupts on its core.
    fn thread_arena(&self) -> SpinLockIrqGuard<'_, Arena<Thread>> {
        self.threads.lock_irq()
    }

    fn env_arena(&self) -> SpinLockIrqGuard<'_, Arena<Arc<Env<M>>>> {
        self.envs.lock_irq()
    }

    fn cpu_checked(&self, core: usize) -> Result<&PerCpu, KernelError> {
        self.cpus.get(core).ok_or(KernelError::NoSuchCore(core))
    }

    #[inline]
    #[must_use]
    pub const fn pool(&self) -> &PagePool<M> {
        &self.pool
    }

    #[inline]
    #[must_use]
    pub const fn kernel_space(&self) -> &AddressSpace<M> {
        &self.space
    }

    #[inline]
    #[must_use]
    pub const fn arch(&self) -> &A {
        &self.arch
    }

    /// Pin `core`'s epoch slot.
    ///
    /// # Panics
    /// If `core` does not exist.
    #[must_use]
    pub fn pin(&self, core: usize) -> Guard<'_> {
        self.collector.pin(core)
    }

    /// Frame source for page tables and pages touched on `core`.
    #[must_use]
    pub const fn frames(&self, core: usize) -> CorePool<'_, M> {
        self.pool.for_core(core)
    }

    /// Free retired hash tables, handle generations and objects that no
    /// pinned core can still see. The reclaimer thread runs this every
    /// [`RECLAIM_INTERVAL_US`](kernel_info::config::RECLAIM_INTERVAL_US)
    /// while [`Collector::has_pending`] holds.
    pub fn reclaim(&self) -> usize {
        let freed = self.collector.reclaim();
        if freed > 0 {
            trace!("reclaimer: freed {freed}");
        }
        freed
    }

    // ---------------------------------------------------------------------
    // Environments

    /// Create an empty environment whose upper half shares the kernel's.
    ///
    /// # Errors
    /// [`KernelError::Vmem`] when `core`'s pool cannot supply a root table.
    pub fn env_create(&self, core: usize) -> Result<EnvId, KernelError> {
        let space = self.space.new_user(&self.frames(core))?;
        let hint = self.config.commit_table_hint;
        let (index, generation) = self
            .env_arena()
            .insert_with(|i, g| Arc::new(Env::new(EnvId::new(i, g), space, hint)))
            .ok_or(KernelError::TooManyEnvs)?;
        let id = EnvId::new(index, generation);
        info!("{id}: created");
        Ok(id)
    }

    #[must_use]
    pub fn env(&self, id: EnvId) -> Option<Arc<Env<M>>> {
        self.env_arena()
            .get(id.index(), id.generation())
            .cloned()
    }

    #[must_use]
    pub fn env_count(&self) -> usize {
        self.env_arena().len()
    }

    /// Kill every thread of `id`, revoke all its memory and drop it.
    ///
    /// Returns the number of committed pages released. Objects reachable
    /// only through its handles go once the last reference is gone.
    ///
    /// # Errors
    /// [`KernelError::NoSuchEnv`], or a failure revoking the mappings.
    pub fn env_kill(&self, core: usize, id: EnvId) -> Result<usize, KernelError> {
        let env = self
            .env_arena()
            .remove(id.index(), id.generation())
            .ok_or(KernelError::NoSuchEnv(id))?;
        for thread in env.take_threads() {
            if let Err(e) = self.thread_kill(thread) {
                debug!("{id}: {e}");
            }
        }
        let guard = self.pin(core);
        let released = env.unmap_all(&guard, &self.frames(core), &Shootdown(&self.arch))?;
        info!("{id}: killed, {released} pages released");
        Ok(released)
    }

    /// Revoke the range of `env` starting at `start` on all cores.
    ///
    /// # Errors
    /// [`KernelError::NoSuchEnv`], or see [`Env::unmap`].
    pub fn unmap(&self, core: usize, env: EnvId, start: VirtualAddress) -> Result<usize, KernelError> {
        let e = self.env(env).ok_or(KernelError::NoSuchEnv(env))?;
        let guard = self.pin(core);
        Ok(e.unmap(&guard, &self.frames(core), &Shootdown(&self.arch), start)?)
    }

    // ---------------------------------------------------------------------
    // Threads

    /// Create a thread in `env` (or a kernel thread) starting from `state`.
    ///
    /// Threads are dealt to cores round robin and stay on their core.
    ///
    /// # Errors
    /// [`KernelError::NoSuchEnv`], or [`KernelError::Sched`] when the chosen
    /// core is full.
    pub fn thread_create(&self, env: Option<EnvId>, state: CpuState) -> Result<ThreadId, KernelError> {
        let owner = env
            .map(|id| self.env(id).ok_or(KernelError::NoSuchEnv(id)))
            .transpose()?;
        let root = owner
            .as_ref()
            .map_or_else(|| self.space.root(), |e| e.space().root());
        let home = self.next_core.fetch_add(1, Ordering::Relaxed) % self.cpus.len();

        let (index, generation) = self
            .thread_arena()
            .insert_with(|_, _| Thread { env, home, root, state })
            .ok_or(KernelError::TooManyThreads)?;
        let id = ThreadId::new(index, generation);

        let spawned = {
            let mut sched = self.cpus[home].sched.lock_irq();
            let was_idle = sched.is_idle();
            sched.spawn(id).map(|()| was_idle)
        };
        let was_idle = match spawned {
            Ok(idle) => idle,
            Err(e) => {
                self.thread_arena().remove(index, generation);
                return Err(e.into());
            }
        };
        if let Some(owner) = owner {
            owner.attach_thread(id);
        }
        if was_idle {
            self.arch.send_wake_ipi(home);
        }
        debug!("thread {id}: created on core {home}");
        Ok(id)
    }

    /// Kill `id` wherever it is. A thread parked on a wait queue stays
    /// there until woken and is dropped at that point.
    ///
    /// # Errors
    /// [`KernelError::NoSuchThread`].
    pub fn thread_kill(&self, id: ThreadId) -> Result<(), KernelError> {
        let home = self
            .thread_arena()
            .get(id.index(), id.generation())
            .map(|t| t.home)
            .ok_or(KernelError::NoSuchThread(id))?;

        let was_running = {
            let mut sched = self.cpus[home].sched.lock_irq();
            let running = sched.current() == Some(id);
            sched.remove(id);
            running
        };
        let thread = self
            .thread_arena()
            .remove(id.index(), id.generation())
            .ok_or(KernelError::NoSuchThread(id))?;
        if let Some(env) = thread.env.and_then(|e| self.env(e)) {
            env.detach_thread(id);
        }
        if was_running {
            // stop it before its slice ends
            self.arch.send_wake_ipi(home);
        }
        debug!("thread {id}: killed");
        Ok(())
    }

    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.thread_arena().len()
    }

    /// Core `id` runs on.
    #[must_use]
    pub fn home_core(&self, id: ThreadId) -> Option<usize> {
        self.thread_arena()
            .get(id.index(), id.generation())
            .map(|t| t.home)
    }

    #[must_use]
    pub fn thread_env(&self, id: ThreadId) -> Option<EnvId> {
        self.thread_arena()
            .get(id.index(), id.generation())
            .and_then(|t| t.env)
    }

    /// Registers saved when `id` was last preempted.
    #[must_use]
    pub fn saved_state(&self, id: ThreadId) -> Option<CpuState> {
        self.thread_arena()
            .get(id.index(), id.generation())
            .map(|t| t.state)
    }

    // ---------------------------------------------------------------------
    // Interrupt paths

    fn save_running(&self, sched: &Scheduler, state: &CpuState) {
        if let Some(prev) = sched.current()
            && let Some(t) = self.thread_arena().get_mut(prev.index(), prev.generation())
        {
            t.state = *state;
        }
    }

    /// Pick the next thread and load its registers into `state`.
    fn switch(
        &self,
        ctx: &InterruptContext,
        cpu: &PerCpu,
        sched: &mut Scheduler,
        now: u64,
        state: &mut CpuState,
    ) -> TimerOutcome {
        let before = cpu.current();
        let (thread, rearm_at, root) = loop {
            match sched.pick_next(ctx, now) {
                Pick::Idle { wake_at } => break (None, wake_at, self.space.root()),
                Pick::Run { thread, deadline } => {
                    let threads = self.thread_arena();
                    if let Some(t) = threads.get(thread.index(), thread.generation()) {
                        *state = t.state;
                        break (Some(thread), deadline, t.root);
                    }
                    // killed while parked, then woken
                    sched.remove(thread);
                }
            }
        };
        cpu.set_current(thread);
        let switched = before != thread;
        if switched {
            trace!("core {}: {before:?} -> {thread:?} until {rearm_at}", cpu.core_id());
        }
        TimerOutcome {
            thread,
            rearm_at,
            root,
            switched,
        }
    }

    /// Timer interrupt: account the running thread and choose the next one.
    ///
    /// `state` holds the interrupted registers on entry and the registers
    /// to resume on return.
    ///
    /// # Errors
    /// [`KernelError::NoSuchCore`] for a context minted for a core that
    /// does not exist.
    pub fn on_timer(
        &self,
        ctx: &InterruptContext,
        now: u64,
        state: &mut CpuState,
    ) -> Result<TimerOutcome, KernelError> {
        let cpu = self.cpu_checked(ctx.core())?;
        cpu.tick();
        let mut sched = cpu.sched.lock_irq();
        self.save_running(&sched, state);
        Ok(self.switch(ctx, cpu, &mut sched, now, state))
    }

    /// The `sleep` system call: park the running thread for `duration` and
    /// reschedule as the timer would.
    ///
    /// # Errors
    /// [`KernelError::Sched`] if nothing is running on the core.
    pub fn sleep(
        &self,
        ctx: &InterruptContext,
        now: u64,
        duration: u64,
        state: &mut CpuState,
    ) -> Result<TimerOutcome, KernelError> {
        let cpu = self.cpu_checked(ctx.core())?;
        let mut sched = cpu.sched.lock_irq();
        self.save_running(&sched, state);
        let thread = sched.sleep_current(now, duration)?;
        trace!("thread {thread}: sleeping until {}", now.saturating_add(duration));
        Ok(self.switch(ctx, cpu, &mut sched, now, state))
    }

    /// Block the running thread on `queue` and reschedule.
    ///
    /// # Errors
    /// [`KernelError::Sched`] if nothing is running on the core.
    pub fn wait(
        &self,
        ctx: &InterruptContext,
        now: u64,
        queue: &WaitQueue,
        state: &mut CpuState,
    ) -> Result<TimerOutcome, KernelError> {
        let cpu = self.cpu_checked(ctx.core())?;
        let mut sched = cpu.sched.lock_irq();
        self.save_running(&sched, state);
        let entry = sched.block_current(now)?;
        queue.park(cpu.core_id(), entry);
        Ok(self.switch(ctx, cpu, &mut sched, now, state))
    }

    /// Put a woken thread back on its core; kick the core if it idles.
    fn readmit(&self, parked: Parked) -> bool {
        let thread = parked.entry.thread;
        if self
            .thread_arena()
            .get(thread.index(), thread.generation())
            .is_none()
        {
            return false;
        }
        let Some(cpu) = self.cpus.get(parked.core) else {
            return false;
        };
        match cpu.sched.lock_irq().wake(parked.entry) {
            Ok(was_idle) => {
                if was_idle {
                    self.arch.send_wake_ipi(parked.core);
                }
                true
            }
            Err(e) => {
                warn!("thread {thread}: lost on wake-up: {e}");
                false
            }
        }
    }

    /// Wake the longest waiting live thread on `queue`.
    pub fn wake_one(&self, queue: &WaitQueue) -> Option<ThreadId> {
        while let Some(parked) = queue.wake_one() {
            if self.readmit(parked) {
                return Some(parked.entry.thread);
            }
        }
        None
    }

    /// Wake everything on `queue`; returns how many threads became runnable.
    pub fn wake_all(&self, queue: &WaitQueue) -> usize {
        queue
            .wake_all()
            .into_iter()
            .filter(|&p| self.readmit(p))
            .count()
    }

    /// Page fault on behalf of `env`: commit and install the page.
    ///
    /// # Errors
    /// [`KernelError::NoSuchEnv`], or [`KernelError::Fault`] when the
    /// access is not backed by a declared range; the arch layer then kills
    /// the faulting thread.
    pub fn on_page_fault(
        &self,
        ctx: &InterruptContext,
        env: EnvId,
        addr: VirtualAddress,
        error: PageFaultError,
    ) -> Result<PageEntryBits, KernelError> {
        let core = ctx.core();
        self.cpu_checked(core)?;
        let e = self.env(env).ok_or(KernelError::NoSuchEnv(env))?;
        let guard = self.pin(core);
        Ok(e.resolve_fault(&guard, &self.frames(core), addr, error)?)
    }

    /// Bind `callback` to interrupt `line` and route the line to core 0.
    ///
    /// # Errors
    /// [`KernelError::NoSuchLine`] or [`KernelError::LineTaken`].
    pub fn set_interrupt_line(&self, line: usize, callback: fn(usize), ctx: usize) -> Result<(), KernelError> {
        self.irqs.bind(line, IrqHandler { callback, ctx })?;
        self.arch.route_irq(line, 0);
        Ok(())
    }

    /// Device interrupt on `line`; `false` if nobody registered for it.
    pub fn on_device_irq(&self, _ctx: &InterruptContext, line: usize) -> bool {
        self.irqs.dispatch(line)
    }
}
