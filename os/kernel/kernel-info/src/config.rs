//! # Tunables
//!
//! All times are in microseconds.

/// Minimum scheduling period; with `n` runnable threads the period is
/// `max(SCHED_QUANTA_US, n * SCHED_GRANULARITY_US)`.
pub const SCHED_QUANTA_US: u64 = 10_000;

/// Slices and idle wake-ups are rounded up to this granularity.
pub const SCHED_GRANULARITY_US: u64 = 1_000;

/// Idle sleep when a core has neither runnable nor sleeping threads.
pub const IDLE_SLEEP_US: u64 = 1_000_000;

/// Default per-queue capacity of a core's scheduler.
pub const RUN_QUEUE_CAPACITY: usize = 256;

/// Upper bound on logical cores.
pub const MAX_CORES: usize = 64;

/// IOAPIC interrupt lines that can carry a device callback.
pub const IRQ_LINES: usize = 24;

/// Period of the reclaimer thread's scan for retired NBHM tables.
pub const RECLAIM_INTERVAL_US: u64 = 10_000;

/// Runtime configuration handed to kernel initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of cores to bring up; `0` means "all cores in the boot record".
    pub cores: usize,
    /// Share of the largest usable region given to the kernel heap, in percent.
    pub heap_percent: u64,
    /// Per-queue capacity of every core's scheduler.
    pub run_queue_capacity: usize,
    /// Initial capacity hint of an address space's commit table.
    pub commit_table_hint: usize,
}

impl KernelConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cores: 0,
            heap_percent: crate::memory::HEAP_PERCENT,
            run_queue_capacity: RUN_QUEUE_CAPACITY,
            commit_table_hint: 64,
        }
    }

    #[must_use]
    pub const fn with_cores(mut self, cores: usize) -> Self {
        self.cores = cores;
        self
    }

    #[must_use]
    pub const fn with_heap_percent(mut self, percent: u64) -> Self {
        self.heap_percent = percent;
        self
    }

    #[must_use]
    pub const fn with_run_queue_capacity(mut self, capacity: usize) -> Self {
        self.run_queue_capacity = capacity;
        self
    }

    #[must_use]
    pub const fn with_commit_table_hint(mut self, entries: usize) -> Self {
        self.commit_table_hint = entries;
        self
    }

    /// Cores to use given `available` entries in the boot record.
    #[must_use]
    pub const fn effective_cores(&self, available: usize) -> usize {
        let wanted = if self.cores == 0 || self.cores > available {
            available
        } else {
            self.cores
        };
        if wanted > MAX_CORES { MAX_CORES } else { wanted }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}

const _: () = {
    assert!(SCHED_QUANTA_US >= SCHED_GRANULARITY_US);
    assert!(RUN_QUEUE_CAPACITY.is_power_of_two());
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_cores_clamps() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.effective_cores(4), 4);
        assert_eq!(cfg.with_cores(2).effective_cores(4), 2);
        assert_eq!(cfg.with_cores(8).effective_cores(4), 4);
        assert_eq!(cfg.effective_cores(1000), MAX_CORES);
    }
}
