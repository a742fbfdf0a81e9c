//! # Environments
//!
//! An [`Env`] is an address space plus a handle namespace shared by a set
//! of threads. Its memory is described three times:
//!
//! * the [`VmemTree`] of declared ranges (what may be touched),
//! * the commit table, a lock-free [`Nbhm`] from page to frame (what has
//!   been touched),
//! * the hardware page tables (what the CPU currently sees).
//!
//! The address-space lock is shared by faulting cores, which only ever add
//! translations, and taken exclusively to declare or revoke ranges.

use crate::{EnvId, Handle, HandleError, KHandleTable, KObject, PageDesc, Rights, VmemFlags, VmemTree};
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_info::memory::{PAGE_SIZE, USER_VMEM_BASE, USERSPACE_END};
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress, is_aligned};
use kernel_nbhm::{MapError, Nbhm};
use kernel_nbhm::ebr::Guard;
use kernel_sched::ThreadId;
use kernel_sync::{RwLock, SpinLock};
use kernel_vmem::{
    AddressSpace, FrameAlloc, PageEntryBits, PageFaultError, PhysMapper, PteUpdate,
    TlbInvalidate, VmemError,
};
use log::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnvError {
    #[error("address, offset or size is not page aligned")]
    Unaligned,
    #[error("empty range")]
    Empty,
    #[error("range overlaps an existing mapping")]
    Overlap,
    #[error("no free virtual range of {0} bytes")]
    NoVirtualSpace(u64),
    #[error("{0} is not a VMO")]
    NotAVmo(Handle),
    #[error("{0} lacks the map right")]
    AccessDenied(Handle),
    #[error("range exceeds the VMO")]
    OutOfRange,
    #[error("no range starts at {0}")]
    NotMapped(VirtualAddress),
    #[error(transparent)]
    Handle(#[from] HandleError),
    #[error(transparent)]
    Vmem(#[from] VmemError),
}

/// Why a page fault could not be turned into a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FaultError {
    #[error("{0} is not in a declared range")]
    Unmapped(VirtualAddress),
    #[error("access to {addr} denied: {reason}")]
    Denied {
        addr: VirtualAddress,
        reason: &'static str,
    },
    #[error("VMO backing {0} is no longer open")]
    VmoGone(VirtualAddress),
    #[error("out of physical pages")]
    OutOfMemory,
    #[error("unresolvable fault: {0}")]
    Unresolvable(&'static str),
    #[error(transparent)]
    Commit(#[from] MapError),
    #[error(transparent)]
    Vmem(#[from] VmemError),
}

/// Commit-table keys and values carry bit 0 so page 0 and frame 0 stay
/// distinct from the map's empty slot.
const COMMITTED: u64 = 1;

#[inline]
const fn commit_key(page: VirtualAddress) -> u64 {
    page.as_u64() | COMMITTED
}

#[inline]
const fn commit_value(frame: PhysicalAddress) -> u64 {
    frame.as_u64() | COMMITTED
}

#[inline]
const fn committed_frame(value: u64) -> PhysicalAddress {
    PhysicalAddress::new(value & !COMMITTED)
}

pub struct Env<M: PhysMapper> {
    id: EnvId,
    vmem: RwLock<VmemTree>,
    commit: Nbhm,
    space: AddressSpace<M>,
    handles: KHandleTable,
    threads: SpinLock<Vec<ThreadId>>,
}

impl<M: PhysMapper> Env<M> {
    /// Wrap a fresh address space; `commit_hint` sizes the commit table.
    #[must_use]
    pub fn new(id: EnvId, space: AddressSpace<M>, commit_hint: usize) -> Self {
        Self {
            id,
            vmem: RwLock::new(VmemTree::new()),
            commit: Nbhm::with_capacity(commit_hint),
            space,
            handles: KHandleTable::with_entries(1),
            threads: SpinLock::new(Vec::new()),
        }
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> EnvId {
        self.id
    }

    #[inline]
    #[must_use]
    pub const fn space(&self) -> &AddressSpace<M> {
        &self.space
    }

    #[inline]
    #[must_use]
    pub const fn handles(&self) -> &KHandleTable {
        &self.handles
    }

    /// # Errors
    /// See [`KHandleTable::open`].
    pub fn open_handle(
        &self,
        guard: &Guard<'_>,
        rights: Rights,
        obj: Arc<KObject>,
    ) -> Result<Handle, HandleError> {
        let kind = obj.kind();
        let handle = self.handles.open(guard, rights, obj)?;
        debug!("{}: opened {handle} ({kind})", self.id);
        Ok(handle)
    }

    #[must_use]
    pub fn get_handle(&self, guard: &Guard<'_>, handle: Handle) -> Option<(Arc<KObject>, Rights)> {
        self.handles.get(guard, handle)
    }

    /// # Errors
    /// See [`KHandleTable::close`].
    pub fn close_handle(&self, guard: &Guard<'_>, handle: Handle) -> Result<(), HandleError> {
        self.handles.close(guard, handle)?;
        debug!("{}: closed {handle}", self.id);
        Ok(())
    }

    pub fn attach_thread(&self, thread: ThreadId) {
        self.threads.lock_irq().push(thread);
    }

    /// Returns whether `thread` belonged to this environment.
    pub fn detach_thread(&self, thread: ThreadId) -> bool {
        let mut threads = self.threads.lock_irq();
        threads
            .iter()
            .position(|&t| t == thread)
            .map(|at| threads.swap_remove(at))
            .is_some()
    }

    #[must_use]
    pub fn threads(&self) -> Vec<ThreadId> {
        self.threads.lock_irq().clone()
    }

    /// Detach every thread at once.
    pub fn take_threads(&self) -> Vec<ThreadId> {
        core::mem::take(&mut *self.threads.lock_irq())
    }

    fn check_range(vaddr: u64, offset: u64, size: u64) -> Result<(), EnvError> {
        if size == 0 {
            return Err(EnvError::Empty);
        }
        if !is_aligned(vaddr, PAGE_SIZE) || !is_aligned(offset, PAGE_SIZE) || !is_aligned(size, PAGE_SIZE) {
            return Err(EnvError::Unaligned);
        }
        Ok(())
    }

    /// The VMO behind `handle` must allow mapping and cover `[offset, offset + size)`.
    fn check_vmo(&self, guard: &Guard<'_>, handle: Handle, offset: u64, size: u64) -> Result<(), EnvError> {
        let (obj, rights) = self
            .handles
            .get(guard, handle)
            .ok_or(HandleError::NotOpen(handle))?;
        let vmo = obj.as_vmo().ok_or(EnvError::NotAVmo(handle))?;
        if !rights.map() {
            return Err(EnvError::AccessDenied(handle));
        }
        match offset.checked_add(size) {
            Some(end) if end <= vmo.size() => Ok(()),
            _ => Err(EnvError::OutOfRange),
        }
    }

    /// Declare `[vaddr, vaddr + size)`, backed by `vmo` from `offset` or by
    /// anonymous zeroed pages. Nothing is committed until first touch.
    ///
    /// # Errors
    /// Misaligned or empty ranges, overlaps, and VMO handles that are not
    /// open, not VMOs, not mappable or too small.
    pub fn add_range(
        &self,
        guard: &Guard<'_>,
        vmo: Option<Handle>,
        vaddr: VirtualAddress,
        offset: u64,
        size: u64,
        flags: VmemFlags,
    ) -> Result<(), EnvError> {
        Self::check_range(vaddr.as_u64(), offset, size)?;
        if let Some(h) = vmo {
            self.check_vmo(guard, h, offset, size)?;
        }
        let mut tree = self.vmem.write();
        if tree.overlaps(vaddr.as_u64(), size) {
            return Err(EnvError::Overlap);
        }
        tree.insert(vaddr.as_u64(), PageDesc { valid: true, flags, vmo, offset, size });
        debug!("{}: declared {vaddr}+{size:#x} ({flags:?})", self.id);
        Ok(())
    }

    /// Declare a range at the lowest free address from [`USER_VMEM_BASE`].
    ///
    /// # Errors
    /// As [`Env::add_range`], plus [`EnvError::NoVirtualSpace`].
    pub fn map(
        &self,
        guard: &Guard<'_>,
        vmo: Option<Handle>,
        offset: u64,
        size: u64,
        flags: VmemFlags,
    ) -> Result<VirtualAddress, EnvError> {
        Self::check_range(USER_VMEM_BASE, offset, size)?;
        if let Some(h) = vmo {
            self.check_vmo(guard, h, offset, size)?;
        }
        let mut tree = self.vmem.write();
        let start = tree
            .find_gap(USER_VMEM_BASE, size)
            .filter(|s| s.checked_add(size).is_some_and(|end| end <= USERSPACE_END))
            .ok_or(EnvError::NoVirtualSpace(size))?;
        tree.insert(start, PageDesc { valid: true, flags, vmo, offset, size });
        let va = VirtualAddress::new(start);
        debug!("{}: mapped {va}+{size:#x}", self.id);
        Ok(va)
    }

    /// Revoke the range starting at `start`.
    ///
    /// Backward progress: holds the space exclusively, clears the hardware
    /// entries through `tlb` (which has to reach every core running this
    /// environment) and only then frees committed anonymous pages. Returns
    /// the number of committed pages released.
    ///
    /// # Errors
    /// [`EnvError::NotMapped`] when no valid range starts at `start`.
    pub fn unmap(
        &self,
        guard: &Guard<'_>,
        frames: &impl FrameAlloc,
        tlb: &impl TlbInvalidate,
        start: VirtualAddress,
    ) -> Result<usize, EnvError> {
        let mut tree = self.vmem.write();
        let desc = tree
            .get_mut(start.as_u64())
            .filter(|d| d.valid)
            .ok_or(EnvError::NotMapped(start))?;
        desc.valid = false;
        let desc = *desc;
        self.release(guard, frames, tlb, start, &desc)
    }

    /// Revoke every range; used when the environment dies.
    ///
    /// # Errors
    /// See [`Env::unmap`].
    pub fn unmap_all(
        &self,
        guard: &Guard<'_>,
        frames: &impl FrameAlloc,
        tlb: &impl TlbInvalidate,
    ) -> Result<usize, EnvError> {
        let mut tree = self.vmem.write();
        let live: Vec<(u64, PageDesc)> = tree
            .iter()
            .filter(|(_, d)| d.valid)
            .map(|(k, d)| (k, *d))
            .collect();
        let mut released = 0;
        for (start, desc) in live {
            if let Some(d) = tree.get_mut(start) {
                d.valid = false;
            }
            released += self.release(guard, frames, tlb, VirtualAddress::new(start), &desc)?;
        }
        Ok(released)
    }

    fn release(
        &self,
        guard: &Guard<'_>,
        frames: &impl FrameAlloc,
        tlb: &impl TlbInvalidate,
        start: VirtualAddress,
        desc: &PageDesc,
    ) -> Result<usize, EnvError> {
        self.space.unview(tlb, start, desc.size)?;
        let mut released = 0;
        let mut off = 0;
        while off < desc.size {
            if let Some(v) = self.commit.remove(guard, commit_key(start + off)) {
                if desc.vmo.is_none() {
                    frames.free_4k(committed_frame(v).page());
                }
                released += 1;
            }
            off += PAGE_SIZE;
        }
        debug!("{}: unmapped {start}+{:#x}, {released} pages released", self.id, desc.size);
        Ok(released)
    }

    /// Frame committed for the page containing `addr`.
    #[must_use]
    pub fn committed(&self, guard: &Guard<'_>, addr: VirtualAddress) -> Option<PhysicalAddress> {
        let page = addr.page::<Size4K>().base();
        self.commit.get(guard, commit_key(page)).map(committed_frame)
    }

    /// Committed pages.
    #[must_use]
    pub fn commit_count(&self, guard: &Guard<'_>) -> usize {
        self.commit.len(guard)
    }

    /// Decide how a fault at `addr` is resolved.
    ///
    /// Runs under the shared lock, so any number of cores may fault into
    /// the same environment. The first touch of an anonymous page allocates
    /// a zeroed frame and publishes it with `put_if_null`; a core that loses
    /// that race frees its frame and uses the winner's, so every core maps
    /// the same frame.
    ///
    /// # Errors
    /// [`FaultError::Unmapped`] outside declared ranges,
    /// [`FaultError::Denied`] for writes to read-only ranges,
    /// [`FaultError::VmoGone`] and [`FaultError::OutOfMemory`].
    pub fn segfault(
        &self,
        guard: &Guard<'_>,
        frames: &impl FrameAlloc,
        addr: VirtualAddress,
        is_write: bool,
    ) -> Result<PteUpdate, FaultError> {
        let tree = self.vmem.read();
        self.commit_in(&tree, guard, frames, addr, is_write)
    }

    /// Body of [`Env::segfault`] for a caller already holding the shared
    /// lock.
    fn commit_in(
        &self,
        tree: &VmemTree,
        guard: &Guard<'_>,
        frames: &impl FrameAlloc,
        addr: VirtualAddress,
        is_write: bool,
    ) -> Result<PteUpdate, FaultError> {
        let (start, desc) = tree
            .find(addr.as_u64())
            .ok_or(FaultError::Unmapped(addr))?;
        if is_write && !desc.flags.write() {
            return Err(FaultError::Denied {
                addr,
                reason: "write to a read-only range",
            });
        }

        let page = addr.page::<Size4K>().base();
        let key = commit_key(page);
        let flags = desc.flags.entry_bits();
        if let Some(v) = self.commit.get(guard, key) {
            return Ok(PteUpdate { phys: committed_frame(v), flags });
        }

        let frame = match desc.vmo {
            Some(h) => {
                let (obj, _) = self.handles.get(guard, h).ok_or(FaultError::VmoGone(addr))?;
                let vmo = obj.as_vmo().ok_or(FaultError::VmoGone(addr))?;
                vmo.paddr() + desc.offset + (page.as_u64() - start)
            }
            None => frames.alloc_4k().ok_or(FaultError::OutOfMemory)?.base(),
        };

        let raced = self
            .commit
            .put_if_null(guard, key, commit_value(frame))
            .inspect_err(|_| {
                if desc.vmo.is_none() {
                    frames.free_4k(frame.page());
                }
            })?;
        let phys = match raced {
            None => {
                trace!("{}: committed {page} -> {frame}", self.id);
                frame
            }
            Some(winner) => {
                if desc.vmo.is_none() {
                    frames.free_4k(frame.page());
                }
                committed_frame(winner)
            }
        };
        Ok(PteUpdate { phys, flags })
    }

    /// Resolve a hardware page fault end to end: consult the declared
    /// ranges, commit a frame and install the translation.
    ///
    /// The shared lock is held until the entry is installed, so a
    /// revocation waits for the install and then clears it.
    ///
    /// # Errors
    /// See [`Env::segfault`]; also rejects reserved-bit and protection-key
    /// faults, instruction fetches from non-executable ranges and user
    /// accesses to kernel-only ranges.
    pub fn resolve_fault(
        &self,
        guard: &Guard<'_>,
        frames: &impl FrameAlloc,
        addr: VirtualAddress,
        error: PageFaultError,
    ) -> Result<PageEntryBits, FaultError> {
        if !error.is_resolvable() {
            return Err(FaultError::Unresolvable(error.explain()));
        }
        let tree = self.vmem.read();
        let update = self
            .commit_in(&tree, guard, frames, addr, error.write())
            .inspect_err(|e| warn!("{}: {e} ({})", self.id, error.explain()))?;
        if error.instruction_fetch() && update.flags.no_execute() {
            return Err(FaultError::Denied {
                addr,
                reason: "instruction fetch from a non-executable range",
            });
        }
        if error.user() && !update.flags.user_access() {
            return Err(FaultError::Denied {
                addr,
                reason: "user access to a kernel-only range",
            });
        }
        let page = addr.page::<Size4K>().base();
        let leaf = self.space.install(frames, page, update)?;
        drop(tree);
        Ok(leaf)
    }
}
