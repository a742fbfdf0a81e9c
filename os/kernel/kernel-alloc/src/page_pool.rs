//! # Per-core page pool
//!
//! Each core owns a [`ChunkDeque`] of 2 MiB chunks and a free-list of 4 KiB
//! pages cut from those chunks. A core that runs dry steals chunks from its
//! neighbours, so the physical allocator lock is only touched when chunks
//! are handed to the pool.
//!
//! The page free-list is intrusive: a free page stores the physical address
//! of the next free page in its first eight bytes.
//!
//! The per-core [`SpinLock`] around the free-list also serializes the owner
//! side of that core's deque.

use crate::chunk_deque::{ChunkDeque, Steal};
use alloc::boxed::Box;
use alloc::vec::Vec;
use kernel_info::memory::{PAGE_SIZE, PAGES_PER_CHUNK};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use kernel_sync::SpinLock;
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("no chunk left on any core")]
    OutOfMemory,
    #[error("chunk queue of core {0} is full")]
    Full(usize),
    #[error("core {0} has no pool")]
    NoSuchCore(usize),
    #[error("{0} is not page aligned")]
    Unaligned(PhysicalAddress),
}

#[derive(Default)]
struct PageList {
    /// Physical address of the first free page, 0 when empty.
    head: u64,
    len: usize,
}

struct CoreSlot {
    chunks: ChunkDeque,
    pages: SpinLock<PageList>,
}

pub struct PagePool<M: PhysMapper> {
    mapper: M,
    cores: Box<[CoreSlot]>,
    total_chunks: usize,
}

impl<M: PhysMapper> PagePool<M> {
    /// Build a pool for `cores` cores. Every chunk starts out on core 0;
    /// call [`subdivide`](Self::subdivide) once the other cores exist.
    ///
    /// Chunks must be 2 MiB of owned, mapped memory each.
    #[must_use]
    pub fn new(mapper: M, cores: usize, chunks: impl IntoIterator<Item = PhysicalAddress>) -> Self {
        let chunks: Vec<_> = chunks.into_iter().collect();
        let cores = cores.max(1);
        let slots: Box<[CoreSlot]> = (0..cores)
            .map(|_| CoreSlot {
                chunks: ChunkDeque::with_capacity(chunks.len()),
                pages: SpinLock::new(PageList::default()),
            })
            .collect();

        {
            let _owner = slots[0].pages.lock_irq();
            for &c in &chunks {
                // capacity is at least `chunks.len()`
                let _ = unsafe { slots[0].chunks.push(c) };
            }
        }

        info!("pool: {} chunks for {cores} cores", chunks.len());
        Self {
            mapper,
            cores: slots,
            total_chunks: chunks.len(),
        }
    }

    #[must_use]
    pub fn cores(&self) -> usize {
        self.cores.len()
    }

    #[must_use]
    pub const fn total_chunks(&self) -> usize {
        self.total_chunks
    }

    fn slot(&self, core: usize) -> Result<&CoreSlot, PoolError> {
        self.cores.get(core).ok_or(PoolError::NoSuchCore(core))
    }

    /// Move chunks from core 0 so every core holds a near-equal share.
    pub fn subdivide(&self) {
        let n = self.cores.len();
        if n < 2 {
            return;
        }
        let total = self.cores[0].chunks.len();
        let keep = total.div_ceil(n);
        for k in 0..total - keep {
            let chunk = {
                let _owner = self.cores[0].pages.lock_irq();
                unsafe { self.cores[0].chunks.pop() }
            };
            let Some(chunk) = chunk else { break };
            let target = 1 + k % (n - 1);
            if let Err(e) = self.free_chunk(target, chunk) {
                error!("pool: cannot hand chunk {chunk} to core {target}: {e}");
            }
        }
        debug!(
            "pool: subdivided {total} chunks, core 0 kept {}",
            self.cores[0].chunks.len()
        );
    }

    /// Pop from the owner's deque; the caller holds `slot.pages`.
    fn take_chunk_locked(&self, core: usize, slot: &CoreSlot) -> Option<PhysicalAddress> {
        if let Some(c) = unsafe { slot.chunks.pop() } {
            return Some(c);
        }
        self.steal_chunk(core)
    }

    /// Steal one chunk from the other cores, round-robin from `core + 1`.
    fn steal_chunk(&self, core: usize) -> Option<PhysicalAddress> {
        let n = self.cores.len();
        loop {
            let mut contended = false;
            for victim in (1..n).map(|d| (core + d) % n) {
                match self.cores[victim].chunks.steal() {
                    Steal::Success(c) => {
                        debug!("pool: core {core} stole chunk {c} from core {victim}");
                        return Some(c);
                    }
                    Steal::Retry => contended = true,
                    Steal::Empty => {}
                }
            }
            if !contended {
                return None;
            }
            core::hint::spin_loop();
        }
    }

    /// Take a 2 MiB chunk for `core`.
    ///
    /// # Errors
    /// [`PoolError::OutOfMemory`] when every core is empty.
    pub fn alloc_chunk(&self, core: usize) -> Result<PhysicalAddress, PoolError> {
        let slot = self.slot(core)?;
        let _owner = slot.pages.lock_irq();
        self.take_chunk_locked(core, slot)
            .ok_or(PoolError::OutOfMemory)
    }

    /// Return a chunk to `core`'s deque.
    ///
    /// # Errors
    /// [`PoolError::Full`] if the deque has no room, which means the chunk
    /// did not come from this pool.
    pub fn free_chunk(&self, core: usize, chunk: PhysicalAddress) -> Result<(), PoolError> {
        let slot = self.slot(core)?;
        if !chunk.is_aligned::<Size4K>() {
            return Err(PoolError::Unaligned(chunk));
        }
        let _owner = slot.pages.lock_irq();
        unsafe { slot.chunks.push(chunk) }.map_err(|_| PoolError::Full(core))
    }

    #[inline]
    fn next_of(&self, page: u64) -> u64 {
        // SAFETY: free pages are owned by the list; the first word is the link.
        unsafe {
            self.mapper
                .phys_to_ptr(PhysicalAddress::new(page))
                .cast::<u64>()
                .read()
        }
    }

    #[inline]
    fn set_next(&self, page: u64, next: u64) {
        // SAFETY: see `next_of`.
        unsafe {
            self.mapper
                .phys_to_ptr(PhysicalAddress::new(page))
                .cast::<u64>()
                .write(next);
        }
    }

    /// Allocate one zeroed 4 KiB page on `core`, cutting a fresh chunk into
    /// pages when the free-list is empty.
    ///
    /// # Errors
    /// [`PoolError::OutOfMemory`] when neither pages nor chunks are left.
    pub fn alloc_page(&self, core: usize) -> Result<PhysicalPage<Size4K>, PoolError> {
        let slot = self.slot(core)?;
        let page = {
            let mut list = slot.pages.lock_irq();
            if list.head == 0 {
                let chunk = self
                    .take_chunk_locked(core, slot)
                    .ok_or(PoolError::OutOfMemory)?
                    .as_u64();
                // pages 1.. go on the list, page 0 is returned
                for i in (1..PAGES_PER_CHUNK as u64).rev() {
                    let page = chunk + i * PAGE_SIZE;
                    self.set_next(page, list.head);
                    list.head = page;
                }
                list.len += PAGES_PER_CHUNK - 1;
                chunk
            } else {
                let page = list.head;
                list.head = self.next_of(page);
                list.len -= 1;
                page
            }
        };
        let pa = PhysicalAddress::new(page);
        // SAFETY: the page left the list above and belongs to the caller.
        unsafe { kernel_vmem::zero_frame(&self.mapper, pa) };
        Ok(pa.page())
    }

    /// Put a page on `core`'s free-list.
    ///
    /// # Errors
    /// [`PoolError::Unaligned`] for a non page-aligned address.
    pub fn free_page(&self, core: usize, page: PhysicalAddress) -> Result<(), PoolError> {
        let slot = self.slot(core)?;
        if page.is_null() || !page.is_aligned::<Size4K>() {
            return Err(PoolError::Unaligned(page));
        }
        let mut list = slot.pages.lock_irq();
        self.set_next(page.as_u64(), list.head);
        list.head = page.as_u64();
        list.len += 1;
        Ok(())
    }

    /// Chunks currently queued on `core`.
    #[must_use]
    pub fn chunks_on(&self, core: usize) -> usize {
        self.cores.get(core).map_or(0, |s| s.chunks.len())
    }

    /// Pages on `core`'s free-list.
    #[must_use]
    pub fn pages_on(&self, core: usize) -> usize {
        self.cores.get(core).map_or(0, |s| s.pages.lock_irq().len)
    }

    /// A [`FrameAlloc`] that allocates from `core`.
    #[must_use]
    pub const fn for_core(&self, core: usize) -> CorePool<'_, M> {
        CorePool { pool: self, core }
    }
}

/// The pool as seen from one core.
pub struct CorePool<'p, M: PhysMapper> {
    pool: &'p PagePool<M>,
    core: usize,
}

impl<M: PhysMapper> CorePool<'_, M> {
    #[must_use]
    pub const fn core(&self) -> usize {
        self.core
    }
}

impl<M: PhysMapper> FrameAlloc for CorePool<'_, M> {
    fn alloc_4k(&self) -> Option<PhysicalPage<Size4K>> {
        self.pool.alloc_page(self.core).ok()
    }

    fn free_4k(&self, frame: PhysicalPage<Size4K>) {
        if let Err(e) = self.pool.free_page(self.core, frame.base()) {
            error!("pool: dropped frame {frame:?}: {e}");
        }
    }
}
