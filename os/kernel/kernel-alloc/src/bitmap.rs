//! # Bitmap physical page allocator
//!
//! Every usable region above 1 MiB is tracked by one or more
//! [`BitmapPage`]s. Each node covers up to [`PAGES_PER_BITMAP`] consecutive
//! 4 KiB pages; a set bit means "in use". Nodes are chained by index in the
//! order regions were added and scanned first-fit.
//!
//! ```text
//!  head ─► [node 0: base A, 32576 pages] ─► [node 1: base A + 127 MiB] ─► [node 2: base B] ─► NIL
//! ```
//!
//! Node storage is handed in by the caller (a `.bss` array in the kernel),
//! so no managed page is spent on metadata.

use kernel_info::boot::MemoryRegion;
use kernel_info::memory::{LOW_MEMORY_LIMIT, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, align_up};
use kernel_sync::SpinLock;
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::{debug, error, info};

/// Words of the bit vector in one node.
pub const BITMAP_WORDS: usize = 509;

/// Pages covered by one node: `(PAGE_SIZE - header) * 8`.
pub const PAGES_PER_BITMAP: usize = BITMAP_WORDS * 64;

const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PmmError {
    #[error("double free of {0}")]
    DoubleFree(PhysicalAddress),
    #[error("{0} is not managed by this allocator")]
    Unmanaged(PhysicalAddress),
    #[error("no bitmap node left to describe the region")]
    MetadataExhausted,
}

/// One page-sized bitmap node.
#[repr(C, align(4096))]
pub struct BitmapPage {
    /// Physical address of the first managed page.
    base: u64,
    /// Index of the next node, or `NIL`.
    next: u32,
    /// Set bits in `words`.
    popcount: u32,
    /// Valid bits in `words`.
    capacity: u32,
    _reserved: u32,
    words: [u64; BITMAP_WORDS],
}

const _: () = assert!(size_of::<BitmapPage>() == PAGE_SIZE as usize);
const _: () = assert!(PAGES_PER_BITMAP == (PAGE_SIZE as usize - 24) * 8);

impl BitmapPage {
    pub const EMPTY: Self = Self {
        base: 0,
        next: NIL,
        popcount: 0,
        capacity: 0,
        _reserved: 0,
        words: [0; BITMAP_WORDS],
    };

    #[inline]
    const fn end(&self) -> u64 {
        self.base + self.capacity as u64 * PAGE_SIZE
    }

    #[inline]
    const fn contains(&self, pa: u64) -> bool {
        pa >= self.base && pa < self.end()
    }

    #[inline]
    const fn is_set(&self, bit: usize) -> bool {
        self.words[bit / 64] & (1 << (bit % 64)) != 0
    }

    #[inline]
    const fn set(&mut self, bit: usize) {
        self.words[bit / 64] |= 1 << (bit % 64);
    }

    #[inline]
    const fn clear(&mut self, bit: usize) {
        self.words[bit / 64] &= !(1 << (bit % 64));
    }

    /// First clear bit below `capacity`.
    fn first_clear(&self) -> Option<usize> {
        let cap = self.capacity as usize;
        self.words[..cap.div_ceil(64)]
            .iter()
            .enumerate()
            .find(|(_, w)| **w != u64::MAX)
            .map(|(i, w)| i * 64 + w.trailing_ones() as usize)
            .filter(|bit| *bit < cap)
    }

    /// Start of the first run of `n` clear bits.
    ///
    /// On a collision at `j` the scan restarts at `j + 1`.
    fn find_run(&self, n: usize) -> Option<usize> {
        let cap = self.capacity as usize;
        let mut start = 0;
        'outer: while start + n <= cap {
            for j in start..start + n {
                if self.is_set(j) {
                    start = j + 1;
                    continue 'outer;
                }
            }
            return Some(start);
        }
        None
    }

    fn count_ones(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }
}

/// Unlocked allocator state; see [`PhysicalAllocator`] for the shared form.
pub struct BitmapFrameAllocator<'a, M: PhysMapper> {
    nodes: &'a mut [BitmapPage],
    used_nodes: u32,
    head: u32,
    tail: u32,
    free_pages: usize,
    total_pages: usize,
    mapper: M,
}

impl<'a, M: PhysMapper> BitmapFrameAllocator<'a, M> {
    /// An allocator with no regions; node storage comes from `nodes`.
    pub fn new(nodes: &'a mut [BitmapPage], mapper: M) -> Self {
        Self {
            nodes,
            used_nodes: 0,
            head: NIL,
            tail: NIL,
            free_pages: 0,
            total_pages: 0,
            mapper,
        }
    }

    /// Build an allocator over every usable region of the memory map.
    ///
    /// Regions starting below 1 MiB are skipped.
    ///
    /// # Errors
    /// [`PmmError::MetadataExhausted`] when `nodes` is too small.
    pub fn from_regions<'r>(
        nodes: &'a mut [BitmapPage],
        mapper: M,
        regions: impl IntoIterator<Item = &'r MemoryRegion>,
    ) -> Result<Self, PmmError> {
        let mut this = Self::new(nodes, mapper);
        for r in regions {
            if r.kind == kernel_info::boot::MemoryRegionKind::Usable && r.base >= LOW_MEMORY_LIMIT
            {
                this.add_region(PhysicalAddress::new(r.base), r.pages)?;
            }
        }
        info!(
            "pmm: {} pages in {} bitmap nodes",
            this.total_pages, this.used_nodes
        );
        Ok(this)
    }

    /// Manage `pages` pages starting at `base` (rounded up to a page).
    ///
    /// # Errors
    /// [`PmmError::MetadataExhausted`] when `nodes` is too small.
    #[allow(clippy::cast_possible_truncation)]
    pub fn add_region(&mut self, base: PhysicalAddress, pages: u64) -> Result<(), PmmError> {
        let start = align_up(base.as_u64(), PAGE_SIZE);
        let mut remaining = pages.saturating_sub((start - base.as_u64()) / PAGE_SIZE);
        let mut at = start;
        while remaining > 0 {
            let idx = self.used_nodes;
            let node = self
                .nodes
                .get_mut(idx as usize)
                .ok_or(PmmError::MetadataExhausted)?;
            let take = remaining.min(PAGES_PER_BITMAP as u64);
            *node = BitmapPage::EMPTY;
            node.base = at;
            node.capacity = take as u32;

            if self.tail == NIL {
                self.head = idx;
            } else {
                self.nodes[self.tail as usize].next = idx;
            }
            self.tail = idx;
            self.used_nodes += 1;

            self.total_pages += take as usize;
            self.free_pages += take as usize;
            debug!("pmm: node {idx} covers {at:#x}..{:#x}", at + take * PAGE_SIZE);
            at += take * PAGE_SIZE;
            remaining -= take;
        }
        Ok(())
    }

    fn chain(&self) -> impl Iterator<Item = usize> + '_ {
        let mut cur = self.head;
        core::iter::from_fn(move || {
            (cur != NIL).then(|| {
                let i = cur as usize;
                cur = self.nodes[i].next;
                i
            })
        })
    }

    fn zero(&self, pa: u64, pages: usize) {
        // SAFETY: the pages were just marked used; nobody else references them.
        unsafe {
            core::ptr::write_bytes(
                self.mapper.phys_to_ptr(PhysicalAddress::new(pa)),
                0,
                pages * PAGE_SIZE as usize,
            );
        }
    }

    /// Allocate and zero one page.
    pub fn alloc_page(&mut self) -> Option<PhysicalPage<Size4K>> {
        let (node, bit) = self.chain().find_map(|i| {
            let n = &self.nodes[i];
            (n.popcount < n.capacity)
                .then(|| n.first_clear())
                .flatten()
                .map(|bit| (i, bit))
        })?;
        let n = &mut self.nodes[node];
        n.set(bit);
        n.popcount += 1;
        let pa = n.base + bit as u64 * PAGE_SIZE;
        self.free_pages -= 1;
        self.zero(pa, 1);
        Some(PhysicalAddress::new(pa).page())
    }

    /// Allocate and zero `n` physically contiguous pages.
    #[allow(clippy::cast_possible_truncation)]
    pub fn alloc_pages(&mut self, n: usize) -> Option<PhysicalAddress> {
        if n == 0 {
            return None;
        }
        let (node, start) = self.chain().find_map(|i| {
            let node = &self.nodes[i];
            ((node.capacity - node.popcount) as usize >= n)
                .then(|| node.find_run(n))
                .flatten()
                .map(|s| (i, s))
        })?;
        let b = &mut self.nodes[node];
        for bit in start..start + n {
            b.set(bit);
        }
        b.popcount += n as u32;
        let pa = b.base + start as u64 * PAGE_SIZE;
        self.free_pages -= n;
        self.zero(pa, n);
        Some(PhysicalAddress::new(pa))
    }

    /// Return one page.
    ///
    /// # Errors
    /// [`PmmError::Unmanaged`] for addresses outside every node (or not page
    /// aligned), [`PmmError::DoubleFree`] if the page is already free.
    pub fn free_page(&mut self, pa: PhysicalAddress) -> Result<(), PmmError> {
        self.free_pages(pa, 1)
    }

    /// Return `n` contiguous pages allocated with [`Self::alloc_pages`].
    ///
    /// Nothing is freed unless every page checks out.
    ///
    /// # Errors
    /// See [`Self::free_page`].
    #[allow(clippy::cast_possible_truncation)]
    pub fn free_pages(&mut self, pa: PhysicalAddress, n: usize) -> Result<(), PmmError> {
        let addr = pa.as_u64();
        let node = self
            .chain()
            .find(|&i| self.nodes[i].contains(addr))
            .filter(|_| pa.is_aligned::<Size4K>())
            .ok_or(PmmError::Unmanaged(pa))?;
        let b = &mut self.nodes[node];
        let first = ((addr - b.base) / PAGE_SIZE) as usize;
        if first + n > b.capacity as usize {
            return Err(PmmError::Unmanaged(pa));
        }
        if let Some(bit) = (first..first + n).find(|&bit| !b.is_set(bit)) {
            let at = PhysicalAddress::new(b.base + bit as u64 * PAGE_SIZE);
            error!("pmm: double free of {at}");
            return Err(PmmError::DoubleFree(at));
        }
        for bit in first..first + n {
            b.clear(bit);
        }
        b.popcount -= n as u32;
        self.free_pages += n;
        Ok(())
    }

    #[must_use]
    pub const fn free_count(&self) -> usize {
        self.free_pages
    }

    #[must_use]
    pub const fn total_pages(&self) -> usize {
        self.total_pages
    }

    /// Whether every node's `popcount` matches its bit vector.
    #[must_use]
    pub fn popcounts_consistent(&self) -> bool {
        self.chain()
            .all(|i| self.nodes[i].count_ones() == self.nodes[i].popcount)
    }
}

/// The physical allocator shared by all cores.
pub struct PhysicalAllocator<'a, M: PhysMapper> {
    inner: SpinLock<BitmapFrameAllocator<'a, M>>,
}

impl<'a, M: PhysMapper> PhysicalAllocator<'a, M> {
    pub const fn new(inner: BitmapFrameAllocator<'a, M>) -> Self {
        Self {
            inner: SpinLock::new(inner),
        }
    }

    pub fn alloc_page(&self) -> Option<PhysicalPage<Size4K>> {
        self.inner.lock_irq().alloc_page()
    }

    pub fn alloc_pages(&self, n: usize) -> Option<PhysicalAddress> {
        self.inner.lock_irq().alloc_pages(n)
    }

    /// # Errors
    /// See [`BitmapFrameAllocator::free_page`].
    pub fn free_page(&self, pa: PhysicalAddress) -> Result<(), PmmError> {
        self.inner.lock_irq().free_page(pa)
    }

    /// # Errors
    /// See [`BitmapFrameAllocator::free_pages`].
    pub fn free_pages(&self, pa: PhysicalAddress, n: usize) -> Result<(), PmmError> {
        self.inner.lock_irq().free_pages(pa, n)
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock_irq().free_count()
    }

    pub fn total_pages(&self) -> usize {
        self.inner.lock_irq().total_pages()
    }

    pub fn with_locked<R>(&self, f: impl FnOnce(&mut BitmapFrameAllocator<'a, M>) -> R) -> R {
        f(&mut self.inner.lock_irq())
    }
}

impl<M: PhysMapper> FrameAlloc for PhysicalAllocator<'_, M> {
    fn alloc_4k(&self) -> Option<PhysicalPage<Size4K>> {
        self.alloc_page()
    }

    fn free_4k(&self, frame: PhysicalPage<Size4K>) {
        if let Err(e) = self.free_page(frame.base()) {
            error!("pmm: rejected frame {frame:?}: {e}");
        }
    }
}
