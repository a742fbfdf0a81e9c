//! # Kernel heap
//!
//! A first-fit free-list over one contiguous region. Every block starts
//! with a 16-byte [`NodeHeader`]; the next block follows the payload, the
//! previous one is reached through `prev`, so the list is walkable in both
//! directions without a separate index.
//!
//! ```text
//!  ┌──────────┬──────────────┬──────────┬──────────────┬─────
//!  │ header 0 │ payload 0    │ header 1 │ payload 1    │ ...
//!  └──────────┴──────────────┴──────────┴──────────────┴─────
//!   cookie | size:30 is_free has_next | prev
//! ```
//!
//! Freed blocks are merged with free neighbours right away, so two adjacent
//! blocks are never both free.

use bitfield_struct::bitfield;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use kernel_info::boot::MemoryRegion;
use kernel_info::memory::PAGE_SIZE;
use kernel_sync::SpinLock;
use log::{error, info};

const COOKIE: u32 = 0xABCD_ABCD;
const POISON: u8 = 0xCD;
const HEADER: usize = size_of::<NodeHeader>();
const UNIT: usize = 8;
const HEADER_UNITS: usize = HEADER / UNIT;
const MAX_UNITS: usize = (1 << 30) - 1;
const NO_PREV: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    #[error("kernel heap exhausted")]
    OutOfMemory,
    #[error("heap block at {0:#x} is corrupted")]
    Corrupted(usize),
    #[error("double free of heap block at {0:#x}")]
    DoubleFree(usize),
    #[error("{0:#x} was not allocated from this heap")]
    InvalidPointer(usize),
    #[error("heap region is too small")]
    RegionTooSmall,
}

#[bitfield(u32)]
struct NodeWord {
    /// Payload size in 8-byte units.
    #[bits(30)]
    size: u32,
    is_free: bool,
    has_next: bool,
}

#[repr(C)]
struct NodeHeader {
    cookie: u32,
    word: NodeWord,
    /// Offset of the previous header from the heap base, or `NO_PREV`.
    prev: u64,
}

const _: () = assert!(HEADER == 16);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub blocks: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
    pub used_bytes: usize,
    pub largest_free: usize,
}

pub struct KernelHeap {
    base: NonNull<u8>,
    len: usize,
}

// The heap owns its region; all access goes through `&mut self`.
unsafe impl Send for KernelHeap {}

impl KernelHeap {
    /// Take over `len` bytes at `base`. Anything beyond the largest block
    /// a header can describe (8 GiB) is left unused.
    ///
    /// # Errors
    /// [`HeapError::RegionTooSmall`] if not even one block fits.
    ///
    /// # Safety
    /// `base` must be 8-byte aligned and valid for reads and writes of
    /// `len` bytes for the lifetime of the heap, with no other users.
    pub unsafe fn new(base: NonNull<u8>, len: usize) -> Result<Self, HeapError> {
        debug_assert!(base.as_ptr().cast::<u64>().is_aligned());
        let len = (len & !(UNIT - 1)).min(HEADER + MAX_UNITS * UNIT);
        if len < HEADER + UNIT {
            return Err(HeapError::RegionTooSmall);
        }
        let this = Self { base, len };
        this.write_header(0, (len - HEADER) / UNIT, true, false, NO_PREV);
        info!("heap: {} KiB at {:p}", len / 1024, base);
        Ok(this)
    }

    #[inline]
    fn header(&self, at: usize) -> *mut NodeHeader {
        debug_assert!(at + HEADER <= self.len);
        unsafe { self.base.as_ptr().add(at).cast() }
    }

    #[inline]
    fn read(&self, at: usize) -> (u32, NodeWord, u64) {
        let h = unsafe { &*self.header(at) };
        (h.cookie, h.word, h.prev)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_header(&self, at: usize, units: usize, free: bool, has_next: bool, prev: u64) {
        let word = NodeWord::new()
            .with_size(units as u32)
            .with_is_free(free)
            .with_has_next(has_next);
        unsafe {
            self.header(at).write(NodeHeader {
                cookie: COOKIE,
                word,
                prev,
            });
        }
    }

    fn set_word(&self, at: usize, word: NodeWord) {
        unsafe { (*self.header(at)).word = word };
    }

    fn set_prev(&self, at: usize, prev: u64) {
        unsafe { (*self.header(at)).prev = prev };
    }

    #[inline]
    const fn next_of(at: usize, word: NodeWord) -> usize {
        at + HEADER + word.size() as usize * UNIT
    }

    #[inline]
    fn payload(&self, at: usize) -> NonNull<u8> {
        unsafe { self.base.add(at + HEADER) }
    }

    /// Header offsets in address order.
    fn blocks(&self) -> impl Iterator<Item = (usize, NodeWord)> + '_ {
        let mut cursor = Some(0);
        core::iter::from_fn(move || {
            let at = cursor?;
            let (_, word, _) = self.read(at);
            cursor = word.has_next().then(|| Self::next_of(at, word));
            Some((at, word))
        })
    }

    /// Allocate `size` bytes, 8-byte aligned.
    ///
    /// # Errors
    /// [`HeapError::OutOfMemory`] if no free block is large enough.
    #[allow(clippy::cast_possible_truncation)]
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        let units = size.max(1).div_ceil(UNIT);
        if units > MAX_UNITS {
            return Err(HeapError::OutOfMemory);
        }
        let (at, word) = self
            .blocks()
            .find(|(_, w)| w.is_free() && w.size() as usize >= units)
            .ok_or(HeapError::OutOfMemory)?;

        let have = word.size() as usize;
        if have - units >= HEADER_UNITS + 1 {
            // split off the tail as a new free block
            let rest = at + HEADER + units * UNIT;
            self.write_header(rest, have - units - HEADER_UNITS, true, word.has_next(), at as u64);
            if word.has_next() {
                self.set_prev(Self::next_of(at, word), rest as u64);
            }
            self.set_word(
                at,
                word.with_size(units as u32)
                    .with_is_free(false)
                    .with_has_next(true),
            );
        } else {
            self.set_word(at, word.with_is_free(false));
        }
        Ok(self.payload(at))
    }

    /// Like [`alloc`](Self::alloc), with the memory zeroed.
    ///
    /// # Errors
    /// See [`alloc`](Self::alloc).
    pub fn zalloc(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        let p = self.alloc(size)?;
        unsafe { ptr::write_bytes(p.as_ptr(), 0, size) };
        Ok(p)
    }

    fn offset_of(&self, ptr: NonNull<u8>) -> Result<usize, HeapError> {
        let addr = ptr.as_ptr() as usize;
        let base = self.base.as_ptr() as usize;
        let off = addr.wrapping_sub(base);
        if addr < base + HEADER || off >= self.len || off % UNIT != 0 {
            return Err(HeapError::InvalidPointer(addr));
        }
        Ok(off - HEADER)
    }

    /// Payload bytes of the block at `ptr`.
    ///
    /// # Errors
    /// See [`free`](Self::free).
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize, HeapError> {
        let at = self.offset_of(ptr)?;
        let (cookie, word, _) = self.read(at);
        if cookie != COOKIE {
            return Err(HeapError::Corrupted(ptr.as_ptr() as usize));
        }
        Ok(word.size() as usize * UNIT)
    }

    /// Release the block at `ptr`, merging it with free neighbours.
    ///
    /// # Errors
    /// [`HeapError::InvalidPointer`] for pointers outside the heap,
    /// [`HeapError::Corrupted`] if the header cookie is damaged and
    /// [`HeapError::DoubleFree`] if the block is already free. The heap is
    /// left untouched in all three cases.
    #[allow(clippy::cast_possible_truncation)]
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let addr = ptr.as_ptr() as usize;
        let mut at = self.offset_of(ptr)?;
        let (cookie, mut word, mut prev) = self.read(at);
        if cookie != COOKIE {
            error!("heap: bad cookie {cookie:#x} at {addr:#x}");
            return Err(HeapError::Corrupted(addr));
        }
        if word.is_free() {
            error!("heap: double free at {addr:#x}");
            return Err(HeapError::DoubleFree(addr));
        }

        unsafe { ptr::write_bytes(ptr.as_ptr(), POISON, word.size() as usize * UNIT) };
        word.set_is_free(true);

        if word.has_next() {
            let next = Self::next_of(at, word);
            let (_, nword, _) = self.read(next);
            if nword.is_free() {
                word = Self::absorb(word, nword);
                self.kill_header(next);
            }
        }

        if prev != NO_PREV {
            let p = prev as usize;
            let (_, pword, pprev) = self.read(p);
            if pword.is_free() {
                word = Self::absorb(pword, word);
                self.kill_header(at);
                at = p;
                prev = pprev;
            }
        }

        self.set_word(at, word);
        self.set_prev(at, prev);
        if word.has_next() {
            self.set_prev(Self::next_of(at, word), at as u64);
        }
        Ok(())
    }

    /// `left` grown by the header and payload of the adjacent `right`.
    ///
    /// Cannot overflow: the whole heap fits in one block.
    #[allow(clippy::cast_possible_truncation)]
    const fn absorb(left: NodeWord, right: NodeWord) -> NodeWord {
        let units = left.size() as usize + HEADER_UNITS + right.size() as usize;
        left.with_size(units as u32).with_has_next(right.has_next())
    }

    fn kill_header(&self, at: usize) {
        unsafe { ptr::write_bytes(self.header(at).cast::<u8>(), POISON, HEADER) };
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.blocks().fold(HeapStats::default(), |mut s, (_, w)| {
            let bytes = w.size() as usize * UNIT;
            s.blocks += 1;
            if w.is_free() {
                s.free_blocks += 1;
                s.free_bytes += bytes;
                s.largest_free = s.largest_free.max(bytes);
            } else {
                s.used_bytes += bytes;
            }
            s
        })
    }

    /// Walk the heap and verify cookies, back links, and coalescing.
    ///
    /// # Errors
    /// [`HeapError::Corrupted`] naming the first bad block.
    pub fn check(&self) -> Result<(), HeapError> {
        let mut prev: Option<(usize, bool)> = None;
        let mut end = 0;
        for (at, w) in self.blocks() {
            let (cookie, _, back) = self.read(at);
            let expected = prev.map_or(NO_PREV, |(p, _)| p as u64);
            let both_free = prev.is_some_and(|(_, f)| f) && w.is_free();
            if cookie != COOKIE || back != expected || both_free {
                return Err(HeapError::Corrupted(self.payload(at).as_ptr() as usize));
            }
            prev = Some((at, w.is_free()));
            end = Self::next_of(at, w);
        }
        if end > self.len {
            return Err(HeapError::Corrupted(end));
        }
        Ok(())
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.len
    }
}

/// The heap shared by every core, usable as `#[global_allocator]`.
pub struct LockedHeap {
    inner: SpinLock<Option<KernelHeap>>,
}

impl Default for LockedHeap {
    fn default() -> Self {
        Self::empty()
    }
}

impl LockedHeap {
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            inner: SpinLock::new(None),
        }
    }

    /// Install the heap region.
    ///
    /// # Errors
    /// See [`KernelHeap::new`].
    ///
    /// # Safety
    /// See [`KernelHeap::new`].
    pub unsafe fn init(&self, base: NonNull<u8>, len: usize) -> Result<(), HeapError> {
        let heap = unsafe { KernelHeap::new(base, len)? };
        *self.inner.lock_irq() = Some(heap);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock_irq().is_some()
    }

    pub fn with_heap<R>(&self, f: impl FnOnce(&mut KernelHeap) -> R) -> Option<R> {
        self.inner.lock_irq().as_mut().map(f)
    }

    pub fn stats(&self) -> HeapStats {
        self.with_heap(|h| h.stats()).unwrap_or_default()
    }
}

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let align = layout.align();
        let result = self.with_heap(|h| {
            if align <= UNIT {
                return h.alloc(layout.size());
            }
            // over-allocate and keep the raw pointer just below the result
            let raw = h.alloc(layout.size() + align)?;
            let offset = (raw.as_ptr() as usize + UNIT).next_multiple_of(align)
                - raw.as_ptr() as usize;
            unsafe {
                let aligned = raw.add(offset);
                aligned.sub(UNIT).cast::<*mut u8>().write(raw.as_ptr());
                Ok(aligned)
            }
        });
        match result {
            Some(Ok(p)) => p.as_ptr(),
            _ => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let Some(p) = NonNull::new(ptr) else { return };
        let raw = if layout.align() <= UNIT {
            p
        } else {
            unsafe { NonNull::new_unchecked(p.sub(UNIT).cast::<*mut u8>().read()) }
        };
        if let Some(Err(e)) = self.with_heap(|h| h.free(raw)) {
            error!("heap: dealloc of {ptr:p} failed: {e}");
        }
    }
}

/// Shrink the largest usable region by `percent` of its size (rounded up to
/// whole pages) and return the carved tail for the heap.
pub fn carve_heap(regions: &mut [MemoryRegion], percent: u64) -> Option<MemoryRegion> {
    let largest = regions
        .iter_mut()
        .filter(|r| r.kind == kernel_info::boot::MemoryRegionKind::Usable)
        .max_by_key(|r| r.pages)?;
    let pages = (largest.pages * PAGE_SIZE * percent)
        .div_ceil(100)
        .div_ceil(PAGE_SIZE);
    if pages == 0 || pages >= largest.pages {
        return None;
    }
    largest.pages -= pages;
    Some(MemoryRegion::usable(largest.end(), pages))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_sync::irq::interrupts_enabled;
    use proptest::prelude::*;

    struct Region(Vec<u64>);

    impl Region {
        fn new(bytes: usize) -> Self {
            Self(vec![0; bytes / 8])
        }

        fn heap(&mut self) -> KernelHeap {
            let len = self.0.len() * 8;
            let base = NonNull::new(self.0.as_mut_ptr().cast::<u8>()).unwrap();
            unsafe { KernelHeap::new(base, len).unwrap() }
        }
    }

    #[test]
    fn fresh_heap_is_one_free_block() {
        let mut r = Region::new(4096);
        let h = r.heap();
        let s = h.stats();
        assert_eq!(s.blocks, 1);
        assert_eq!(s.free_bytes, 4096 - HEADER);
        h.check().unwrap();
    }

    #[test]
    fn allocations_are_aligned_and_sized() {
        let mut r = Region::new(4096);
        let mut h = r.heap();
        for size in [1, 7, 8, 13, 100] {
            let p = h.alloc(size).unwrap();
            assert_eq!(p.as_ptr() as usize % 8, 0);
            assert!(h.usable_size(p).unwrap() >= size);
        }
        h.check().unwrap();
    }

    #[test]
    fn freed_block_is_reused_first_fit() {
        let mut r = Region::new(4096);
        let mut h = r.heap();
        let a = h.alloc(64).unwrap();
        let _b = h.alloc(64).unwrap();
        h.free(a).unwrap();
        assert_eq!(h.alloc(48).unwrap(), a);
        h.check().unwrap();
    }

    #[test]
    fn free_coalesces_both_neighbours() {
        let mut r = Region::new(4096);
        let mut h = r.heap();
        let a = h.alloc(64).unwrap();
        let b = h.alloc(64).unwrap();
        let c = h.alloc(64).unwrap();
        h.free(a).unwrap();
        h.free(c).unwrap();
        h.check().unwrap();
        h.free(b).unwrap();
        h.check().unwrap();
        let s = h.stats();
        assert_eq!(s.blocks, 1);
        assert_eq!(s.free_bytes, 4096 - HEADER);
    }

    #[test]
    fn freed_memory_is_poisoned_and_zalloc_clears_it() {
        let mut r = Region::new(4096);
        let mut h = r.heap();
        let a = h.alloc(32).unwrap();
        let _guard = h.alloc(8).unwrap();
        h.free(a).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(a.as_ptr(), 32) };
        assert!(bytes.iter().all(|b| *b == POISON));
        let z = h.zalloc(32).unwrap();
        assert_eq!(z, a);
        let bytes = unsafe { core::slice::from_raw_parts(z.as_ptr(), 32) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn double_free_and_foreign_pointers_are_rejected() {
        let mut r = Region::new(4096);
        let mut h = r.heap();
        let a = h.alloc(16).unwrap();
        let _b = h.alloc(16).unwrap();
        h.free(a).unwrap();
        assert_eq!(h.free(a), Err(HeapError::DoubleFree(a.as_ptr() as usize)));

        let mut outside = 0u64;
        let o = NonNull::from(&mut outside).cast::<u8>();
        assert!(matches!(h.free(o), Err(HeapError::InvalidPointer(_))));
    }

    #[test]
    fn damaged_cookie_is_reported() {
        let mut r = Region::new(4096);
        let mut h = r.heap();
        let a = h.alloc(16).unwrap();
        unsafe { a.sub(HEADER).cast::<u32>().write(0xDEAD_BEEF) };
        assert_eq!(h.free(a), Err(HeapError::Corrupted(a.as_ptr() as usize)));
    }

    #[test]
    fn exhaustion_is_an_error() {
        let mut r = Region::new(256);
        let mut h = r.heap();
        assert_eq!(h.alloc(4096), Err(HeapError::OutOfMemory));
        assert!(h.alloc(256 - HEADER).is_ok());
        assert_eq!(h.alloc(1), Err(HeapError::OutOfMemory));
    }

    #[test]
    fn global_alloc_honours_large_alignment() {
        let mut backing = vec![0u64; 8192 / 8];
        let heap = LockedHeap::empty();
        unsafe {
            heap.init(NonNull::new(backing.as_mut_ptr().cast()).unwrap(), 8192)
                .unwrap();
        }
        for align in [16, 64, 256, 4096] {
            let layout = Layout::from_size_align(24, align).unwrap();
            let p = unsafe { heap.alloc(layout) };
            assert!(!p.is_null());
            assert_eq!(p as usize % align, 0);
            unsafe { heap.dealloc(p, layout) };
        }
        assert_eq!(heap.stats().blocks, 1);
    }

    #[test]
    fn locked_heap_masks_interrupts_while_held() {
        let mut backing = vec![0u64; 4096 / 8];
        let heap = LockedHeap::empty();
        assert!(!heap.is_initialized());
        assert!(interrupts_enabled());
        unsafe {
            heap.init(NonNull::new(backing.as_mut_ptr().cast()).unwrap(), 4096)
                .unwrap();
        }
        assert!(heap.is_initialized());
        heap.with_heap(|_| assert!(!interrupts_enabled())).unwrap();

        let layout = Layout::from_size_align(64, 8).unwrap();
        let p = unsafe { heap.alloc(layout) };
        assert!(!p.is_null());
        unsafe { heap.dealloc(p, layout) };
        assert!(interrupts_enabled());
    }

    #[test]
    fn carving_takes_the_tail_of_the_largest_region() {
        let mut regions = [
            MemoryRegion::usable(0x10_0000, 100),
            MemoryRegion::usable(0x100_0000, 1000),
        ];
        let heap = carve_heap(&mut regions, 10).unwrap();
        assert_eq!(heap.pages, 100);
        assert_eq!(regions[1].pages, 900);
        assert_eq!(heap.base, regions[1].end());
        assert_eq!(regions[0].pages, 100);
    }

    proptest! {
        #[test]
        fn random_alloc_free_keeps_the_heap_consistent(ops in prop::collection::vec((0usize..300, any::<prop::sample::Index>()), 1..150)) {
            let mut r = Region::new(16 * 1024);
            let mut h = r.heap();
            let total = h.stats().free_bytes;
            let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();
            for (size, pick) in ops {
                if size > 0 {
                    if let Ok(p) = h.alloc(size) {
                        let end = p.as_ptr() as usize + size;
                        for &(q, n) in &live {
                            let qs = q.as_ptr() as usize;
                            prop_assert!(end <= qs || p.as_ptr() as usize >= qs + n);
                        }
                        live.push((p, size));
                    }
                } else if !live.is_empty() {
                    let (p, _) = live.swap_remove(pick.index(live.len()));
                    prop_assert!(h.free(p).is_ok());
                }
                prop_assert!(h.check().is_ok());
            }
            for (p, _) in live {
                prop_assert!(h.free(p).is_ok());
            }
            prop_assert_eq!(h.stats().free_bytes, total);
            prop_assert_eq!(h.stats().blocks, 1);
        }
    }
}
