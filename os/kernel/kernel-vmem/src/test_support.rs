//! Simulated physical memory for page-table tests.

use crate::{FrameAlloc, PhysMapper};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use std::cell::UnsafeCell;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// A 4 KiB-aligned raw frame.
#[repr(align(4096))]
pub struct Aligned4K(#[allow(dead_code)] [u8; 4096]);

/// "RAM" as a vector of frames; physical address `pa` lives in frame `pa >> 12`.
pub struct TestPhys {
    frames: Box<[UnsafeCell<Aligned4K>]>,
}

// Frames are only touched through atomics (page tables) or by their owner.
unsafe impl Sync for TestPhys {}
unsafe impl Send for TestPhys {}

impl TestPhys {
    pub fn with_frames(n: usize) -> Self {
        Self {
            frames: (0..n).map(|_| UnsafeCell::new(Aligned4K([0; 4096]))).collect(),
        }
    }
}

impl PhysMapper for TestPhys {
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        let idx = usize::try_from(pa.as_u64() >> 12).unwrap();
        let off = usize::try_from(pa.as_u64() & 0xFFF).unwrap();
        unsafe { self.frames[idx].get().cast::<u8>().add(off) }
    }
}

/// Bump allocator over `[start, end)` that reuses returned frames.
pub struct BumpAlloc<'p> {
    phys: &'p TestPhys,
    next: AtomicU64,
    end: u64,
    freed: Mutex<Vec<PhysicalPage<Size4K>>>,
    pub live: AtomicUsize,
}

impl<'p> BumpAlloc<'p> {
    pub fn new(phys: &'p TestPhys, start: u64, end: u64) -> Self {
        Self {
            phys,
            next: AtomicU64::new(start),
            end,
            freed: Mutex::new(Vec::new()),
            live: AtomicUsize::new(0),
        }
    }
}

impl FrameAlloc for BumpAlloc<'_> {
    fn alloc_4k(&self) -> Option<PhysicalPage<Size4K>> {
        let frame = if let Some(f) = self.freed.lock().unwrap().pop() {
            f
        } else {
            let pa = self.next.fetch_add(4096, Ordering::Relaxed);
            if pa + 4096 > self.end {
                return None;
            }
            PhysicalAddress::new(pa).page()
        };
        unsafe { crate::zero_frame(self.phys, frame.base()) };
        self.live.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    fn free_4k(&self, frame: PhysicalPage<Size4K>) {
        self.live.fetch_sub(1, Ordering::Relaxed);
        self.freed.lock().unwrap().push(frame);
    }
}
