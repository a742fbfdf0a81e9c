//! Simulated RAM and a frame allocator for environment tests.

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use kernel_vmem::{FrameAlloc, PhysMapper};
use std::cell::UnsafeCell;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

#[repr(align(4096))]
pub struct Frame(#[allow(dead_code)] [u8; 4096]);

/// Physical address `pa` lives in frame `pa >> 12`.
pub struct TestPhys {
    frames: Box<[UnsafeCell<Frame>]>,
}

unsafe impl Sync for TestPhys {}
unsafe impl Send for TestPhys {}

impl TestPhys {
    pub fn with_frames(n: usize) -> Self {
        Self {
            frames: (0..n).map(|_| UnsafeCell::new(Frame([0; 4096]))).collect(),
        }
    }

    pub fn byte(&self, pa: PhysicalAddress) -> u8 {
        unsafe { *self.phys_to_ptr(pa) }
    }
}

impl PhysMapper for TestPhys {
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        let idx = usize::try_from(pa.as_u64() >> 12).unwrap();
        let off = usize::try_from(pa.as_u64() & 0xFFF).unwrap();
        unsafe { UnsafeCell::raw_get(self.frames.as_ptr().add(idx)).cast::<u8>().add(off) }
    }
}

/// Hands out frames `[first, last)` of a [`TestPhys`], zeroed, LIFO reuse.
pub struct Frames<'p> {
    phys: &'p TestPhys,
    free: Mutex<Vec<PhysicalPage<Size4K>>>,
    pub live: AtomicUsize,
}

impl<'p> Frames<'p> {
    pub fn new(phys: &'p TestPhys, first: u64, last: u64) -> Self {
        Self {
            phys,
            free: Mutex::new(
                (first..last)
                    .rev()
                    .map(|f| PhysicalAddress::new(f << 12).page())
                    .collect(),
            ),
            live: AtomicUsize::new(0),
        }
    }

    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

impl FrameAlloc for Frames<'_> {
    fn alloc_4k(&self) -> Option<PhysicalPage<Size4K>> {
        let frame = self.free.lock().unwrap().pop()?;
        unsafe { kernel_vmem::zero_frame(self.phys, frame.base()) };
        self.live.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    fn free_4k(&self, frame: PhysicalPage<Size4K>) {
        self.live.fetch_sub(1, Ordering::Relaxed);
        self.free.lock().unwrap().push(frame);
    }
}
