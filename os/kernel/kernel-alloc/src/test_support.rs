//! Simulated physical memory for allocator tests.

use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;
use std::cell::UnsafeCell;

#[repr(align(4096))]
pub struct Aligned4K(#[allow(dead_code)] [u8; 4096]);

/// `len` bytes of "RAM" starting at physical address `base`.
pub struct TestPhys {
    base: u64,
    frames: Box<[UnsafeCell<Aligned4K>]>,
}

// Each frame is owned by whoever allocated it.
unsafe impl Sync for TestPhys {}
unsafe impl Send for TestPhys {}

impl TestPhys {
    pub fn new(base: u64, len: u64) -> Self {
        let n = usize::try_from(len / 4096).unwrap();
        Self {
            base,
            frames: (0..n).map(|_| UnsafeCell::new(Aligned4K([0; 4096]))).collect(),
        }
    }

    pub fn fill(&self, pa: PhysicalAddress, len: usize, byte: u8) {
        unsafe { core::ptr::write_bytes(self.phys_to_ptr(pa), byte, len) };
    }

    pub fn bytes(&self, pa: PhysicalAddress, len: usize) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.phys_to_ptr(pa), len) }
    }
}

impl PhysMapper for TestPhys {
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        let rel = pa.as_u64() - self.base;
        let idx = usize::try_from(rel >> 12).unwrap();
        let off = usize::try_from(rel & 0xFFF).unwrap();
        assert!(idx < self.frames.len());
        unsafe {
            UnsafeCell::raw_get(self.frames.as_ptr().add(idx))
                .cast::<u8>()
                .add(off)
        }
    }
}
