//! Simulated RAM and a recording arch layer for kernel tests.

use crate::ArchHooks;
use kernel_info::memory::CHUNK_SIZE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;
use std::cell::UnsafeCell;
use std::sync::Mutex;

/// Where simulated RAM starts.
pub const RAM_BASE: u64 = 0x4000_0000;

#[repr(align(4096))]
pub struct Frame(#[allow(dead_code)] [u8; 4096]);

pub struct TestPhys {
    frames: Box<[UnsafeCell<Frame>]>,
}

unsafe impl Sync for TestPhys {}
unsafe impl Send for TestPhys {}

impl TestPhys {
    /// `n` chunks of RAM from [`RAM_BASE`].
    pub fn chunks(n: u64) -> Self {
        let frames = usize::try_from(n * CHUNK_SIZE / 4096).unwrap();
        Self {
            frames: (0..frames).map(|_| UnsafeCell::new(Frame([0; 4096]))).collect(),
        }
    }

    pub fn len(&self) -> u64 {
        self.frames.len() as u64 * 4096
    }
}

impl PhysMapper for TestPhys {
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        let rel = pa.as_u64() - RAM_BASE;
        let idx = usize::try_from(rel >> 12).unwrap();
        let off = usize::try_from(rel & 0xFFF).unwrap();
        assert!(idx < self.frames.len(), "{pa} is outside simulated RAM");
        unsafe { UnsafeCell::raw_get(self.frames.as_ptr().add(idx)).cast::<u8>().add(off) }
    }
}

/// Every chunk of `phys`.
pub fn chunks(phys: &TestPhys) -> impl Iterator<Item = PhysicalAddress> + use<> {
    let n = phys.len() / CHUNK_SIZE;
    (0..n).map(|i| PhysicalAddress::new(RAM_BASE + i * CHUNK_SIZE))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Wake(usize),
    Shootdown(VirtualAddress),
    Route { line: usize, core: usize },
}

#[derive(Default)]
pub struct RecordingArch {
    events: Mutex<Vec<Event>>,
}

impl RecordingArch {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn wakes(&self) -> usize {
        self.events().iter().filter(|e| matches!(e, Event::Wake(_))).count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl ArchHooks for RecordingArch {
    fn send_wake_ipi(&self, core: usize) {
        self.events.lock().unwrap().push(Event::Wake(core));
    }

    fn tlb_shootdown(&self, va: VirtualAddress) {
        self.events.lock().unwrap().push(Event::Shootdown(va));
    }

    fn route_irq(&self, line: usize, core: usize) {
        self.events.lock().unwrap().push(Event::Route { line, core });
    }
}
