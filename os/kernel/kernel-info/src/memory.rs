//! # Memory Layout

/// Base page size.
pub const PAGE_SIZE: u64 = 4096;

/// Size of a pool chunk (one 2 MiB large page).
pub const CHUNK_SIZE: u64 = 2 * 1024 * 1024;

/// 4 KiB pages per pool chunk.
#[allow(clippy::cast_possible_truncation)]
pub const PAGES_PER_CHUNK: usize = (CHUNK_SIZE / PAGE_SIZE) as usize;

/// Physical memory below this address is never handed to the allocators
/// (real-mode IVT, BIOS data, legacy holes, SMP trampoline).
pub const LOW_MEMORY_LIMIT: u64 = 0x0010_0000; // 1 MiB

/// Start of the search window for anonymous user mappings.
pub const USER_VMEM_BASE: u64 = 0xA000_0000;

/// End of the lower canonical half.
pub const USERSPACE_END: u64 = 0x0000_8000_0000_0000;

/// First address of the kernel half; PML4 entries 256..512 are shared by
/// every address space.
pub const KERNEL_HALF_BASE: u64 = 0xffff_8000_0000_0000;

/// First PML4 index of the kernel half.
pub const KERNEL_PML4_START: usize = 256;

/// Higher Half Direct Map base: `HHDM_BASE + pa` aliases physical memory.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Where the kernel image executes.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Percentage of the largest usable region carved out for the kernel heap.
pub const HEAP_PERCENT: u64 = 10;

/// Kernel stack size per thread.
pub const KERNEL_STACK_SIZE: usize = 32 * 1024;

const _: () = {
    assert!(CHUNK_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(PAGES_PER_CHUNK == 512);
    assert!(KERNEL_STACK_SIZE.is_multiple_of(PAGE_SIZE as usize));
    assert!(USER_VMEM_BASE < USERSPACE_END);
    assert!(HHDM_BASE >= KERNEL_HALF_BASE);
    assert!(KERNEL_BASE > HHDM_BASE);
    assert!(KERNEL_HALF_BASE >> 39 & 0x1FF == KERNEL_PML4_START as u64);
};
