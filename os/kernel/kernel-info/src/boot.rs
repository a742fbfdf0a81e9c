//! # Kernel Boot Information
//!
//! The loader hands the kernel one [`BootInfo`]. The first three fields are
//! read by the SMP trampoline at fixed offsets and must not move.

use core::mem::offset_of;

/// Kernel function pointer.
///
/// # ABI
/// `win64`, since the kernel is entered from a UEFI (PE/COFF) application.
pub type KernelEntryFn = extern "win64" fn(*const BootInfo) -> !;

/// Information the kernel needs right after `ExitBootServices`.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct BootInfo {
    /// Physical address of the loader-built PML4.
    pub pml4_root: u64,
    /// Pointer to `core_count` [`CoreDescriptor`]s.
    pub cores_ptr: u64,
    /// Number of logical cores discovered by the loader.
    pub core_count: u64,

    /// Firmware memory map, already converted to [`MemoryRegion`]s.
    pub mmap: MemoryMapInfo,

    /// RSDP (ACPI 2.0+) physical address, or 0 if not provided.
    pub rsdp_addr: u64,

    /// Invariant TSC frequency, or 0 when unknown.
    pub tsc_freq_hz: u64,

    /// Framebuffer information, passed from UEFI GOP.
    pub fb: FramebufferInfo,
}

const _: () = {
    assert!(offset_of!(BootInfo, pml4_root) == 0);
    assert!(offset_of!(BootInfo, cores_ptr) == 8);
    assert!(offset_of!(BootInfo, core_count) == 16);
};

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MemoryMapInfo {
    /// Pointer to an array of [`MemoryRegion`].
    pub regions_ptr: u64,
    /// Number of entries (not bytes).
    pub region_count: u64,
}

/// One physically contiguous range of the firmware memory map.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub kind: MemoryRegionKind,
    /// Physical base address (page aligned).
    pub base: u64,
    /// Length in 4 KiB pages.
    pub pages: u64,
}

impl MemoryRegion {
    #[must_use]
    pub const fn usable(base: u64, pages: u64) -> Self {
        Self {
            kind: MemoryRegionKind::Usable,
            base,
            pages,
        }
    }

    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base + self.pages * crate::memory::PAGE_SIZE
    }

    #[must_use]
    pub const fn len_bytes(&self) -> u64 {
        self.pages * crate::memory::PAGE_SIZE
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
    /// Conventional memory free for the kernel.
    Usable = 0,
    /// Firmware, MMIO, or otherwise reserved.
    Reserved = 1,
    /// ACPI tables; reclaimable after parsing.
    AcpiReclaimable = 2,
    /// Loader code/data, including the kernel image and this record.
    LoaderData = 3,
}

/// Per-core record filled by the loader.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreDescriptor {
    pub lapic_id: u32,
    pub flags: u32,
    /// Top of the kernel stack prepared for the core's entry.
    pub stack_top: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    /// Linear framebuffer base address (physical).
    pub framebuffer_ptr: u64,
    /// Total framebuffer size in **bytes**.
    pub framebuffer_size: u64,
    pub framebuffer_width: u64,
    pub framebuffer_height: u64,
    /// Pixels per scanline.
    pub framebuffer_stride: u64,
}

/// Borrowed, typed view of a [`BootInfo`].
#[derive(Debug, Clone, Copy)]
pub struct BootView<'a> {
    pub pml4_root: u64,
    pub regions: &'a [MemoryRegion],
    pub cores: &'a [CoreDescriptor],
}

impl BootInfo {
    /// Interpret the raw pointers of the record.
    ///
    /// # Safety
    /// `mmap.regions_ptr` and `cores_ptr` must point to live arrays of the
    /// advertised lengths for `'a`, readable through the current mapping.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub unsafe fn view<'a>(&'a self) -> BootView<'a> {
        let regions = if self.mmap.region_count == 0 {
            &[][..]
        } else {
            unsafe {
                core::slice::from_raw_parts(
                    self.mmap.regions_ptr as *const MemoryRegion,
                    self.mmap.region_count as usize,
                )
            }
        };
        let cores = if self.core_count == 0 {
            &[][..]
        } else {
            unsafe {
                core::slice::from_raw_parts(
                    self.cores_ptr as *const CoreDescriptor,
                    self.core_count as usize,
                )
            }
        };
        BootView {
            pml4_root: self.pml4_root,
            regions,
            cores,
        }
    }
}

impl BootView<'_> {
    /// Usable regions the allocators may manage (above the low-memory limit).
    pub fn usable_regions(&self) -> impl Iterator<Item = &MemoryRegion> + '_ {
        self.regions.iter().filter(|r| {
            r.kind == MemoryRegionKind::Usable
                && r.base >= crate::memory::LOW_MEMORY_LIMIT
                && r.pages > 0
        })
    }
}
