//! # HHDM-based PhysMapper for Kernel Virtual Memory
//!
//! With a higher-half direct map every physical address `pa` is readable at
//! `HHDM_BASE + pa`, so translating is a single addition.
//!
//! ```rust
//! use kernel_alloc::phys_mapper::HhdmPhysMapper;
//! use kernel_memory_addresses::PhysicalAddress;
//! use kernel_vmem::PhysMapper;
//!
//! let p = HhdmPhysMapper.phys_to_ptr(PhysicalAddress::new(0x1234_0000));
//! assert_eq!(p as u64, kernel_info::memory::HHDM_BASE + 0x1234_0000);
//! ```

use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for kernels with a higher-half direct map.
///
/// The HHDM must cover every physical address handed to it; the returned
/// pointer is only dereferenceable under that mapping.
#[derive(Debug, Default, Clone, Copy)]
pub struct HhdmPhysMapper;

impl PhysMapper for HhdmPhysMapper {
    #[inline]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        (HHDM_BASE + pa.as_u64()) as *mut u8
    }
}
