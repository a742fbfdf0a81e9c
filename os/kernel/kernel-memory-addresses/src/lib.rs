//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw addresses and page bases used by the
//! allocators and the page-table manager.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Physical memory or MMIO. |
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Page-table translated memory. |
//!
//! Page sizes are marker types implementing [`PageSize`]: [`Size4K`],
//! [`Size2M`] and [`Size1G`].
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0000_7FFF_8000_1234);
//! let page = va.page::<Size4K>();
//! assert_eq!(page.base().as_u64(), 0x0000_7FFF_8000_1000);
//! assert_eq!(va.offset::<Size4K>(), 0x234);
//!
//! // bit 47 set: bits 63..48 are replicated
//! let high = VirtualAddress::new(0x0000_8000_0000_0000).canonical();
//! assert_eq!(high.as_u64(), 0xFFFF_8000_0000_0000);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod page_size;
mod physical_address;
mod virtual_address;

pub use page_size::{PageSize, Size1G, Size2M, Size4K};
pub use physical_address::{PhysicalAddress, PhysicalPage};
pub use virtual_address::{TableIndices, VirtualAddress, VirtualPage};

/// Align `x` down to a power-of-two `align`.
///
/// ```
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0x1234, 0x1000), 0x1000);
/// ```
#[inline]
#[must_use]
pub const fn align_down(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    x & !(align - 1)
}

/// Align `x` up to a power-of-two `align`.
///
/// ```
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0x1001, 0x1000), 0x2000);
/// assert_eq!(align_up(0x1000, 0x1000), 0x1000);
/// ```
#[inline]
#[must_use]
pub const fn align_up(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (x + align - 1) & !(align - 1)
}

#[inline]
#[must_use]
pub const fn is_aligned(x: u64, align: u64) -> bool {
    x & (align - 1) == 0
}
