//! # Virtual Memory Support
//!
//! x86-64 four-level page tables with lock-free updates.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        └───► PTE   → maps 4 KiB page
//!   │        │        └────────────► PDE   → PS=1 → 2 MiB page
//!   │        └─────────────────────► PDPTE → PS=1 → 1 GiB page
//!   └──────────────────────────────► PML4E
//! ```
//!
//! ## Concurrency
//!
//! Every entry is an `AtomicU64` (see [`PageTable`]). Two kinds of edits
//! exist:
//!
//! * **Forward progress** (creating tables, adding a leaf, widening rights)
//!   is done with compare-and-swap loops and may run on many cores at once
//!   while the owning address space is held in shared mode. A lost race
//!   means somebody else installed an equal or wider entry, so the loser
//!   re-reads and carries on, freeing any table it had speculatively
//!   allocated.
//! * **Backward progress** (clearing or narrowing) requires the exclusive
//!   lock and a cross-core TLB shootdown by the caller.
//!
//! ## Seams
//!
//! * [`FrameAlloc`] hands out zeroed 4 KiB frames for page tables and
//!   takes back frames that lost an install race.
//! * [`PhysMapper`] turns a physical address into a pointer (HHDM in the
//!   kernel, a vector of frames in tests).
//! * [`TlbInvalidate`] invalidates the local TLB after an edit.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod address_space;
mod fault;
mod page_entry_bits;
mod page_table;
mod tlb;

#[cfg(test)]
pub(crate) mod test_support;

pub use crate::address_space::AddressSpace;
pub use crate::fault::{PageFaultError, PteUpdate};
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::{ENTRIES, PageTable};
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use crate::tlb::LocalTlb;
pub use crate::tlb::{NoTlb, TlbInvalidate};

use alloc::sync::Arc;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmemError {
    #[error("address or size is not page aligned")]
    Unaligned,
    #[error("out of page-table frames")]
    OutOfPageTables,
    #[error("a large page already maps this range")]
    LargePageConflict,
    #[error("address is not mapped")]
    NotMapped,
}

/// Source of zeroed **physical** 4 KiB frames for page tables and pages.
///
/// Implementations must be callable from several cores at once.
pub trait FrameAlloc {
    /// Allocate one zeroed, 4 KiB aligned frame; `None` when exhausted.
    fn alloc_4k(&self) -> Option<PhysicalPage<Size4K>>;

    /// Give a frame back. The frame must no longer be referenced by any
    /// page table or pointer.
    fn free_4k(&self, frame: PhysicalPage<Size4K>);
}

impl<F: FrameAlloc + ?Sized> FrameAlloc for &F {
    #[inline]
    fn alloc_4k(&self) -> Option<PhysicalPage<Size4K>> {
        (**self).alloc_4k()
    }

    #[inline]
    fn free_4k(&self, frame: PhysicalPage<Size4K>) {
        (**self).free_4k(frame);
    }
}

/// Converts physical addresses to usable pointers in the current address
/// space (HHDM in the kernel).
pub trait PhysMapper {
    /// Pointer to the byte at `pa`.
    ///
    /// The returned pointer is valid for as long as the mapping exists; the
    /// caller decides what type lives there.
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8;
}

impl<M: PhysMapper + ?Sized> PhysMapper for &M {
    #[inline]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        (**self).phys_to_ptr(pa)
    }
}

impl<M: PhysMapper + ?Sized> PhysMapper for Arc<M> {
    #[inline]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        (**self).phys_to_ptr(pa)
    }
}

/// View the frame at `pa` as a page table.
///
/// # Safety
/// `pa` must be the base of a frame that holds a page table (or is zeroed
/// and about to become one) for the lifetime `'a`.
#[inline]
pub unsafe fn table_at<'a, M: PhysMapper + ?Sized>(m: &M, pa: PhysicalAddress) -> &'a PageTable {
    debug_assert!(pa.is_aligned::<Size4K>());
    unsafe { &*m.phys_to_ptr(pa).cast::<PageTable>() }
}

/// Fill the 4 KiB frame at `pa` with zeros.
///
/// # Safety
/// The frame must be owned by the caller and mapped writable.
#[inline]
pub unsafe fn zero_frame<M: PhysMapper + ?Sized>(m: &M, pa: PhysicalAddress) {
    unsafe { core::ptr::write_bytes(m.phys_to_ptr(pa), 0, 4096) };
}
