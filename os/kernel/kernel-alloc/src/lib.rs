//! # Kernel Memory Allocation
//!
//! Physical memory flows through three layers:
//!
//! ```text
//!  ┌───────────────────────────────────────────────┐
//!  │ KernelHeap / LockedHeap      (heap)           │  variable-size kernel metadata
//!  ├───────────────────────────────────────────────┤
//!  │ PagePool                     (page_pool)      │  per-core 2 MiB chunks + 4 KiB free-lists
//!  │   └─ ChunkDeque              (chunk_deque)    │  Chase-Lev work stealing
//!  ├───────────────────────────────────────────────┤
//!  │ PhysicalAllocator            (bitmap)         │  one bit per 4 KiB page, boot regions ≥ 1 MiB
//!  └───────────────────────────────────────────────┘
//! ```
//!
//! The heap region is carved out of the largest usable region before the
//! bitmap allocator sees the memory map ([`carve_heap`]). Pool chunks are
//! contiguous page runs taken from the bitmap allocator.
//!
//! Every layer reaches physical memory through a
//! [`PhysMapper`](kernel_vmem::PhysMapper); in the kernel that is the
//! higher-half direct map ([`HhdmPhysMapper`]).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod bitmap;
pub mod chunk_deque;
pub mod heap;
pub mod page_pool;
pub mod phys_mapper;

#[cfg(test)]
pub(crate) mod test_support;

pub use bitmap::{BitmapFrameAllocator, BitmapPage, PhysicalAllocator, PmmError};
pub use chunk_deque::{ChunkDeque, Steal};
pub use heap::{HeapError, HeapStats, KernelHeap, LockedHeap, carve_heap};
pub use page_pool::{CorePool, PagePool, PoolError};
pub use phys_mapper::HhdmPhysMapper;
