//! # Kernel Configuration and Boot Interface
//!
//! Layout constants, tunables and the loader hand-off record shared by every
//! kernel crate.
//!
//! * [`boot`]: the `#[repr(C)]` [`BootInfo`](boot::BootInfo) produced by the
//!   loader, its memory map and per-core descriptors.
//! * [`memory`]: virtual memory layout and allocator granularities.
//! * [`config`]: scheduler tunables and the runtime [`KernelConfig`](config::KernelConfig).
//!
//! ## Virtual Memory Layout
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │  unused (null guard, low I/O)   │
//! USER_VMEM_BASE        ├─────────────────────────────────┤ 0x0000_0000_a000_0000
//!                       │  user mappings (vmem_map)       │
//! USERSPACE_END         ├─────────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │  non-canonical hole             │
//! KERNEL_HALF_BASE      ├─────────────────────────────────┤ 0xffff_8000_0000_0000
//!                       │  shared kernel half (PML4 256+) │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │  higher half direct map         │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │  kernel image                   │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod boot;
pub mod config;
pub mod memory;
