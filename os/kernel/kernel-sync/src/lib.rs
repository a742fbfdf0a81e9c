//! # Kernel synchronization primitives
//!
//! Everything here is `no_std` and allocation free:
//!
//! * [`SpinLock`]: test-and-test-and-set lock used for short critical sections
//!   (scheduler queues, wait queues, the heap, the bitmap allocator).
//! * [`RwLock`]: a single-word reader/writer lock guarding address spaces.
//!   Shared holders perform additive page-table edits concurrently; revoking
//!   edits take the exclusive side.
//! * [`SyncOnceCell`]: one-shot initialization of process-wide state.
//! * [`irq`]: interrupt masking ([`IrqGuard`]) and the [`InterruptContext`]
//!   token that marks code reachable from interrupt entry.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod rw_lock;
mod spin_lock;
mod sync_once_cell;

pub use irq::{InterruptContext, IrqGuard};
pub use rw_lock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use spin_lock::{SpinLock, SpinLockGuard, SpinLockIrqGuard};
pub use sync_once_cell::SyncOnceCell;
