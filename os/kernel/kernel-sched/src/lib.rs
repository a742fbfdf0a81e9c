//! # Per-CPU Scheduling
//!
//! Every core owns one [`Scheduler`]; threads are assigned to a core when
//! they are created and never migrate afterwards.
//!
//! ```text
//!              spawn / wake
//!                   │
//!                   ▼
//!   ┌────────── active (by exec_time) ◄──────────┐
//!   │                                            │ wake_time ≤ now
//!   │ pick_next                                  │
//!   ▼                                            │
//! running ── sleep_current ──► waiters (by wake_time)
//!   │
//!   └─ block_current ──► WaitQueue ── wake_one / wake_all ──► wake
//! ```
//!
//! A thread is in exactly one place at a time. The scheduler never holds
//! thread memory, only a copy of its [`SchedEntry`] keyed by [`ThreadId`],
//! so removing a thread is an unlink by id.
//!
//! All times are microseconds of a monotonic clock supplied by the caller.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod scheduler;
mod thread_id;
mod time_queue;
mod wait_queue;

pub use crate::scheduler::{Pick, Scheduler};
pub use crate::thread_id::ThreadId;
pub use crate::time_queue::{SchedEntry, TimeQueue};
pub use crate::wait_queue::{Parked, WaitQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SchedError {
    #[error("scheduler is full ({0} threads)")]
    QueueFull(usize),
    #[error("no thread is running on this core")]
    NotRunning,
}
