//! # Kernel core
//!
//! Ties the subsystems together behind one [`Kernel`] value:
//!
//! ```text
//!  timer IRQ ──► on_timer ──► core's Scheduler ──► TimerOutcome (regs, CR3, deadline)
//!  #PF       ──► on_page_fault ──► Env::resolve_fault ──► AddressSpace::install
//!  device IRQ ──► on_device_irq ──► IrqTable callback
//!  syscalls  ──► sleep / wait / wake_* / thread_* / env_*
//! ```
//!
//! Nothing here touches hardware; the arch layer supplies IPIs, TLB
//! shootdowns and interrupt routing through [`ArchHooks`] and applies the
//! returned [`TimerOutcome`].

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod arch;
mod arena;
mod cpu;
mod irq;
mod kernel;

#[cfg(test)]
mod test_support;

pub use crate::arch::{ArchHooks, Shootdown};
pub use crate::cpu::{CpuState, PerCpu};
pub use crate::irq::{IrqHandler, IrqTable};
pub use crate::kernel::{Kernel, TimerOutcome};

use kernel_alloc::PoolError;
use kernel_env::{EnvError, EnvId, FaultError, HandleError};
use kernel_sched::{SchedError, ThreadId};
use kernel_vmem::VmemError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("no cores to run on")]
    NoCores,
    #[error("core {0} does not exist")]
    NoSuchCore(usize),
    #[error("thread {0} does not exist")]
    NoSuchThread(ThreadId),
    #[error("{0} does not exist")]
    NoSuchEnv(EnvId),
    #[error("thread table is full")]
    TooManyThreads,
    #[error("environment table is full")]
    TooManyEnvs,
    #[error("interrupt line {0} does not exist")]
    NoSuchLine(usize),
    #[error("interrupt line {0} is already bound")]
    LineTaken(usize),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Vmem(#[from] VmemError),
    #[error(transparent)]
    Sched(#[from] SchedError),
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error(transparent)]
    Fault(#[from] FaultError),
    #[error(transparent)]
    Handle(#[from] HandleError),
}
