//! Kernel objects reachable through handles.

use crate::Mailbox;
use core::fmt;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, align_up};
use kernel_sched::ThreadId;

/// Generational index of an environment in the kernel's env arena.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EnvId {
    index: u32,
    generation: u32,
}

impl EnvId {
    #[inline]
    #[must_use]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnvId({}v{})", self.index, self.generation)
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "env{}v{}", self.index, self.generation)
    }
}

/// A window of physical memory that can be mapped into environments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vmo {
    paddr: PhysicalAddress,
    size: u64,
}

impl Vmo {
    /// A VMO over `[addr, addr + size)`, size rounded up to whole pages.
    ///
    /// Returns `None` if `addr` is not page aligned.
    #[must_use]
    pub const fn physical(addr: PhysicalAddress, size: u64) -> Option<Self> {
        if addr.as_u64() % PAGE_SIZE != 0 {
            return None;
        }
        Some(Self {
            paddr: addr,
            size: align_up(size, PAGE_SIZE),
        })
    }

    #[inline]
    #[must_use]
    pub const fn paddr(&self) -> PhysicalAddress {
        self.paddr
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }
}

/// Everything a handle can name.
///
/// Objects are shared between handle tables with [`Arc`](alloc::sync::Arc);
/// dispatch is by `match`, so there is no invalid kind.
#[derive(Debug)]
pub enum KObject {
    Vmo(Vmo),
    Thread(ThreadId),
    Env(EnvId),
    Mailbox(Mailbox),
}

impl KObject {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Vmo(_) => "vmo",
            Self::Thread(_) => "thread",
            Self::Env(_) => "env",
            Self::Mailbox(_) => "mailbox",
        }
    }

    #[must_use]
    pub const fn as_vmo(&self) -> Option<&Vmo> {
        match self {
            Self::Vmo(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_mailbox(&self) -> Option<&Mailbox> {
        match self {
            Self::Mailbox(m) => Some(m),
            _ => None,
        }
    }
}
