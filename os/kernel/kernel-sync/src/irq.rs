//! Interrupt masking and the interrupt-context marker.

use core::marker::PhantomData;

/// `RFLAGS.IF`
const RFLAGS_IF: u64 = 1 << 9;

/// Disables hardware interrupts (`cli`).
///
/// # Safety & Privilege
///
/// Must only be called in contexts where `cli` is permitted.
#[inline]
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn cli_stop_interrupts() {
    unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
}

/// Enables hardware interrupts (`sti`).
///
/// # Safety & Privilege
///
/// Must only be called in contexts where `sti` is permitted.
#[inline]
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn sti_enable_interrupts() {
    unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
}

/// Returns the current `RFLAGS` value (via `pushfq/pop`).
#[inline]
#[must_use]
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn rflags() -> u64 {
    let r: u64;
    unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
    r
}

/// Returns whether interrupts are enabled on this core.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        rflags() & RFLAGS_IF != 0
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = RFLAGS_IF;
        hosted::IF.with(core::cell::Cell::get)
    }
}

/// Hosted builds emulate `RFLAGS.IF` per OS thread, each thread standing in
/// for one core.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod hosted {
    extern crate std;

    std::thread_local! {
        pub static IF: core::cell::Cell<bool> = const { core::cell::Cell::new(true) };
    }

    pub fn set(enabled: bool) {
        IF.with(|f| f.set(enabled));
    }
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots the `IF` bit. If interrupts were enabled it
/// executes `cli`; on drop it executes `sti` **only** if they were previously
/// enabled, so guards nest. Hosted builds toggle an emulated per-thread flag.
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
    _not_send: PhantomData<*const ()>,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = interrupts_enabled();
        if enabled {
            #[cfg(all(target_arch = "x86_64", target_os = "none"))]
            cli_stop_interrupts();
            #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
            hosted::set(false);
        }
        Self {
            were_enabled: enabled,
            _not_send: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn were_enabled(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            #[cfg(all(target_arch = "x86_64", target_os = "none"))]
            sti_enable_interrupts();
            #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
            hosted::set(true);
        }
    }
}

/// Proof that the caller runs on an interrupt path of one core.
///
/// Functions that take `&InterruptContext` are interrupt-safe: they never
/// block on a wait queue, run in bounded time and do not allocate from the
/// kernel heap. The token is neither `Send` nor `Sync`, so it cannot leak
/// into another thread of execution.
pub struct InterruptContext {
    core: usize,
    _not_send: PhantomData<*const ()>,
}

impl InterruptContext {
    /// Mint a token for `core`.
    ///
    /// # Safety
    /// Only interrupt entry stubs (or code that has masked interrupts on
    /// `core` and behaves like one) may create a token.
    #[inline]
    #[must_use]
    pub const unsafe fn new(core: usize) -> Self {
        Self {
            core,
            _not_send: PhantomData,
        }
    }

    /// The core this interrupt is being handled on.
    #[inline]
    #[must_use]
    pub const fn core(&self) -> usize {
        self.core
    }
}
