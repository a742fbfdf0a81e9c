//! The seam to the interrupt controller and the other cores.

use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::TlbInvalidate;

/// Cross-core operations the architecture layer performs for the kernel.
///
/// Every method may be called from interrupt context and must not block on
/// anything the calling core holds.
pub trait ArchHooks: Sync {
    /// Interrupt `core` so it runs its scheduler now, e.g. because a thread
    /// became runnable while it idled.
    fn send_wake_ipi(&self, core: usize);

    /// Invalidate `va` on every core and return once all of them have.
    fn tlb_shootdown(&self, va: VirtualAddress);

    /// Route IOAPIC `line` to `core`.
    fn route_irq(&self, line: usize, core: usize);
}

/// Revoking-edit TLB maintenance: every page goes through a shootdown.
pub struct Shootdown<'a, A: ArchHooks + ?Sized>(pub &'a A);

impl<A: ArchHooks + ?Sized> TlbInvalidate for Shootdown<'_, A> {
    #[inline]
    fn invalidate_page(&self, va: VirtualAddress) {
        self.0.tlb_shootdown(va);
    }
}
