//! TLB invalidation seam.

use kernel_memory_addresses::VirtualAddress;

/// Invalidates cached translations after a page-table edit.
///
/// The local flavour only covers the calling core. Revoking edits must also
/// run a cross-core shootdown, which lives with the interrupt layer.
pub trait TlbInvalidate {
    fn invalidate_page(&self, va: VirtualAddress);
}

impl<T: TlbInvalidate + ?Sized> TlbInvalidate for &T {
    #[inline]
    fn invalidate_page(&self, va: VirtualAddress) {
        (**self).invalidate_page(va);
    }
}

/// For address spaces that are not loaded in CR3 on this core.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTlb;

impl TlbInvalidate for NoTlb {
    #[inline]
    fn invalidate_page(&self, _va: VirtualAddress) {}
}

/// `invlpg` on the current core.
#[derive(Debug, Default, Clone, Copy)]
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub struct LocalTlb;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
impl TlbInvalidate for LocalTlb {
    #[inline]
    fn invalidate_page(&self, va: VirtualAddress) {
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
        }
    }
}
