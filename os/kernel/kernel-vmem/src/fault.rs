//! Page-fault error code and the PTE update produced by fault resolution.

use crate::PageEntryBits;
use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// Page-fault error code layout (x86-64).
///
/// Reference: Intel SDM Vol. 3A, §6.15.1 “Page-Fault Exception (#PF)”.
#[bitfield(u64)]
pub struct PageFaultError {
    /// 0 = non-present page, 1 = protection violation.
    pub present: bool, // bit 0

    /// 0 = read or execute, 1 = write access.
    pub write: bool, // bit 1

    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = caused by reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch.
    pub instruction_fetch: bool, // bit 4

    /// 1 = protection-key violation (if CR4.PKE=1).
    pub protection_key: bool, // bit 5

    /// 1 = shadow stack access (if CET-SS enabled).
    pub shadow_stack: bool, // bit 6

    #[bits(57)]
    __: u64,
}

impl PageFaultError {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if !self.present() {
            "Non-present page (page not mapped or not yet committed)"
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page (likely NX or SMEP)"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }

    /// Faults the lazy-commit path can resolve: missing pages, or a write to
    /// a page committed read-only before the range was widened.
    #[must_use]
    pub const fn is_resolvable(&self) -> bool {
        !self.reserved_bit() && !self.protection_key() && !self.shadow_stack()
    }
}

/// Hardware mapping computed for a faulting page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PteUpdate {
    /// Frame backing the faulting page.
    pub phys: PhysicalAddress,
    /// Access rights to grant.
    pub flags: PageEntryBits,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explains_common_codes() {
        let missing = PageFaultError::from_bits(0b110);
        assert!(missing.write() && missing.user() && !missing.present());
        assert!(missing.explain().starts_with("Non-present"));
        assert!(missing.is_resolvable());

        let rsvd = PageFaultError::new().with_present(true).with_reserved_bit(true);
        assert!(!rsvd.is_resolvable());
    }
}
