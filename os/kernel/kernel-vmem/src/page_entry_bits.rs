use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// A single 64-bit x86-64 page table entry in its raw bitfield form.
///
/// Models the common superset of PML4E, PDPTE, PDE and PTE.
///
/// | Bits      | Name          | Meaning |
/// |-----------|---------------|----------|
/// | 0         | `P`           | Valid entry if set |
/// | 1         | `RW`          | Writable if set |
/// | 2         | `US`          | User-mode accessible if set |
/// | 3         | `PWT`         | Write-through caching |
/// | 4         | `PCD`         | Disable caching |
/// | 5         | `A`           | Accessed |
/// | 6         | `D`           | Dirty (leaf only) |
/// | 7         | `PS`          | Large page flag |
/// | 8         | `G`           | Global (leaf only) |
/// | 9–11      | OS avail low  | Reserved for OS use |
/// | 12–51     | `addr`        | Physical frame bits [51:12] |
/// | 52–58     | OS avail high | Reserved for OS use |
/// | 59–62     | `PKU`         | Protection key or OS use |
/// | 63        | `NX`          | Execute disable |
///
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::PageEntryBits;
/// let e = PageEntryBits::leaf(PhysicalAddress::new(0x5000), PageEntryBits::user_rw());
/// assert!(e.present() && e.writable() && e.user_access());
/// assert_eq!(e.physical_address().as_u64(), 0x5000);
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5); set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6), **leaf only**; set by the CPU on first write.
    pub dirty: bool,

    /// Page Size (PS, bit 7).
    ///
    /// In a PDPTE or PDE a set bit makes the entry a 1 GiB or 2 MiB leaf.
    /// Must be clear in a PML4E; in a PTE the position is PAT and kept clear.
    pub large_page: bool,

    /// Global (G, bit 8), **leaf only**.
    pub global_translation: bool,

    /// OS-available (bits 9..=11).
    #[bits(3)]
    pub os_available_low: u8,

    /// Physical address bits [51:12].
    #[bits(40)]
    phys_addr_bits_51_12: u64,

    /// OS-available (bits 52..=58).
    #[bits(7)]
    pub os_available_high: u8,

    /// Protection Key (PKU, bits 59..=62).
    #[bits(4)]
    pub protection_key: u8,

    /// No-Execute (NX, bit 63).
    pub no_execute: bool,
}

impl PageEntryBits {
    /// Bits that describe access rights (P, RW, US, NX).
    const PERMISSION_MASK: u64 = 0b111 | (1 << 63);

    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        self.set_phys_addr_bits_51_12(phys.as_u64() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn with_physical_address(mut self, phys: PhysicalAddress) -> Self {
        self.set_physical_address(phys);
        self
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_bits_51_12() << 12)
    }

    /// A present leaf entry mapping `phys` with the permission bits of `flags`.
    #[inline]
    #[must_use]
    pub const fn leaf(phys: PhysicalAddress, flags: Self) -> Self {
        Self::from_bits(flags.into_bits() & Self::PERMISSION_MASK)
            .with_present(true)
            .with_global_translation(flags.global_translation())
            .with_cache_disabled(flags.cache_disabled())
            .with_write_through(flags.write_through())
            .with_physical_address(phys)
    }

    /// A present interior entry pointing at a child table.
    ///
    /// Interior levels only ever widen access: NX stays clear so the leaf
    /// alone decides executability.
    #[inline]
    #[must_use]
    pub const fn table(child: PhysicalAddress, flags: Self) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(flags.writable())
            .with_user_access(flags.user_access())
            .with_physical_address(child)
    }

    /// Merge the access rights of `other` into `self`, never narrowing.
    ///
    /// RW and US are OR'ed; NX survives only if both sides forbid execution.
    #[inline]
    #[must_use]
    pub const fn widened_with(self, other: Self) -> Self {
        self.with_writable(self.writable() || other.writable())
            .with_user_access(self.user_access() || other.user_access())
            .with_no_execute(self.no_execute() && other.no_execute())
    }

    /// Whether `self` grants at least the access rights of `other`.
    #[inline]
    #[must_use]
    pub const fn covers(self, other: Self) -> bool {
        (self.writable() || !other.writable())
            && (self.user_access() || !other.user_access())
            && (!self.no_execute() || other.no_execute())
    }

    /// Kernel read/write, not executable.
    #[inline]
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_no_execute(true)
    }

    /// Kernel read/execute.
    #[inline]
    #[must_use]
    pub const fn kernel_rx() -> Self {
        Self::new().with_present(true)
    }

    /// User read/write, not executable.
    #[inline]
    #[must_use]
    pub const fn user_rw() -> Self {
        Self::kernel_rw().with_user_access(true)
    }

    /// User read-only, not executable.
    #[inline]
    #[must_use]
    pub const fn user_ro() -> Self {
        Self::new()
            .with_present(true)
            .with_user_access(true)
            .with_no_execute(true)
    }

    /// Strongly uncached device memory.
    #[inline]
    #[must_use]
    pub const fn mmio() -> Self {
        Self::kernel_rw()
            .with_cache_disabled(true)
            .with_write_through(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widening_never_narrows() {
        let ro_nx = PageEntryBits::user_ro();
        let rw_x = PageEntryBits::new().with_present(true).with_writable(true);
        let merged = ro_nx.widened_with(rw_x);
        assert!(merged.writable());
        assert!(merged.user_access());
        assert!(!merged.no_execute());
        assert!(merged.covers(ro_nx));
        assert!(merged.covers(rw_x));
        assert!(!ro_nx.covers(rw_x));
    }

    #[test]
    fn leaf_keeps_only_access_and_cache_bits() {
        let flags = PageEntryBits::mmio().with_dirty(true).with_os_available_low(5);
        let e = PageEntryBits::leaf(PhysicalAddress::new(0x7000), flags);
        assert!(e.cache_disabled());
        assert!(!e.dirty());
        assert_eq!(e.os_available_low(), 0);
        assert_eq!(e.physical_address().as_u64(), 0x7000);
    }

    #[test]
    fn table_entry_never_sets_nx() {
        let e = PageEntryBits::table(PhysicalAddress::new(0x2000), PageEntryBits::user_rw());
        assert!(e.present() && e.writable() && e.user_access());
        assert!(!e.no_execute());
    }
}
