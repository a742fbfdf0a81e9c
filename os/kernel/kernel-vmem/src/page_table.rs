use crate::PageEntryBits;
use core::sync::atomic::{AtomicU64, Ordering};

/// Entries per table at every level.
pub const ENTRIES: usize = 512;

/// One 4 KiB page table (any level) of atomically updated entries.
///
/// Tables are shared between cores that fault in the same address space, so
/// every entry is accessed through an atomic. Interior entries only ever gain
/// rights while the owning space is shared-locked; clearing happens under the
/// exclusive lock.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [AtomicU64; ENTRIES],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    #[inline]
    #[must_use]
    pub fn load(&self, idx: usize) -> PageEntryBits {
        PageEntryBits::from_bits(self.entries[idx].load(Ordering::Acquire))
    }

    /// Plain store; only for uncontended paths (boot mapping, fresh tables).
    #[inline]
    pub fn store(&self, idx: usize, entry: PageEntryBits) {
        self.entries[idx].store(entry.into_bits(), Ordering::Release);
    }

    /// Replace the entry, returning the previous one.
    #[inline]
    pub fn swap(&self, idx: usize, entry: PageEntryBits) -> PageEntryBits {
        PageEntryBits::from_bits(self.entries[idx].swap(entry.into_bits(), Ordering::AcqRel))
    }

    /// Install `new` if the entry still equals `current`.
    ///
    /// # Errors
    /// Returns the entry actually observed when another core got there first.
    #[inline]
    pub fn compare_exchange(
        &self,
        idx: usize,
        current: PageEntryBits,
        new: PageEntryBits,
    ) -> Result<(), PageEntryBits> {
        self.entries[idx]
            .compare_exchange(
                current.into_bits(),
                new.into_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(PageEntryBits::from_bits)
    }

    /// Clear all entries. The table must not be reachable by other cores.
    #[inline]
    pub fn zero(&self) {
        for e in &self.entries {
            e.store(0, Ordering::Relaxed);
        }
    }

    /// Count of present entries; diagnostics only.
    #[must_use]
    pub fn present_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.load(Ordering::Relaxed) & 1 != 0)
            .count()
    }
}
