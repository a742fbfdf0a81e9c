use bitfield_struct::bitfield;

/// What the holder of a handle may do with the object.
///
/// Stored in the top 16 bits of a handle table slot.
#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct Rights {
    pub read: bool,
    pub write: bool,
    /// Map a VMO into an address space.
    pub map: bool,
    /// Send the handle through a mailbox.
    pub transfer: bool,
    #[bits(12)]
    __: u16,
}

impl Rights {
    #[inline]
    #[must_use]
    pub const fn all() -> Self {
        Self::new()
            .with_read(true)
            .with_write(true)
            .with_map(true)
            .with_transfer(true)
    }

    /// Whether every right in `other` is also in `self`.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.into_bits() & other.into_bits() == other.into_bits()
    }
}
