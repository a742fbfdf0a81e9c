use crate::PageSize;
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Add, AddAssign, Sub};

/// A virtual address.
///
/// Values are stored as given; call [`VirtualAddress::canonical`] before a
/// page-table walk so that bits 63..48 mirror bit 47.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

/// The four 9-bit table indices of a 48-bit virtual address.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TableIndices {
    pub pml4: usize,
    pub pdpt: usize,
    pub pd: usize,
    pub pt: usize,
}

impl TableIndices {
    /// Indices from the root (PML4) down to the leaf table (PT).
    #[inline]
    #[must_use]
    pub const fn as_array(self) -> [usize; 4] {
        [self.pml4, self.pdpt, self.pd, self.pt]
    }
}

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as u64)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Sign-extend bit 47 into bits 63..48.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    pub const fn canonical(self) -> Self {
        Self((((self.0 << 16) as i64) >> 16) as u64)
    }

    #[inline]
    #[must_use]
    pub const fn is_canonical(self) -> bool {
        self.canonical().0 == self.0
    }

    /// Addresses with bit 47 set belong to the kernel half.
    #[inline]
    #[must_use]
    pub const fn is_kernel_half(self) -> bool {
        self.0 & (1 << 47) != 0
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn indices(self) -> TableIndices {
        let v = self.0;
        TableIndices {
            pml4: ((v >> 39) & 0x1FF) as usize,
            pdpt: ((v >> 30) & 0x1FF) as usize,
            pd: ((v >> 21) & 0x1FF) as usize,
            pt: ((v >> 12) & 0x1FF) as usize,
        }
    }

    /// Rebuild a canonical address from table indices.
    #[inline]
    #[must_use]
    pub const fn from_indices(idx: TableIndices) -> Self {
        Self(
            ((idx.pml4 as u64) << 39)
                | ((idx.pdpt as u64) << 30)
                | ((idx.pd as u64) << 21)
                | ((idx.pt as u64) << 12),
        )
        .canonical()
    }

    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> VirtualPage<S> {
        VirtualPage::containing(self)
    }

    #[inline]
    #[must_use]
    pub const fn offset<S: PageSize>(self) -> u64 {
        self.0 & S::MASK
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.0 & S::MASK == 0
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA({:#018x})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub for VirtualAddress {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: Self) -> u64 {
        self.0 - rhs.0
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl From<VirtualAddress> for u64 {
    #[inline]
    fn from(v: VirtualAddress) -> Self {
        v.0
    }
}

/// A page-aligned virtual page of size `S`.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage<S: PageSize> {
    base: u64,
    _size: PhantomData<S>,
}

impl<S: PageSize> VirtualPage<S> {
    #[inline]
    #[must_use]
    pub const fn containing(addr: VirtualAddress) -> Self {
        Self {
            base: addr.0 & !S::MASK,
            _size: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress(self.base)
    }

    /// The page that follows this one.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self {
            base: self.base + S::SIZE,
            _size: PhantomData,
        }
    }
}

impl<S: PageSize> fmt::Debug for VirtualPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage<{}>({:#018x})", S::NAME, self.base)
    }
}
