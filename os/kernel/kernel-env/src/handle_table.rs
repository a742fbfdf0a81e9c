//! # Handle Table
//!
//! Maps small integers to kernel objects for one environment.
//!
//! ```text
//! Generation ── entries[i] ── open: u64   bit 63 = frozen, bits 0..63 = slot j in use
//!                          └─ objects[63]: u64  (rights << 48) | object pointer
//!
//! handle = i * 63 + j        handle 0 is reserved and never issued
//! ```
//!
//! Lookups are wait-free. Opening claims the lowest free slot in two steps:
//! first the object word (CAS from empty), then the `open` bit. Closing
//! clears the bit first and then empties the object word, so a frozen
//! bitmask always describes object words that no longer change.
//!
//! When every slot is taken the table grows: a writer freezes each entry
//! of the current generation (bit 63), copies bits and objects into a
//! generation twice the size and publishes it. Writers that hit a frozen
//! entry retry on the new generation. The old generation is retired through
//! the epoch collector, and so are the `Arc`s released by `close`, so a
//! reader that loaded a slot just before it was closed still holds a live
//! object.

use crate::{KObject, Rights};
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use kernel_nbhm::ebr::Guard;
use kernel_sync::SpinLock;
use log::debug;

/// Slots per entry; bit 63 of the bitmask is the frozen flag.
pub const SLOTS_PER_ENTRY: usize = 63;

const FROZEN: u64 = 1 << 63;
const ALL_OPEN: u64 = FROZEN - 1;
const ADDR_BITS: u32 = 48;
const ADDR_MASK: u64 = (1 << ADDR_BITS) - 1;

/// An environment-local name for a kernel object.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Handle(u32);

impl Handle {
    pub const NULL: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    const fn split(self) -> (usize, usize) {
        let raw = self.0 as usize;
        (raw / SLOTS_PER_ENTRY, raw % SLOTS_PER_ENTRY)
    }

    #[inline]
    fn join(entry: usize, slot: usize) -> Option<Self> {
        let raw = entry.checked_mul(SLOTS_PER_ENTRY)?.checked_add(slot)?;
        u32::try_from(raw).ok().map(Self)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle-{}", self.0)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HandleError {
    #[error("handle table cannot grow any further")]
    TableFull,
    #[error("{0} is not open")]
    NotOpen(Handle),
    #[error("the null handle names no object")]
    Null,
}

struct Entry {
    open: AtomicU64,
    objects: [AtomicU64; SLOTS_PER_ENTRY],
}

impl Entry {
    fn new(open: u64) -> Self {
        Self {
            open: AtomicU64::new(open),
            objects: core::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

struct Generation {
    entries: Box<[Entry]>,
}

impl Generation {
    fn new(entries: usize) -> Box<Self> {
        Box::new(Self {
            entries: (0..entries).map(|_| Entry::new(0)).collect(),
        })
    }
}

#[inline]
fn pack(obj: *const KObject, rights: Rights) -> u64 {
    (obj.expose_provenance() as u64 & ADDR_MASK) | (u64::from(rights.into_bits()) << ADDR_BITS)
}

#[inline]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]
fn unpack(packed: u64) -> (*const KObject, Rights) {
    // sign-extend bit 47 to get a canonical address back
    let addr = (((packed << (64 - ADDR_BITS)) as i64) >> (64 - ADDR_BITS)) as u64;
    let rights = Rights::from_bits((packed >> ADDR_BITS) as u16);
    (ptr::with_exposed_provenance(addr as usize), rights)
}

enum Claim {
    Opened(Handle),
    Stale,
    Full,
}

/// Versioned table of handles owned by one environment.
pub struct KHandleTable {
    latest: AtomicPtr<Generation>,
    grow: SpinLock<()>,
}

impl KHandleTable {
    /// A table with `entries * 63 - 1` usable handles before it first grows.
    #[must_use]
    pub fn with_entries(entries: usize) -> Self {
        let generation = Generation::new(entries.max(1));
        // reserve handle 0
        generation.entries[0].open.store(1, Ordering::Relaxed);
        Self {
            latest: AtomicPtr::new(Box::into_raw(generation)),
            grow: SpinLock::new(()),
        }
    }

    #[inline]
    fn latest<'g>(&self, _guard: &'g Guard<'_>) -> &'g Generation {
        // SAFETY: generations are retired through the collector, so the one
        // loaded here outlives the pin.
        unsafe { &*self.latest.load(Ordering::Acquire) }
    }

    /// Handles the current generation can hold.
    #[must_use]
    pub fn capacity(&self, guard: &Guard<'_>) -> usize {
        self.latest(guard).entries.len() * SLOTS_PER_ENTRY - 1
    }

    /// Open handles.
    #[must_use]
    pub fn len(&self, guard: &Guard<'_>) -> usize {
        let open: u32 = self
            .latest(guard)
            .entries
            .iter()
            .map(|e| (e.open.load(Ordering::Acquire) & ALL_OPEN).count_ones())
            .sum();
        open as usize - 1
    }

    #[must_use]
    pub fn is_empty(&self, guard: &Guard<'_>) -> bool {
        self.len(guard) == 0
    }

    /// Give `obj` the lowest free handle.
    ///
    /// # Errors
    /// [`HandleError::TableFull`] when the table cannot grow; the object is
    /// dropped.
    pub fn open(
        &self,
        guard: &Guard<'_>,
        rights: Rights,
        obj: Arc<KObject>,
    ) -> Result<Handle, HandleError> {
        let raw = Arc::into_raw(obj);
        let packed = pack(raw, rights);
        loop {
            let generation = self.latest(guard);
            match Self::try_claim(generation, packed) {
                Claim::Opened(handle) => return Ok(handle),
                Claim::Stale => {}
                Claim::Full => {
                    if let Err(e) = self.grow(guard, generation) {
                        // SAFETY: `raw` came from `Arc::into_raw` above and
                        // was never published.
                        drop(unsafe { Arc::from_raw(raw) });
                        return Err(e);
                    }
                }
            }
        }
    }

    fn try_claim(generation: &Generation, packed: u64) -> Claim {
        for (i, entry) in generation.entries.iter().enumerate() {
            let mut bits = entry.open.load(Ordering::Acquire);
            loop {
                if bits & FROZEN != 0 {
                    return Claim::Stale;
                }
                if bits == ALL_OPEN {
                    break;
                }
                let j = (!bits).trailing_zeros() as usize;
                if entry.objects[j]
                    .compare_exchange(0, packed, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // another opener owns the slot, or a close is finishing
                    core::hint::spin_loop();
                    bits = entry.open.load(Ordering::Acquire);
                    continue;
                }
                loop {
                    match entry.open.compare_exchange_weak(
                        bits,
                        bits | (1 << j),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            return Handle::join(i, j).map_or(Claim::Full, Claim::Opened);
                        }
                        Err(seen) if seen & FROZEN != 0 => {
                            entry.objects[j].store(0, Ordering::Release);
                            return Claim::Stale;
                        }
                        Err(seen) => bits = seen,
                    }
                }
            }
        }
        Claim::Full
    }

    /// Replace `seen` with a generation twice its size.
    fn grow(&self, guard: &Guard<'_>, seen: &Generation) -> Result<(), HandleError> {
        let _serialize = self.grow.lock();
        let current = self.latest.load(Ordering::Acquire);
        if !ptr::eq(current, seen) {
            // somebody else grew it
            return Ok(());
        }

        let new_len = seen.entries.len() * 2;
        if Handle::join(new_len, 0).is_none() {
            return Err(HandleError::TableFull);
        }
        let next = Generation::new(new_len);
        for (src, dst) in seen.entries.iter().zip(next.entries.iter()) {
            let bits = src.open.fetch_or(FROZEN, Ordering::AcqRel) & ALL_OPEN;
            let mut rest = bits;
            while rest != 0 {
                let j = rest.trailing_zeros() as usize;
                rest &= rest - 1;
                dst.objects[j].store(src.objects[j].load(Ordering::Acquire), Ordering::Relaxed);
            }
            dst.open.store(bits, Ordering::Relaxed);
        }

        self.latest.store(Box::into_raw(next), Ordering::Release);
        debug!("handle table grown to {} entries", new_len);
        // SAFETY: unreachable for anybody pinning from now on; objects stay
        // owned by the new generation.
        unsafe { guard.defer_destroy(current) };
        Ok(())
    }

    /// The object behind `handle` and the rights it was opened with.
    #[must_use]
    pub fn get(&self, guard: &Guard<'_>, handle: Handle) -> Option<(Arc<KObject>, Rights)> {
        if handle.is_null() {
            return None;
        }
        let (i, j) = handle.split();
        let entry = self.latest(guard).entries.get(i)?;
        if entry.open.load(Ordering::Acquire) & (1 << j) == 0 {
            return None;
        }
        let packed = entry.objects[j].load(Ordering::Acquire);
        if packed == 0 {
            return None;
        }
        let (obj, rights) = unpack(packed);
        // SAFETY: the table owns one strong count per open slot, and the
        // count dropped by `close` is retired through the collector, so the
        // object is alive while we are pinned.
        let obj = unsafe {
            Arc::increment_strong_count(obj);
            Arc::from_raw(obj)
        };
        Some((obj, rights))
    }

    /// Release `handle`.
    ///
    /// # Errors
    /// [`HandleError::Null`] for handle 0, [`HandleError::NotOpen`] if the
    /// handle is not open.
    pub fn close(&self, guard: &Guard<'_>, handle: Handle) -> Result<(), HandleError> {
        if handle.is_null() {
            return Err(HandleError::Null);
        }
        let (i, j) = handle.split();
        let mask = 1 << j;
        'retry: loop {
            let generation = self.latest(guard);
            let entry = generation
                .entries
                .get(i)
                .ok_or(HandleError::NotOpen(handle))?;
            let mut bits = entry.open.load(Ordering::Acquire);
            loop {
                if bits & FROZEN != 0 {
                    core::hint::spin_loop();
                    continue 'retry;
                }
                if bits & mask == 0 {
                    return Err(HandleError::NotOpen(handle));
                }
                match entry.open.compare_exchange_weak(
                    bits,
                    bits & !mask,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(seen) => bits = seen,
                }
            }

            let packed = entry.objects[j].swap(0, Ordering::AcqRel);
            if packed == 0 {
                return Err(HandleError::NotOpen(handle));
            }
            let (obj, _) = unpack(packed);
            // SAFETY: the strong count belonged to the slot we just emptied.
            let obj = unsafe { Arc::from_raw(obj) };
            // SAFETY: freshly boxed and unreachable from the table.
            unsafe { guard.defer_destroy(Box::into_raw(Box::new(obj))) };
            return Ok(());
        }
    }
}

impl Drop for KHandleTable {
    fn drop(&mut self) {
        // SAFETY: `&mut self`: nobody else can reach the table any more.
        let generation = unsafe { Box::from_raw(*self.latest.get_mut()) };
        for entry in &generation.entries {
            let mut bits = entry.open.load(Ordering::Relaxed) & ALL_OPEN;
            while bits != 0 {
                let j = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                let packed = entry.objects[j].load(Ordering::Relaxed);
                if packed != 0 {
                    let (obj, _) = unpack(packed);
                    drop(unsafe { Arc::from_raw(obj) });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Vmo;
    use kernel_memory_addresses::PhysicalAddress;
    use kernel_nbhm::ebr::Collector;

    fn vmo(page: u64) -> Arc<KObject> {
        Arc::new(KObject::Vmo(
            Vmo::physical(PhysicalAddress::new(page << 12), 4096).unwrap(),
        ))
    }

    #[test]
    fn handles_start_at_one_and_reuse_lowest() {
        let c = Collector::new(1);
        let t = KHandleTable::with_entries(1);
        let g = c.pin(0);

        let a = t.open(&g, Rights::all(), vmo(1)).unwrap();
        let b = t.open(&g, Rights::all(), vmo(2)).unwrap();
        assert_eq!((a.as_u32(), b.as_u32()), (1, 2));

        t.close(&g, a).unwrap();
        assert_eq!(t.open(&g, Rights::all(), vmo(3)).unwrap(), a);
        assert_eq!(t.len(&g), 2);
    }

    #[test]
    fn get_returns_object_and_rights() {
        let c = Collector::new(1);
        let t = KHandleTable::with_entries(1);
        let g = c.pin(0);
        let ro = Rights::new().with_read(true);
        let h = t.open(&g, ro, vmo(9)).unwrap();

        let (obj, rights) = t.get(&g, h).unwrap();
        assert_eq!(rights, ro);
        assert_eq!(obj.as_vmo().unwrap().paddr().as_u64(), 9 << 12);
        assert!(t.get(&g, Handle::NULL).is_none());
        assert!(t.get(&g, Handle::from_raw(40)).is_none());
        assert!(t.get(&g, Handle::from_raw(10_000)).is_none());
    }

    #[test]
    fn close_rejects_null_and_unopened() {
        let c = Collector::new(1);
        let t = KHandleTable::with_entries(1);
        let g = c.pin(0);
        assert_eq!(t.close(&g, Handle::NULL), Err(HandleError::Null));
        assert_eq!(
            t.close(&g, Handle::from_raw(5)),
            Err(HandleError::NotOpen(Handle::from_raw(5)))
        );
        let h = t.open(&g, Rights::all(), vmo(1)).unwrap();
        t.close(&g, h).unwrap();
        assert_eq!(t.close(&g, h), Err(HandleError::NotOpen(h)));
    }

    #[test]
    fn growth_keeps_every_handle() {
        let c = Collector::new(1);
        let t = KHandleTable::with_entries(1);
        let handles: Vec<_> = {
            let g = c.pin(0);
            assert_eq!(t.capacity(&g), 62);
            (0..200)
                .map(|i| t.open(&g, Rights::all(), vmo(i + 1)).unwrap())
                .collect()
        };
        let g = c.pin(0);
        assert_eq!(t.capacity(&g), 4 * SLOTS_PER_ENTRY - 1);
        for (i, h) in handles.iter().enumerate() {
            assert_eq!(h.as_u32(), u32::try_from(i).unwrap() + 1);
            let (obj, _) = t.get(&g, *h).unwrap();
            assert_eq!(obj.as_vmo().unwrap().paddr().as_u64(), (i as u64 + 1) << 12);
        }
        drop(g);
        // two retired generations
        assert_eq!(c.reclaim(), 2);
    }

    #[test]
    fn closing_defers_the_object_drop() {
        let c = Collector::new(2);
        let t = KHandleTable::with_entries(1);
        let obj = vmo(1);
        let h = {
            let g = c.pin(0);
            t.open(&g, Rights::all(), Arc::clone(&obj)).unwrap()
        };
        assert_eq!(Arc::strong_count(&obj), 2);
        {
            let g = c.pin(0);
            t.close(&g, h).unwrap();
        }
        // the table's count is waiting for the collector
        assert_eq!(Arc::strong_count(&obj), 2);
        c.reclaim();
        assert_eq!(Arc::strong_count(&obj), 1);
    }

    #[test]
    fn drop_releases_open_objects() {
        let c = Collector::new(1);
        let obj = vmo(1);
        {
            let t = KHandleTable::with_entries(1);
            let g = c.pin(0);
            t.open(&g, Rights::all(), Arc::clone(&obj)).unwrap();
            t.open(&g, Rights::all(), Arc::clone(&obj)).unwrap();
            assert_eq!(Arc::strong_count(&obj), 3);
        }
        assert_eq!(Arc::strong_count(&obj), 1);
    }

    #[test]
    fn pack_round_trips_kernel_half_pointers() {
        let p = ptr::with_exposed_provenance::<KObject>(0xffff_8880_0012_3450);
        let packed = pack(p, Rights::all());
        let (q, rights) = unpack(packed);
        assert_eq!(q.addr(), 0xffff_8880_0012_3450);
        assert_eq!(rights, Rights::all());
    }
}
