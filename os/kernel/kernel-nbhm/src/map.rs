//! # Non-blocking resizable hashmap
//!
//! Open addressing with linear probing over `{key, value}` pairs of atomic
//! words. A slot moves through
//!
//! ```text
//!  EMPTY ─► KEY CLAIMED (value 0) ─► VALUE SET ─► [TOMBSTONE] ─► [PRIMED]
//! ```
//!
//! Keys are never removed from a table; removal writes a tombstone.
//!
//! When a table passes 75 % occupancy a larger generation is installed with
//! `prev` pointing at the old one. Every operation first copies a batch of
//! old slots forward. Copying freezes ("primes") a slot by setting bit 63 of
//! its value, after which writers must use the newer table. Once every slot
//! is copied the old generation is unlinked and handed to the epoch
//! collector.
//!
//! All operations run under an epoch [`Guard`]; table references never
//! outlive it.

use crate::ebr::Guard;
use crate::hash::{AddressHasher, KeyHasher};
use alloc::boxed::Box;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use log::debug;

const PRIME: u64 = 1 << 63;

/// Value of a removed key.
pub const TOMBSTONE: u64 = u64::MAX >> 1;

/// Occupancy (percent) that triggers a resize.
pub const LOAD_FACTOR: usize = 75;

/// Old slots every operation copies forward during a resize.
pub const MOVE_AMOUNT: usize = 256;

const MIN_CAP: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("key 0 is reserved")]
    ReservedKey,
    #[error("value {0:#x} is reserved")]
    ReservedValue(u64),
}

/// Slot count of a table meant to hold `y` entries.
///
/// ```
/// # use kernel_nbhm::compute_cap;
/// assert_eq!(compute_cap(10), 64);
/// assert_eq!(compute_cap(64), 128);
/// assert_eq!(compute_cap(192), 256);
/// ```
#[must_use]
pub const fn compute_cap(y: usize) -> usize {
    let y = if y < MIN_CAP { MIN_CAP } else { (y + 1) / 3 * 4 };
    y.next_power_of_two()
}

#[derive(Default)]
struct Entry {
    key: AtomicU64,
    val: AtomicU64,
}

struct Table {
    prev: AtomicPtr<Table>,
    cap: usize,
    /// Reciprocal of `cap` for the multiply-shift modulo.
    a: u64,
    sh: u32,
    /// Slots handed out to movers.
    moved: AtomicUsize,
    /// Slots whose copy has finished.
    move_done: AtomicUsize,
    /// Claimed keys.
    count: AtomicUsize,
    data: Box<[Entry]>,
}

impl Table {
    #[allow(clippy::cast_possible_truncation)]
    fn new(cap: usize) -> Box<Self> {
        debug_assert!(cap.is_power_of_two() && cap >= 2);
        let sh = usize::BITS - (cap - 1).leading_zeros() - 1;
        let a = (((1u128 << (64 + sh)) + cap as u128 - 1) / cap as u128) as u64;
        Box::new(Self {
            prev: AtomicPtr::new(ptr::null_mut()),
            cap,
            a,
            sh,
            moved: AtomicUsize::new(0),
            move_done: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
            data: (0..cap).map(|_| Entry::default()).collect(),
        })
    }

    /// `h % cap` without a division.
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn index(&self, h: u32) -> usize {
        let h = u64::from(h);
        let hi = ((u128::from(h) * u128::from(self.a)) >> 64) as u64;
        let q = hi >> self.sh;
        let r = h - q * self.cap as u64;
        debug_assert_eq!(r, h % self.cap as u64);
        r as usize
    }

    #[inline]
    const fn next(&self, i: usize) -> usize {
        if i + 1 == self.cap { 0 } else { i + 1 }
    }

    #[inline]
    const fn limit(&self) -> usize {
        self.cap * LOAD_FACTOR / 100
    }

    fn find(&self, h: u32, key: u64) -> Option<usize> {
        let first = self.index(h);
        let mut i = first;
        loop {
            match self.data[i].key.load(Ordering::Acquire) {
                0 => return None,
                k if k == key => return Some(i),
                _ => {}
            }
            i = self.next(i);
            if i == first {
                return None;
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Expect {
    /// Overwrite whatever is there.
    Any,
    /// Write only over "no value" or a tombstone.
    Vacant,
    /// Write only into a slot that never held a value (copying).
    Empty,
}

impl Expect {
    const fn allows(self, v: u64) -> bool {
        match self {
            Self::Any => true,
            Self::Vacant => v == 0 || v == TOMBSTONE,
            Self::Empty => v == 0,
        }
    }
}

#[inline]
const fn visible(v: u64) -> Option<u64> {
    if v == 0 || v == TOMBSTONE {
        None
    } else {
        Some(v)
    }
}

pub struct Nbhm<H: KeyHasher = AddressHasher> {
    latest: AtomicPtr<Table>,
    generations: AtomicUsize,
    hasher: H,
}

unsafe impl<H: KeyHasher + Send> Send for Nbhm<H> {}
unsafe impl<H: KeyHasher + Sync> Sync for Nbhm<H> {}

impl Default for Nbhm {
    fn default() -> Self {
        Self::with_capacity(MIN_CAP)
    }
}

impl Nbhm {
    /// A map sized for `n` entries before its first resize.
    #[must_use]
    pub fn with_capacity(n: usize) -> Self {
        Self::with_hasher(n, AddressHasher::default())
    }
}

type Generations<'g> = (&'g Table, Option<&'g Table>);

impl<H: KeyHasher> Nbhm<H> {
    #[must_use]
    pub fn with_hasher(n: usize, hasher: H) -> Self {
        Self {
            latest: AtomicPtr::new(Box::into_raw(Table::new(compute_cap(n)))),
            generations: AtomicUsize::new(1),
            hasher,
        }
    }

    #[inline]
    fn latest<'g>(&self, _guard: &'g Guard<'_>) -> &'g Table {
        // SAFETY: tables are only freed by the collector after every guard
        // that could have loaded them is gone.
        unsafe { &*self.latest.load(Ordering::Acquire) }
    }

    #[inline]
    fn prev<'g>(table: &'g Table) -> Option<&'g Table> {
        // SAFETY: as for `latest`; `table` is pinned by the same guard.
        unsafe { table.prev.load(Ordering::Acquire).as_ref() }
    }

    fn reload<'g>(&self, guard: &'g Guard<'_>) -> Generations<'g> {
        let latest = self.latest(guard);
        (latest, Self::prev(latest))
    }

    /// Load the current generations and copy one batch forward.
    fn begin<'g>(&self, guard: &'g Guard<'_>) -> Generations<'g> {
        let (latest, prev) = self.reload(guard);
        match prev {
            Some(p) if self.move_items(guard, latest, p, MOVE_AMOUNT).is_none() => {
                self.reload(guard)
            }
            _ => (latest, prev),
        }
    }

    /// Copy up to `amount` slots of `prev` into `latest`. Returns `None` once
    /// `prev` has been unlinked.
    fn move_items<'g>(
        &self,
        guard: &'g Guard<'_>,
        latest: &'g Table,
        prev: &'g Table,
        amount: usize,
    ) -> Option<&'g Table> {
        let cap = prev.cap;
        let mut old = prev.moved.load(Ordering::Acquire);
        let new = loop {
            if old == cap {
                return Some(prev);
            }
            let new = (old + amount).min(cap);
            match prev
                .moved
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break new,
                Err(seen) => old = seen,
            }
        };

        for i in old..new {
            self.copy_slot(guard, latest, prev, i);
        }

        let done = prev.move_done.fetch_add(new - old, Ordering::AcqRel) + (new - old);
        debug_assert!(done <= cap);
        if done < cap {
            return Some(prev);
        }

        latest.prev.store(ptr::null_mut(), Ordering::Release);
        debug!("nbhm: retired generation of {cap} slots");
        // SAFETY: `prev` came from `Box::into_raw`, is unreachable from the
        // map now, and only the mover that finished the last batch gets here.
        unsafe { guard.defer_destroy(ptr::from_ref(prev).cast_mut()) };
        None
    }

    /// Freeze slot `i` of `prev` and copy its value forward if it had one.
    fn copy_slot<'g>(&self, guard: &'g Guard<'_>, latest: &'g Table, prev: &'g Table, i: usize) {
        let e = &prev.data[i];
        let mut v = e.val.load(Ordering::Acquire);
        while v & PRIME == 0 {
            let primed = if v == TOMBSTONE { PRIME } else { v | PRIME };
            match e
                .val
                .compare_exchange(v, primed, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if visible(v).is_some() {
                        let k = e.key.load(Ordering::Acquire);
                        self.put_if_match(guard, latest, None, k, v, Expect::Empty);
                    }
                    return;
                }
                Err(seen) => v = seen,
            }
        }
    }

    /// Make sure the old value of `key` (if any) has reached `slot` of the
    /// newest table before anybody writes there. Returns the slot's value.
    fn migrate_key<'g>(
        &self,
        guard: &'g Guard<'_>,
        latest: &'g Table,
        prev: &'g Table,
        h: u32,
        key: u64,
        slot: &Entry,
    ) -> u64 {
        if let Some(j) = prev.find(h, key) {
            self.copy_slot(guard, latest, prev, j);
            let old = prev.data[j].val.load(Ordering::Acquire) & !PRIME;
            if visible(old).is_some() {
                // losing means the copier got there first with the same value
                let _ = slot
                    .val
                    .compare_exchange(0, old, Ordering::AcqRel, Ordering::Acquire);
            }
        }
        slot.val.load(Ordering::Acquire)
    }

    /// Core write path. Returns the value observed in the slot before the
    /// write (or the blocking value if `expect` refused the write).
    fn put_if_match<'g>(
        &self,
        guard: &'g Guard<'_>,
        mut latest: &'g Table,
        mut prev: Option<&'g Table>,
        key: u64,
        val: u64,
        expect: Expect,
    ) -> u64 {
        let copying = expect == Expect::Empty;
        let h = self.hasher.hash(key);

        'retry: loop {
            let limit = latest.limit();
            if !copying && prev.is_none() && latest.count.load(Ordering::Relaxed) >= limit {
                let fresh = Box::into_raw(Table::new(compute_cap(limit * 2)));
                let current = ptr::from_ref(latest).cast_mut();
                // SAFETY: `fresh` is not shared yet.
                unsafe { (*fresh).prev.store(current, Ordering::Relaxed) };
                match self.latest.compare_exchange(
                    current,
                    fresh,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        let n = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
                        debug!(
                            "nbhm: resize {} -> {} slots (generation {n})",
                            latest.cap,
                            compute_cap(limit * 2)
                        );
                        prev = Some(latest);
                        // SAFETY: just published; freed only through the collector.
                        latest = unsafe { &*fresh };
                    }
                    Err(_) => {
                        // SAFETY: never published.
                        drop(unsafe { Box::from_raw(fresh) });
                        (latest, prev) = self.reload(guard);
                    }
                }
                continue;
            }

            // claim a slot for the key
            let first = latest.index(h);
            let mut i = first;
            let slot = loop {
                let e = &latest.data[i];
                let mut k = e.key.load(Ordering::Acquire);
                if k == 0 {
                    if val == TOMBSTONE && prev.is_none() {
                        // nothing to remove
                        return 0;
                    }
                    match e
                        .key
                        .compare_exchange(0, key, Ordering::AcqRel, Ordering::Acquire)
                    {
                        Ok(_) => {
                            latest.count.fetch_add(1, Ordering::Relaxed);
                            break Some(e);
                        }
                        Err(seen) => k = seen,
                    }
                }
                if k == key {
                    break Some(e);
                }
                i = latest.next(i);
                if i == first {
                    break None;
                }
            };

            let Some(slot) = slot else {
                // full: help the resize along, or trigger one
                (latest, prev) = self.begin(guard);
                continue;
            };

            let mut v = slot.val.load(Ordering::Acquire);
            if v == 0
                && let Some(p) = prev
            {
                v = self.migrate_key(guard, latest, p, h, key, slot);
            }

            loop {
                if v & PRIME != 0 {
                    // a newer generation owns this key
                    (latest, prev) = self.reload(guard);
                    continue 'retry;
                }
                if v == val || !expect.allows(v) {
                    return v;
                }
                match slot
                    .val
                    .compare_exchange(v, val, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => return v,
                    Err(seen) => v = seen,
                }
            }
        }
    }

    /// The value stored for `key`.
    #[must_use]
    pub fn get(&self, guard: &Guard<'_>, key: u64) -> Option<u64> {
        if key == 0 {
            return None;
        }
        let h = self.hasher.hash(key);
        let (mut latest, mut prev) = self.begin(guard);
        loop {
            if let Some(i) = latest.find(h, key) {
                let v = latest.data[i].val.load(Ordering::Acquire);
                if v & PRIME != 0 {
                    (latest, prev) = self.reload(guard);
                    continue;
                }
                if v != 0 {
                    return visible(v);
                }
            }
            // not in the newest table yet: the old one still has it
            return prev
                .and_then(|p| p.find(h, key).map(|j| p.data[j].val.load(Ordering::Acquire)))
                .and_then(|v| visible(v & !PRIME));
        }
    }

    fn check(key: u64, val: u64) -> Result<(), MapError> {
        if key == 0 {
            return Err(MapError::ReservedKey);
        }
        if val == 0 || val >= TOMBSTONE {
            return Err(MapError::ReservedValue(val));
        }
        Ok(())
    }

    /// Store `val` for `key`, returning the previous value.
    ///
    /// # Errors
    /// Key 0 and values 0 or `>= TOMBSTONE` are reserved.
    pub fn put(&self, guard: &Guard<'_>, key: u64, val: u64) -> Result<Option<u64>, MapError> {
        Self::check(key, val)?;
        let (latest, prev) = self.begin(guard);
        Ok(visible(self.put_if_match(guard, latest, prev, key, val, Expect::Any)))
    }

    /// Store `val` only if `key` has no value. Returns `None` when the value
    /// was inserted, or the value that is already there.
    ///
    /// # Errors
    /// See [`put`](Self::put).
    pub fn put_if_null(
        &self,
        guard: &Guard<'_>,
        key: u64,
        val: u64,
    ) -> Result<Option<u64>, MapError> {
        Self::check(key, val)?;
        let (latest, prev) = self.begin(guard);
        Ok(visible(self.put_if_match(guard, latest, prev, key, val, Expect::Vacant)))
    }

    /// Remove `key`, returning its value.
    pub fn remove(&self, guard: &Guard<'_>, key: u64) -> Option<u64> {
        if key == 0 {
            return None;
        }
        let (latest, prev) = self.begin(guard);
        visible(self.put_if_match(guard, latest, prev, key, TOMBSTONE, Expect::Any))
    }

    /// Finish any resize in progress. Afterwards only the newest
    /// generation is reachable.
    pub fn resize_barrier(&self, guard: &Guard<'_>) {
        loop {
            let latest = self.latest(guard);
            let Some(prev) = Self::prev(latest) else {
                return;
            };
            if self.move_items(guard, latest, prev, prev.cap).is_some() {
                // other movers still own batches
                core::hint::spin_loop();
            }
        }
    }

    /// Keys with a value in the newest generation. Exact only when no
    /// resize is in flight.
    #[must_use]
    pub fn len(&self, guard: &Guard<'_>) -> usize {
        self.latest(guard)
            .data
            .iter()
            .filter(|e| visible(e.val.load(Ordering::Acquire)).is_some())
            .count()
    }

    #[must_use]
    pub fn is_empty(&self, guard: &Guard<'_>) -> bool {
        self.len(guard) == 0
    }

    /// Slots in the newest generation.
    #[must_use]
    pub fn capacity(&self, guard: &Guard<'_>) -> usize {
        self.latest(guard).cap
    }

    /// Generations reachable from the map: 1, or 2 during a resize.
    #[must_use]
    pub fn reachable_generations(&self, guard: &Guard<'_>) -> usize {
        let mut n = 0;
        let mut t = Some(self.latest(guard));
        while let Some(table) = t {
            n += 1;
            t = Self::prev(table);
        }
        n
    }

    /// Tables ever installed, including the first.
    #[must_use]
    pub fn generations_created(&self) -> usize {
        self.generations.load(Ordering::Relaxed)
    }
}

impl<H: KeyHasher> Drop for Nbhm<H> {
    fn drop(&mut self) {
        let mut t = *self.latest.get_mut();
        while !t.is_null() {
            // SAFETY: exclusive access; each generation is owned by the chain.
            let table = unsafe { Box::from_raw(t) };
            t = table.prev.load(Ordering::Relaxed);
        }
    }
}
