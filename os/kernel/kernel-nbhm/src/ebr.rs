//! # Epoch-based reclamation
//!
//! Every core owns one [`EpochSlot`] holding a counter with a pinned bit:
//!
//! ```text
//!  UNPINNED(n) ──pin──► PINNED(n) ──unpin──► UNPINNED(n + 1)
//! ```
//!
//! Pointers into shared structures are only held while pinned. Retired
//! objects go on a lock-free stack; [`Collector::reclaim`] snapshots all
//! slots and frees the batch once every slot that was pinned at snapshot
//! time has moved on. A slot that was unpinned at snapshot time cannot hold
//! a pointer to anything retired before the snapshot.

use alloc::boxed::Box;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering, fence};
use log::trace;

const PINNED: u64 = 1 << 63;

#[repr(align(64))]
#[derive(Default)]
struct EpochSlot {
    time: AtomicU64,
    /// Nesting depth; only touched by the slot's owner.
    depth: AtomicU32,
}

struct Retired {
    next: *mut Retired,
    ptr: *mut (),
    destroy: unsafe fn(*mut ()),
}

unsafe fn drop_box<T>(p: *mut ()) {
    drop(unsafe { Box::from_raw(p.cast::<T>()) });
}

pub struct Collector {
    slots: Box<[EpochSlot]>,
    retired_head: AtomicPtr<Retired>,
    retired: AtomicUsize,
    freed: AtomicUsize,
}

// Retired objects are `Send` and only freed by the reclaiming thread.
unsafe impl Send for Collector {}
unsafe impl Sync for Collector {}

impl Collector {
    /// A collector with one slot per core.
    #[must_use]
    pub fn new(slots: usize) -> Self {
        Self {
            slots: (0..slots.max(1)).map(|_| EpochSlot::default()).collect(),
            retired_head: AtomicPtr::new(ptr::null_mut()),
            retired: AtomicUsize::new(0),
            freed: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn slots(&self) -> usize {
        self.slots.len()
    }

    /// Enter a critical section on `slot`. Pins nest.
    ///
    /// # Panics
    /// If `slot` is out of range.
    #[must_use]
    pub fn pin(&self, slot: usize) -> Guard<'_> {
        let s = &self.slots[slot];
        if s.depth.fetch_add(1, Ordering::Relaxed) == 0 {
            let t = s.time.load(Ordering::Relaxed);
            s.time.store(t | PINNED, Ordering::Relaxed);
            // the pin must be visible before any shared pointer is loaded
            fence(Ordering::SeqCst);
        }
        Guard {
            collector: self,
            slot,
            _not_send: PhantomData,
        }
    }

    fn unpin(&self, slot: usize) {
        let s = &self.slots[slot];
        if s.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            let t = s.time.load(Ordering::Relaxed);
            s.time.store((t & !PINNED) + 1, Ordering::Release);
        }
    }

    /// Whether `slot` is inside a critical section.
    #[must_use]
    pub fn is_pinned(&self, slot: usize) -> bool {
        self.slots[slot].time.load(Ordering::Acquire) & PINNED != 0
    }

    fn retire(&self, node: Box<Retired>) {
        let node = Box::into_raw(node);
        let mut head = self.retired_head.load(Ordering::Relaxed);
        loop {
            unsafe { (*node).next = head };
            match self.retired_head.compare_exchange_weak(
                head,
                node,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(seen) => head = seen,
            }
        }
        self.retired.fetch_add(1, Ordering::Release);
    }

    /// Objects retired but not yet freed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.retired.load(Ordering::Acquire) - self.freed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending() != 0
    }

    #[must_use]
    pub fn freed(&self) -> usize {
        self.freed.load(Ordering::Acquire)
    }

    /// Free everything retired so far, waiting for slots that are pinned
    /// right now to leave their critical section. Returns the number of
    /// objects freed.
    ///
    /// The caller must not be pinned itself.
    pub fn reclaim(&self) -> usize {
        let mut batch = self.retired_head.swap(ptr::null_mut(), Ordering::Acquire);
        if batch.is_null() {
            return 0;
        }
        fence(Ordering::SeqCst);

        for (i, s) in self.slots.iter().enumerate() {
            let before = s.time.load(Ordering::Acquire);
            if before & PINNED == 0 {
                continue;
            }
            while s.time.load(Ordering::Acquire) == before {
                core::hint::spin_loop();
            }
            trace!("ebr: slot {i} advanced past {before:#x}");
        }
        fence(Ordering::SeqCst);

        let mut n = 0;
        while !batch.is_null() {
            let node = unsafe { Box::from_raw(batch) };
            batch = node.next;
            unsafe { (node.destroy)(node.ptr) };
            n += 1;
        }
        self.freed.fetch_add(n, Ordering::Release);
        trace!("ebr: freed {n} objects");
        n
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        // nobody can be pinned once we have `&mut self`
        let mut batch = *self.retired_head.get_mut();
        while !batch.is_null() {
            let node = unsafe { Box::from_raw(batch) };
            batch = node.next;
            unsafe { (node.destroy)(node.ptr) };
        }
    }
}

/// An active pin on one collector slot.
pub struct Guard<'c> {
    collector: &'c Collector,
    slot: usize,
    _not_send: PhantomData<*const ()>,
}

impl Guard<'_> {
    #[must_use]
    pub const fn slot(&self) -> usize {
        self.slot
    }

    #[must_use]
    pub const fn collector(&self) -> &Collector {
        self.collector
    }

    /// Free `ptr` once no pinned reader can still see it.
    ///
    /// # Safety
    /// `ptr` must come from [`Box::into_raw`], must already be unreachable
    /// for threads that pin after this call, and must not be retired twice.
    pub unsafe fn defer_destroy<T: Send>(&self, ptr: *mut T) {
        self.collector.retire(Box::new(Retired {
            next: ptr::null_mut(),
            ptr: ptr.cast(),
            destroy: drop_box::<T>,
        }));
    }
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        self.collector.unpin(self.slot);
    }
}
