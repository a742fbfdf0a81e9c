//! # Chase-Lev work-stealing deque of chunk addresses
//!
//! ```text
//!           steal()                       push() / pop()
//!   thieves ──────► top                 bottom ◄────── owner
//!                    │                     │
//!              ┌─────▼──┬──────┬──────┬────▼───┐
//!   slots[]    │ chunk  │ chunk│ chunk│  free  │   (index & mask)
//!              └────────┴──────┴──────┴────────┘
//! ```
//!
//! The buffer is bounded: a full deque hands the chunk back instead of
//! growing. Only one thread may act as owner at a time; any number of
//! threads may steal concurrently.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicI64, AtomicU64, Ordering, fence};
use kernel_memory_addresses::PhysicalAddress;

/// Result of a [`ChunkDeque::steal`] attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Steal {
    Empty,
    Success(PhysicalAddress),
    /// Lost a race with the owner or another thief.
    Retry,
}

pub struct ChunkDeque {
    top: AtomicI64,
    bottom: AtomicI64,
    slots: Box<[AtomicU64]>,
    mask: i64,
}

impl ChunkDeque {
    /// A deque holding up to `capacity.next_power_of_two()` chunks.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let cap = capacity.max(1).next_power_of_two();
        Self {
            top: AtomicI64::new(0),
            bottom: AtomicI64::new(0),
            slots: (0..cap).map(|_| AtomicU64::new(0)).collect(),
            mask: i64::try_from(cap - 1).unwrap_or(i64::MAX),
        }
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    fn slot(&self, index: i64) -> &AtomicU64 {
        &self.slots[(index & self.mask) as usize]
    }

    /// Push a chunk at the bottom.
    ///
    /// # Errors
    /// Returns the chunk if the deque is full.
    ///
    /// # Safety
    /// Must not run concurrently with another [`push`](Self::push) or
    /// [`pop`](Self::pop) on the same deque.
    #[allow(clippy::cast_possible_wrap)]
    pub unsafe fn push(&self, chunk: PhysicalAddress) -> Result<(), PhysicalAddress> {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        if b - t >= self.slots.len() as i64 {
            return Err(chunk);
        }
        self.slot(b).store(chunk.as_u64(), Ordering::Relaxed);
        fence(Ordering::Release);
        self.bottom.store(b + 1, Ordering::Relaxed);
        Ok(())
    }

    /// Pop the most recently pushed chunk.
    ///
    /// # Safety
    /// Same contract as [`push`](Self::push).
    pub unsafe fn pop(&self) -> Option<PhysicalAddress> {
        let b = self.bottom.load(Ordering::Relaxed) - 1;
        self.bottom.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);

        if t > b {
            self.bottom.store(b + 1, Ordering::Relaxed);
            return None;
        }

        let chunk = self.slot(b).load(Ordering::Relaxed);
        if t == b {
            // last element: race the thieves for it
            let won = self
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            self.bottom.store(b + 1, Ordering::Relaxed);
            if !won {
                return None;
            }
        }
        Some(PhysicalAddress::new(chunk))
    }

    /// Take the oldest chunk. Safe to call from any thread.
    pub fn steal(&self) -> Steal {
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);
        if t >= b {
            return Steal::Empty;
        }

        let chunk = self.slot(t).load(Ordering::Relaxed);
        if self
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return Steal::Retry;
        }
        Steal::Success(PhysicalAddress::new(chunk))
    }

    /// Steal, retrying lost races until the deque is seen empty.
    pub fn steal_until_empty(&self) -> Option<PhysicalAddress> {
        loop {
            match self.steal() {
                Steal::Empty => return None,
                Steal::Success(c) => return Some(c),
                Steal::Retry => core::hint::spin_loop(),
            }
        }
    }

    /// Number of queued chunks; never negative, may be stale.
    #[must_use]
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    pub fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Relaxed);
        (b - t).max(0) as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;

    fn chunk(i: u64) -> PhysicalAddress {
        PhysicalAddress::new((i + 1) << 21)
    }

    #[test]
    fn owner_is_lifo_thieves_are_fifo() {
        let q = ChunkDeque::with_capacity(4);
        unsafe {
            q.push(chunk(0)).unwrap();
            q.push(chunk(1)).unwrap();
            q.push(chunk(2)).unwrap();
        }
        assert_eq!(q.steal(), Steal::Success(chunk(0)));
        assert_eq!(unsafe { q.pop() }, Some(chunk(2)));
        assert_eq!(unsafe { q.pop() }, Some(chunk(1)));
        assert_eq!(unsafe { q.pop() }, None);
        assert_eq!(q.steal(), Steal::Empty);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn full_deque_returns_the_chunk() {
        let q = ChunkDeque::with_capacity(3);
        assert_eq!(q.capacity(), 4);
        for i in 0..4 {
            unsafe { q.push(chunk(i)).unwrap() };
        }
        assert_eq!(unsafe { q.push(chunk(9)) }, Err(chunk(9)));
        assert!(matches!(q.steal(), Steal::Success(_)));
        assert!(unsafe { q.push(chunk(9)) }.is_ok());
    }

    #[test]
    fn pop_on_empty_keeps_len_at_zero() {
        let q = ChunkDeque::with_capacity(2);
        for _ in 0..3 {
            assert_eq!(unsafe { q.pop() }, None);
            assert_eq!(q.len(), 0);
        }
        unsafe { q.push(chunk(0)).unwrap() };
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn every_chunk_is_taken_exactly_once_under_stealing() {
        const CHUNKS: u64 = 20_000;
        const THIEVES: usize = 4;

        let q = Arc::new(ChunkDeque::with_capacity(256));
        let taken = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(AtomicBool::new(false));
        let barrier = Arc::new(Barrier::new(THIEVES + 1));

        let thieves: Vec<_> = (0..THIEVES)
            .map(|_| {
                let (q, taken, done, barrier) =
                    (q.clone(), taken.clone(), done.clone(), barrier.clone());
                thread::spawn(move || {
                    let mut mine = Vec::new();
                    barrier.wait();
                    while !done.load(Ordering::Acquire) || !q.is_empty() {
                        if let Steal::Success(c) = q.steal() {
                            mine.push(c.as_u64());
                        }
                    }
                    taken.lock().unwrap().extend(mine);
                })
            })
            .collect();

        barrier.wait();
        let mut mine = Vec::new();
        let mut next = 0;
        while next < CHUNKS {
            // owner: push a few, pop one
            for _ in 0..3 {
                if next < CHUNKS && unsafe { q.push(chunk(next)) }.is_ok() {
                    next += 1;
                }
            }
            if let Some(c) = unsafe { q.pop() } {
                mine.push(c.as_u64());
            }
        }
        while let Some(c) = unsafe { q.pop() } {
            mine.push(c.as_u64());
        }
        done.store(true, Ordering::Release);
        for t in thieves {
            t.join().unwrap();
        }

        let mut all = taken.lock().unwrap().clone();
        all.extend(mine);
        assert_eq!(all.len() as u64, CHUNKS);
        let unique: HashSet<_> = all.into_iter().collect();
        assert_eq!(unique.len() as u64, CHUNKS);
    }
}
