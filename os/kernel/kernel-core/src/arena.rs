//! Generational slot arena for threads and environments.

use alloc::vec::Vec;

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slots are reused lowest-first after a removal; every reuse bumps the
/// slot's generation, so `(index, generation)` pairs are never handed out
/// twice. Generations start at 1, keeping the all-zero id free for "none".
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Store the value built from its own id.
    ///
    /// Returns `None` once `u32::MAX` slots are in use.
    pub fn insert_with(&mut self, make: impl FnOnce(u32, u32) -> T) -> Option<(u32, u32)> {
        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                let i = u32::try_from(self.slots.len()).ok()?;
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                i
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1).max(1);
        slot.value = Some(make(index, slot.generation));
        self.len += 1;
        Some((index, slot.generation))
    }

    #[must_use]
    pub fn get(&self, index: u32, generation: u32) -> Option<&T> {
        self.slots
            .get(index as usize)
            .filter(|s| s.generation == generation)?
            .value
            .as_ref()
    }

    pub fn get_mut(&mut self, index: u32, generation: u32) -> Option<&mut T> {
        self.slots
            .get_mut(index as usize)
            .filter(|s| s.generation == generation)?
            .value
            .as_mut()
    }

    pub fn remove(&mut self, index: u32, generation: u32) -> Option<T> {
        let slot = self
            .slots
            .get_mut(index as usize)
            .filter(|s| s.generation == generation)?;
        let value = slot.value.take()?;
        self.free.push(index);
        // lowest index is reused first
        self.free.sort_unstable_by(|a, b| b.cmp(a));
        self.len -= 1;
        Some(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u32, &T)> {
        self.slots.iter().zip(0..).filter_map(|(s, i)| {
            s.value.as_ref().map(|v| (i, s.generation, v))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_ids_do_not_resolve() {
        let mut a = Arena::new();
        let (i, g) = a.insert_with(|i, g| (i, g)).unwrap();
        assert_eq!((i, g), (0, 1));
        assert_eq!(a.get(i, g), Some(&(0, 1)));

        assert_eq!(a.remove(i, g), Some((0, 1)));
        assert!(a.remove(i, g).is_none());

        let (i2, g2) = a.insert_with(|_, _| (9, 9)).unwrap();
        assert_eq!((i2, g2), (0, 2));
        assert!(a.get(i, g).is_none());
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn lowest_free_slot_is_reused() {
        let mut a = Arena::new();
        let ids: Vec<_> = (0..4).map(|n| a.insert_with(|_, _| n).unwrap()).collect();
        a.remove(ids[3].0, ids[3].1);
        a.remove(ids[1].0, ids[1].1);
        assert_eq!(a.insert_with(|_, _| 10).unwrap().0, 1);
        assert_eq!(a.insert_with(|_, _| 11).unwrap().0, 3);
        let values: Vec<_> = a.iter().map(|(_, _, v)| *v).collect();
        assert_eq!(values, [0, 10, 2, 11]);
    }
}
