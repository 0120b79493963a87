//! Fixed-capacity hash map with open addressing.
//!
//! ```text
//! control: | E | F | D | F | E | E | F | E |   E=empty F=full D=deleted
//! entries: | - |k,v| - |k,v| - | - |k,v| - |
//! ```
//!
//! The slot table is twice the capacity rounded up to a power of two, so
//! the load factor never exceeds one half. Probing is linear and visits
//! every slot at most once.

use std::borrow::Borrow;
use std::fmt;
use std::hash::{BuildHasher, Hash};

use siphasher::sip::SipHasher13;

use super::RawBuffer;
use crate::arena::RawArena;
use crate::error::{MemoryError, MemoryResult};
use crate::report::report;

const EMPTY: u8 = 0;
const FULL: u8 = 1;
const DELETED: u8 = 2;

/// SipHash-1-3 with fixed keys: the same key hashes the same in every run.
#[derive(Clone, Copy, Debug, Default)]
pub struct FixedState;

impl FixedState {
    const KEY0: u64 = 0x6f72_6f62_6f72_6f73;
    const KEY1: u64 = 0x6d65_6d6f_7279_2121;
}

impl BuildHasher for FixedState {
    type Hasher = SipHasher13;

    fn build_hasher(&self) -> SipHasher13 {
        SipHasher13::new_with_keys(Self::KEY0, Self::KEY1)
    }
}

enum Probe {
    Found(usize),
    Vacant(Option<usize>),
}

/// A hash map that never grows past its capacity.
///
/// # Example
///
/// ```rust,ignore
/// let mut lookup = FixedHashMap::with_capacity(&level_arena, 256)?;
/// lookup.insert(entity_id, spawn_point).map_err(|_| "lookup full")?;
/// ```
pub struct FixedHashMap<'a, K, V, S = FixedState> {
    // Dropped before `control`, the reverse of allocation order.
    entries: RawBuffer<'a, (K, V)>,
    control: RawBuffer<'a, u8>,
    mask: usize,
    len: usize,
    capacity: usize,
    hasher: S,
}

impl<'a, K: Hash + Eq, V> FixedHashMap<'a, K, V, FixedState> {
    /// Reserves room for `capacity` entries in `arena`.
    ///
    /// # Errors
    ///
    /// Reports and returns allocation failures.
    #[track_caller]
    pub fn with_capacity(arena: &'a dyn RawArena, capacity: usize) -> MemoryResult<Self> {
        Self::with_capacity_and_hasher(arena, capacity, FixedState)
    }
}

impl<'a, K: Hash + Eq, V, S: BuildHasher> FixedHashMap<'a, K, V, S> {
    /// Like [`FixedHashMap::with_capacity`] with a custom hasher.
    ///
    /// # Errors
    ///
    /// Reports and returns allocation failures and size overflow.
    #[track_caller]
    pub fn with_capacity_and_hasher(
        arena: &'a dyn RawArena,
        capacity: usize,
        hasher: S,
    ) -> MemoryResult<Self> {
        let slots = capacity
            .checked_mul(2)
            .and_then(|slots| slots.max(1).checked_next_power_of_two())
            .ok_or_else(|| {
                report(MemoryError::SizeOverflow {
                    count: capacity,
                    element_size: std::mem::size_of::<(K, V)>(),
                })
            })?;

        let control = RawBuffer::<u8>::new(arena, slots)?;
        // SAFETY: `slots` control bytes were just reserved.
        unsafe { control.slot(0).write_bytes(EMPTY, slots) };
        let entries = RawBuffer::new(arena, slots)?;

        Ok(Self {
            entries,
            control,
            mask: slots - 1,
            len: 0,
            capacity,
            hasher,
        })
    }

    fn control(&self, slot: usize) -> u8 {
        // SAFETY: `slot <= mask`, and every control byte is initialized.
        unsafe { *self.control.slot(slot) }
    }

    fn set_control(&mut self, slot: usize, value: u8) {
        // SAFETY: as above.
        unsafe { *self.control.slot(slot) = value };
    }

    fn entry(&self, slot: usize) -> &(K, V) {
        debug_assert_eq!(self.control(slot), FULL);
        // SAFETY: FULL slots hold an initialized entry.
        unsafe { &*self.entries.slot(slot) }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn probe<Q>(&self, key: &Q) -> Probe
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let start = self.hasher.hash_one(key) as usize & self.mask;
        let mut vacant = None;

        for step in 0..=self.mask {
            let slot = (start + step) & self.mask;
            match self.control(slot) {
                EMPTY => return Probe::Vacant(vacant.or(Some(slot))),
                DELETED => {
                    vacant.get_or_insert(slot);
                }
                _ => {
                    if Borrow::<Q>::borrow(&self.entry(slot).0) == key {
                        return Probe::Found(slot);
                    }
                }
            }
        }
        Probe::Vacant(vacant)
    }

    /// Inserts or replaces the value for `key`.
    ///
    /// Returns the previous value when the key was present.
    ///
    /// # Errors
    ///
    /// Hands the pair back when the key is new and the map is full.
    pub fn insert(&mut self, key: K, value: V) -> Result<Option<V>, (K, V)> {
        match self.probe(&key) {
            Probe::Found(slot) => {
                // SAFETY: FULL slot, uniquely borrowed.
                let entry = unsafe { &mut *self.entries.slot(slot) };
                Ok(Some(std::mem::replace(&mut entry.1, value)))
            }
            Probe::Vacant(Some(slot)) if self.len < self.capacity => {
                // SAFETY: the slot is EMPTY or DELETED, its entry is dead.
                unsafe { self.entries.slot(slot).write((key, value)) };
                self.set_control(slot, FULL);
                self.len += 1;
                Ok(None)
            }
            Probe::Vacant(_) => Err((key, value)),
        }
    }

    /// The value for `key`.
    #[must_use]
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.probe(key) {
            Probe::Found(slot) => Some(&self.entry(slot).1),
            Probe::Vacant(_) => None,
        }
    }

    /// Mutable access to the value for `key`.
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.probe(key) {
            // SAFETY: FULL slot, uniquely borrowed through `&mut self`.
            Probe::Found(slot) => Some(unsafe { &mut (*self.entries.slot(slot)).1 }),
            Probe::Vacant(_) => None,
        }
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        matches!(self.probe(key), Probe::Found(_))
    }

    /// Removes `key`, leaving a tombstone.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let Probe::Found(slot) = self.probe(key) else {
            return None;
        };
        self.set_control(slot, DELETED);
        self.len -= 1;
        // SAFETY: the slot was FULL and is now dead, read it out once.
        let (_, value) = unsafe { self.entries.slot(slot).read() };
        Some(value)
    }
}

impl<K, V, S> FixedHashMap<'_, K, V, S> {
    /// Number of entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the map is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of entries.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterates entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        (0..=self.mask).filter_map(move |slot| {
            // SAFETY: every control byte is initialized; FULL slots hold an
            // initialized entry.
            unsafe {
                (*self.control.slot(slot) == FULL).then(|| {
                    let entry = &*self.entries.slot(slot);
                    (&entry.0, &entry.1)
                })
            }
        })
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        for slot in 0..=self.mask {
            // SAFETY: as in `iter`; each FULL entry is dropped once and its
            // slot marked EMPTY.
            unsafe {
                let control = self.control.slot(slot);
                if *control == FULL {
                    std::ptr::drop_in_place(self.entries.slot(slot));
                }
                *control = EMPTY;
            }
        }
        self.len = 0;
    }
}

impl<K, V, S> Drop for FixedHashMap<'_, K, V, S> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<K: fmt::Debug, V: fmt::Debug, S> fmt::Debug for FixedHashMap<'_, K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::hash::BuildHasherDefault;
    use std::hash::Hasher;

    use super::*;
    use crate::allocator::{AllocatorKind, FitPolicy};
    use crate::arena::Arena;
    use crate::boundary::Boundary;
    use crate::bounds::BasicBoundsChecking;

    #[repr(C, align(64))]
    struct Memory([u8; 8192]);

    fn arena_over(memory: &mut Memory) -> Arena<'_, BasicBoundsChecking> {
        let boundary = Boundary::new(memory.0.as_mut_ptr(), memory.0.len());
        let kind = AllocatorKind::FreeList {
            policy: FitPolicy::FirstFit,
        };
        unsafe { Arena::from_boundary("map", boundary, kind).unwrap() }
    }

    /// Sends every key to the same slot to force long probe chains.
    #[derive(Default)]
    struct Collide;

    impl Hasher for Collide {
        fn finish(&self) -> u64 {
            0
        }

        fn write(&mut self, _bytes: &[u8]) {}
    }

    #[test]
    fn test_insert_get_replace() {
        let mut memory = Box::new(Memory([0; 8192]));
        let arena = arena_over(&mut memory);
        let mut map = FixedHashMap::with_capacity(&arena, 16).unwrap();

        assert_eq!(map.insert("sword", 10), Ok(None));
        assert_eq!(map.insert("shield", 4), Ok(None));
        assert_eq!(map.insert("sword", 12), Ok(Some(10)));

        assert_eq!(map.get("sword"), Some(&12));
        assert!(map.contains_key("shield"));
        assert_eq!(map.get("bow"), None);
        *map.get_mut("shield").unwrap() += 1;
        assert_eq!(map.get("shield"), Some(&5));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_full_map_rejects_new_keys_only() {
        let mut memory = Box::new(Memory([0; 8192]));
        let arena = arena_over(&mut memory);
        let mut map = FixedHashMap::with_capacity(&arena, 3).unwrap();

        for key in 0..3u32 {
            map.insert(key, key * 10).unwrap();
        }
        assert_eq!(map.insert(7, 70), Err((7, 70)));
        assert_eq!(map.insert(1, 11), Ok(Some(10)));
    }

    #[test]
    fn test_remove_leaves_chain_intact() {
        let mut memory = Box::new(Memory([0; 8192]));
        let arena = arena_over(&mut memory);
        let mut map: FixedHashMap<'_, u32, u32, BuildHasherDefault<Collide>> =
            FixedHashMap::with_capacity_and_hasher(&arena, 4, BuildHasherDefault::default())
                .unwrap();

        for key in 0..4 {
            map.insert(key, key).unwrap();
        }
        assert_eq!(map.remove(&1), Some(1));
        assert_eq!(map.get(&3), Some(&3));
        assert_eq!(map.remove(&1), None);

        // The tombstone is reused.
        map.insert(9, 9).unwrap();
        assert_eq!(map.len(), 4);
        let mut keys: Vec<u32> = map.iter().map(|(key, _)| *key).collect();
        keys.sort_unstable();
        assert_eq!(keys, [0, 2, 3, 9]);
    }

    #[test]
    fn test_same_key_same_hash_every_run() {
        let state = FixedState;
        assert_eq!(state.hash_one("entity-42"), FixedState.hash_one("entity-42"));
        assert_ne!(state.hash_one("entity-42"), state.hash_one("entity-43"));
    }

    #[test]
    fn test_drop_frees_both_tables() {
        let mut memory = Box::new(Memory([0; 8192]));
        let arena = arena_over(&mut memory);
        {
            let mut map = FixedHashMap::with_capacity(&arena, 32).unwrap();
            map.insert(String::from("key"), vec![1, 2, 3]).unwrap();
            assert_eq!(arena.allocation_count(), 2);
        }
        assert_eq!(arena.allocation_count(), 0);
    }
}
