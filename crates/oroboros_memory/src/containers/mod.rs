//! # Fixed-Capacity Containers
//!
//! Collections whose storage is reserved once from an arena and never
//! grows. A full container hands the rejected value back instead of
//! reallocating.
//!
//! - [`FixedVec`]: dynamic array
//! - [`FixedQueue`]: FIFO ring buffer
//! - [`FixedHashMap`]: open addressing with linear probing

// SAFETY: Containers manage initialized/uninitialized slots of a raw arena
// buffer themselves, the same way `Vec` does over `RawVec`.
#![allow(unsafe_code)]

mod hash_map;
mod queue;
mod vec;

pub use hash_map::{FixedHashMap, FixedState};
pub use queue::FixedQueue;
pub use vec::FixedVec;

use std::mem;
use std::ptr::NonNull;

use crate::arena::RawArena;
use crate::error::{MemoryError, MemoryResult};
use crate::report::report;

/// Uninitialized storage for `capacity` values of `T`, freed on drop.
///
/// Never drops the values themselves.
pub(crate) struct RawBuffer<'a, T> {
    ptr: NonNull<T>,
    capacity: usize,
    arena: &'a dyn RawArena,
}

impl<'a, T> RawBuffer<'a, T> {
    /// Reserves room for `capacity` values.
    #[track_caller]
    pub(crate) fn new(arena: &'a dyn RawArena, capacity: usize) -> MemoryResult<Self> {
        let element_size = mem::size_of::<T>();
        let Some(bytes) = element_size.checked_mul(capacity) else {
            return Err(report(MemoryError::SizeOverflow {
                count: capacity,
                element_size,
            }));
        };

        let ptr = if bytes == 0 {
            NonNull::dangling()
        } else {
            arena
                .allocate_raw(bytes, mem::align_of::<T>(), std::any::type_name::<T>())?
                .cast()
        };
        Ok(Self {
            ptr,
            capacity,
            arena,
        })
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pointer to slot `index`. In bounds when `index < capacity`.
    #[inline]
    pub(crate) fn slot(&self, index: usize) -> *mut T {
        debug_assert!(index < self.capacity || self.capacity == 0);
        self.ptr.as_ptr().wrapping_add(index)
    }
}

impl<T> Drop for RawBuffer<'_, T> {
    fn drop(&mut self) {
        if mem::size_of::<T>() != 0 && self.capacity != 0 {
            // SAFETY: allocated in `new` from the same arena, freed once.
            let _ = unsafe { self.arena.free_raw(self.ptr.cast()) };
        }
    }
}
