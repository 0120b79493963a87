//! Fixed-capacity dynamic array.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr;

use super::RawBuffer;
use crate::arena::RawArena;
use crate::error::MemoryResult;

/// A `Vec`-like array that never grows past its capacity.
///
/// # Example
///
/// ```rust,ignore
/// let mut visible = FixedVec::with_capacity(&frame_arena, 1024)?;
/// for entity in query {
///     if visible.push(entity).is_err() {
///         break; // Budget reached
///     }
/// }
/// ```
pub struct FixedVec<'a, T> {
    buffer: RawBuffer<'a, T>,
    len: usize,
}

impl<'a, T> FixedVec<'a, T> {
    /// Reserves `capacity` slots in `arena`.
    ///
    /// # Errors
    ///
    /// Reports and returns allocation failures.
    #[track_caller]
    pub fn with_capacity(arena: &'a dyn RawArena, capacity: usize) -> MemoryResult<Self> {
        Ok(Self {
            buffer: RawBuffer::new(arena, capacity)?,
            len: 0,
        })
    }

    /// Appends `value`, or hands it back when full.
    ///
    /// # Errors
    ///
    /// Returns `value` when the vector is at capacity.
    pub fn push(&mut self, value: T) -> Result<(), T> {
        if self.is_full() {
            return Err(value);
        }
        // SAFETY: `len < capacity`, the slot is uninitialized.
        unsafe { self.buffer.slot(self.len).write(value) };
        self.len += 1;
        Ok(())
    }

    /// Removes the last element.
    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        // SAFETY: the slot was initialized and is now outside `len`.
        Some(unsafe { self.buffer.slot(self.len).read() })
    }

    /// Removes element `index` by moving the last element into its place.
    pub fn swap_remove(&mut self, index: usize) -> Option<T> {
        if index >= self.len {
            return None;
        }
        let last = self.len - 1;
        // SAFETY: both slots are initialized; the last one leaves `len`.
        unsafe {
            let removed = self.buffer.slot(index).read();
            if index != last {
                ptr::copy_nonoverlapping(self.buffer.slot(last), self.buffer.slot(index), 1);
            }
            self.len = last;
            Some(removed)
        }
    }

    /// Drops every element past `len`.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.len {
            return;
        }
        let tail = ptr::slice_from_raw_parts_mut(self.buffer.slot(len), self.len - len);
        self.len = len;
        // SAFETY: the tail was initialized and is no longer reachable.
        unsafe { ptr::drop_in_place(tail) };
    }

    /// Drops every element.
    pub fn clear(&mut self) {
        self.truncate(0);
    }

    /// Number of elements.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the vector is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of elements.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Whether another push would fail.
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len == self.buffer.capacity()
    }
}

impl<T> Deref for FixedVec<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: the first `len` slots are initialized.
        unsafe { std::slice::from_raw_parts(self.buffer.slot(0), self.len) }
    }
}

impl<T> DerefMut for FixedVec<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: as above, uniquely borrowed.
        unsafe { std::slice::from_raw_parts_mut(self.buffer.slot(0), self.len) }
    }
}

impl<T> Drop for FixedVec<'_, T> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<T: fmt::Debug> fmt::Debug for FixedVec<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::allocator::AllocatorKind;
    use crate::arena::Arena;
    use crate::boundary::Boundary;
    use crate::bounds::BasicBoundsChecking;

    #[repr(C, align(64))]
    struct Memory([u8; 2048]);

    fn with_arena(test: impl FnOnce(&Arena<'_, BasicBoundsChecking>)) {
        let mut memory = Box::new(Memory([0; 2048]));
        let boundary = Boundary::new(memory.0.as_mut_ptr(), memory.0.len());
        let arena = unsafe { Arena::from_boundary("vec", boundary, AllocatorKind::Stack).unwrap() };
        test(&arena);
        assert_eq!(arena.allocation_count(), 0);
    }

    #[test]
    fn test_push_until_full() {
        with_arena(|arena| {
            let mut values = FixedVec::with_capacity(arena, 4).unwrap();
            for i in 0..4 {
                values.push(i).unwrap();
            }
            assert!(values.is_full());
            assert_eq!(values.push(99), Err(99));
            assert_eq!(&values[..], &[0, 1, 2, 3]);
            assert_eq!(values.pop(), Some(3));
            assert_eq!(values.len(), 3);
        });
    }

    #[test]
    fn test_swap_remove_and_truncate() {
        with_arena(|arena| {
            let mut values = FixedVec::with_capacity(arena, 8).unwrap();
            for i in 10..15 {
                values.push(i).unwrap();
            }
            assert_eq!(values.swap_remove(1), Some(11));
            assert_eq!(&values[..], &[10, 14, 12, 13]);
            assert_eq!(values.swap_remove(9), None);

            values.truncate(2);
            assert_eq!(&values[..], &[10, 14]);
            values[0] = 7;
            assert_eq!(values.iter().sum::<i32>(), 21);
        });
    }

    #[test]
    fn test_drop_releases_elements() {
        let shared = Rc::new(());
        with_arena(|arena| {
            let mut handles = FixedVec::with_capacity(arena, 3).unwrap();
            for _ in 0..3 {
                handles.push(Rc::clone(&shared)).unwrap();
            }
            assert_eq!(Rc::strong_count(&shared), 4);
        });
        assert_eq!(Rc::strong_count(&shared), 1);
    }
}
