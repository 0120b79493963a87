//! Fixed-capacity FIFO ring buffer.

use std::fmt;

use super::RawBuffer;
use crate::arena::RawArena;
use crate::error::MemoryResult;

/// A first-in-first-out queue over a ring of `capacity` slots.
pub struct FixedQueue<'a, T> {
    buffer: RawBuffer<'a, T>,
    /// Slot of the front element.
    head: usize,
    len: usize,
}

impl<'a, T> FixedQueue<'a, T> {
    /// Reserves `capacity` slots in `arena`.
    ///
    /// # Errors
    ///
    /// Reports and returns allocation failures.
    #[track_caller]
    pub fn with_capacity(arena: &'a dyn RawArena, capacity: usize) -> MemoryResult<Self> {
        Ok(Self {
            buffer: RawBuffer::new(arena, capacity)?,
            head: 0,
            len: 0,
        })
    }

    #[inline]
    fn physical(&self, logical: usize) -> usize {
        (self.head + logical) % self.buffer.capacity()
    }

    /// Appends `value` at the back, or hands it back when full.
    ///
    /// # Errors
    ///
    /// Returns `value` when the queue is at capacity.
    pub fn push_back(&mut self, value: T) -> Result<(), T> {
        if self.is_full() {
            return Err(value);
        }
        let slot = self.physical(self.len);
        // SAFETY: the slot lies outside the live range, uninitialized.
        unsafe { self.buffer.slot(slot).write(value) };
        self.len += 1;
        Ok(())
    }

    /// Removes the front element.
    pub fn pop_front(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        // SAFETY: `head` holds the initialized front element.
        let value = unsafe { self.buffer.slot(self.head).read() };
        self.head = (self.head + 1) % self.buffer.capacity();
        self.len -= 1;
        Some(value)
    }

    /// The front element.
    #[must_use]
    pub fn front(&self) -> Option<&T> {
        self.get(0)
    }

    /// The back element.
    #[must_use]
    pub fn back(&self) -> Option<&T> {
        self.len.checked_sub(1).and_then(|last| self.get(last))
    }

    /// Element `index` positions behind the front.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        // SAFETY: `index < len`, so the slot is initialized.
        (index < self.len).then(|| unsafe { &*self.buffer.slot(self.physical(index)) })
    }

    /// Iterates front to back.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len).filter_map(|index| self.get(index))
    }

    /// Drops every element.
    pub fn clear(&mut self) {
        while self.pop_front().is_some() {}
        self.head = 0;
    }

    /// Number of queued elements.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the queue is empty.
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

impl<T> Drop for FixedQueue<'_, T> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<T: fmt::Debug> fmt::Debug for FixedQueue<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{AllocatorKind, FitPolicy};
    use crate::arena::Arena;
    use crate::boundary::Boundary;
    use crate::bounds::NoBoundsChecking;

    #[repr(C, align(64))]
    struct Memory([u8; 1024]);

    #[test]
    fn test_fifo_order_across_wraparound() {
        let mut memory = Box::new(Memory([0; 1024]));
        let boundary = Boundary::new(memory.0.as_mut_ptr(), memory.0.len());
        let kind = AllocatorKind::FreeList {
            policy: FitPolicy::FirstFit,
        };
        let arena: Arena<'_, NoBoundsChecking> =
            unsafe { Arena::from_boundary("queue", boundary, kind).unwrap() };

        let mut queue = FixedQueue::with_capacity(&arena, 3).unwrap();
        queue.push_back('a').unwrap();
        queue.push_back('b').unwrap();
        assert_eq!(queue.pop_front(), Some('a'));
        queue.push_back('c').unwrap();
        queue.push_back('d').unwrap();
        assert_eq!(queue.push_back('e'), Err('e'));

        assert_eq!(queue.front(), Some(&'b'));
        assert_eq!(queue.back(), Some(&'d'));
        assert_eq!(queue.iter().copied().collect::<String>(), "bcd");

        assert_eq!(queue.pop_front(), Some('b'));
        assert_eq!(queue.pop_front(), Some('c'));
        assert_eq!(queue.pop_front(), Some('d'));
        assert_eq!(queue.pop_front(), None);

        drop(queue);
        assert_eq!(arena.allocation_count(), 0);
    }

    #[test]
    fn test_clear_drops_queued_values() {
        let mut memory = Box::new(Memory([0; 1024]));
        let boundary = Boundary::new(memory.0.as_mut_ptr(), memory.0.len());
        let arena: Arena<'_, NoBoundsChecking> =
            unsafe { Arena::from_boundary("queue", boundary, AllocatorKind::Stack).unwrap() };

        let mut queue = FixedQueue::with_capacity(&arena, 4).unwrap();
        for word in ["move", "jump", "fire"] {
            queue.push_back(word.to_owned()).unwrap();
        }
        queue.clear();
        assert!(queue.is_empty());
        queue.push_back("reload".to_owned()).unwrap();
        assert_eq!(queue.front().map(String::as_str), Some("reload"));
    }
}
