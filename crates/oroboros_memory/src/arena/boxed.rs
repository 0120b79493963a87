//! Typed allocation on top of an arena.
//!
//! [`ArenaBox`] owns one `T`, [`ArenaArray`] owns `len` of them. Both drop
//! their contents and hand the bytes back to the arena on drop. Zero-sized
//! types never touch the arena.

use std::fmt;
use std::marker::PhantomData;
use std::mem::{self, ManuallyDrop};
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};

use bytemuck::Zeroable;

use super::{Arena, RawArena};
use crate::bounds::BoundsChecking;
use crate::error::{MemoryError, MemoryResult};
use crate::report::report;

/// A single `T` living in an arena.
pub struct ArenaBox<'a, T> {
    ptr: NonNull<T>,
    arena: &'a dyn RawArena,
    _owns: PhantomData<T>,
}

impl<'a, T> ArenaBox<'a, T> {
    /// Moves the value out and frees its bytes.
    #[must_use]
    pub fn into_inner(self) -> T {
        let this = ManuallyDrop::new(self);
        // SAFETY: the value is initialized and read exactly once; the box is
        // never dropped afterwards.
        let value = unsafe { ptr::read(this.ptr.as_ptr()) };
        unsafe { release(this.arena, this.ptr) };
        value
    }

    /// Keeps the value alive for as long as the arena is borrowed.
    ///
    /// The bytes come back on the next arena reset.
    #[must_use]
    pub fn leak(self) -> &'a mut T {
        let this = ManuallyDrop::new(self);
        // SAFETY: the allocation stays live because it is never freed.
        unsafe { &mut *this.ptr.as_ptr() }
    }

    /// Raw pointer to the value.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *const T {
        self.ptr.as_ptr()
    }
}

impl<T> Deref for ArenaBox<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: `ptr` is initialized and uniquely owned by this box.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for ArenaBox<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above, and `&mut self` proves uniqueness.
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Drop for ArenaBox<'_, T> {
    fn drop(&mut self) {
        // SAFETY: the value is initialized and dropped exactly once.
        unsafe {
            ptr::drop_in_place(self.ptr.as_ptr());
            release(self.arena, self.ptr);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ArenaBox<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// `len` values of `T` living contiguously in an arena.
pub struct ArenaArray<'a, T> {
    ptr: NonNull<T>,
    len: usize,
    arena: &'a dyn RawArena,
    _owns: PhantomData<T>,
}

impl<T> ArenaArray<'_, T> {
    /// Number of elements.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the array holds no elements.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> Deref for ArenaArray<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: `len` elements are initialized.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> DerefMut for ArenaArray<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: `len` elements are initialized and uniquely owned.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> Drop for ArenaArray<'_, T> {
    fn drop(&mut self) {
        // SAFETY: every element is initialized and dropped exactly once.
        unsafe {
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len));
            if self.len > 0 {
                release(self.arena, self.ptr);
            }
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ArenaArray<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Frees a typed block unless `T` is zero-sized.
///
/// # Safety
///
/// `ptr` must come from `arena` (or be dangling for a zero-sized `T`).
unsafe fn release<T>(arena: &dyn RawArena, ptr: NonNull<T>) {
    if mem::size_of::<T>() != 0 {
        // Failures are already reported, nothing more to do in a drop.
        let _ = unsafe { arena.free_raw(ptr.cast()) };
    }
}

impl<'m, B: BoundsChecking> Arena<'m, B> {
    /// Moves `value` into the arena.
    ///
    /// # Errors
    ///
    /// Reports and returns allocation failures. `value` is dropped.
    #[track_caller]
    pub fn alloc<T>(&self, value: T) -> MemoryResult<ArenaBox<'_, T>> {
        self.alloc_with(|| value)
    }

    /// Allocates, then builds the value in place.
    ///
    /// # Errors
    ///
    /// Reports and returns allocation failures; `init` is not called.
    #[track_caller]
    pub fn alloc_with<T>(&self, init: impl FnOnce() -> T) -> MemoryResult<ArenaBox<'_, T>> {
        let ptr = self.typed_block::<T>(1)?;
        // SAFETY: the block is sized and aligned for one `T`.
        unsafe { ptr.as_ptr().write(init()) };
        Ok(ArenaBox {
            ptr,
            arena: self,
            _owns: PhantomData,
        })
    }

    /// Allocates `count` elements built by `init(index)`.
    ///
    /// # Errors
    ///
    /// Reports size overflow and allocation failures.
    #[track_caller]
    pub fn alloc_array_with<T>(
        &self,
        count: usize,
        mut init: impl FnMut(usize) -> T,
    ) -> MemoryResult<ArenaArray<'_, T>> {
        let ptr = self.typed_block::<T>(count)?;
        for index in 0..count {
            // SAFETY: `index < count`, inside the block.
            unsafe { ptr.as_ptr().add(index).write(init(index)) };
        }
        Ok(ArenaArray {
            ptr,
            len: count,
            arena: self,
            _owns: PhantomData,
        })
    }

    /// Allocates `count` default-constructed elements.
    ///
    /// # Errors
    ///
    /// Reports size overflow and allocation failures.
    #[track_caller]
    pub fn alloc_array_default<T: Default>(&self, count: usize) -> MemoryResult<ArenaArray<'_, T>> {
        self.alloc_array_with(count, |_| T::default())
    }

    /// Allocates `count` elements with every byte zero.
    ///
    /// # Errors
    ///
    /// Reports size overflow and allocation failures.
    #[track_caller]
    pub fn alloc_array_zeroed<T: Zeroable>(&self, count: usize) -> MemoryResult<ArenaArray<'_, T>> {
        let ptr = self.typed_block::<T>(count)?;
        // SAFETY: the block holds `count` elements, and all-zero is a valid
        // `T` by the `Zeroable` contract.
        unsafe { ptr.as_ptr().write_bytes(0, count) };
        Ok(ArenaArray {
            ptr,
            len: count,
            arena: self,
            _owns: PhantomData,
        })
    }

    /// Uninitialized storage for `count` values of `T`.
    #[track_caller]
    fn typed_block<T>(&self, count: usize) -> MemoryResult<NonNull<T>> {
        let element_size = mem::size_of::<T>();
        let Some(bytes) = element_size.checked_mul(count) else {
            return Err(report(MemoryError::SizeOverflow {
                count,
                element_size,
            }));
        };
        if bytes == 0 {
            return Ok(NonNull::dangling());
        }

        let raw = self.allocate_tagged(bytes, mem::align_of::<T>(), std::any::type_name::<T>())?;
        Ok(raw.cast())
    }
}
