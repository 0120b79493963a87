//! # Pool Allocator
//!
//! Fixed-size slot allocator for objects that are frequently allocated and
//! freed.
//!
//! ```text
//! | pad | G | slot 0 payload | G | pad | G | slot 1 payload | G | pad | ...
//!           ^ aligned                      ^ aligned
//! ```
//!
//! Slot `i` lives at `first_payload + i * stride`, so the slot index of a
//! pointer is `(ptr - first_payload) / stride`.

use std::marker::PhantomData;
use std::ptr::NonNull;

use super::{check_alignment, exhausted, verify_guards, write_guards, AllocationStrategy};
use crate::boundary::{align_forward, align_forward_adjustment_with_header, pointer_add, Boundary};
use crate::bounds::{BoundsChecking, DefaultBoundsChecking};
use crate::error::{MemoryError, MemoryResult};
use crate::report::report;

/// A pool of equally sized slots carved from one boundary.
///
/// Every request gets one whole slot. Requests larger than the element
/// size or more strictly aligned than the pool are refused.
///
/// # Thread Safety
///
/// This pool is NOT thread-safe. Use one pool per thread.
///
/// # Example
///
/// ```rust,ignore
/// struct Particle { x: f32, y: f32, life: f32 }
///
/// let kind = AllocatorKind::pool_for::<Particle>();
/// let mut pool: PoolAllocator = unsafe { PoolAllocator::new(boundary, 12, 4)? };
///
/// // Allocate - O(1)
/// let slot = pool.allocate(12, 4)?;
///
/// // Free - O(1)
/// unsafe { pool.free(slot)? };
/// ```
pub struct PoolAllocator<B: BoundsChecking = DefaultBoundsChecking> {
    /// The managed region.
    boundary: Boundary,
    /// Bytes per element as configured.
    element_size: usize,
    /// Alignment of every payload.
    alignment: usize,
    /// Distance between two consecutive payloads.
    stride: usize,
    /// Offset of slot 0's payload from the boundary start.
    first_payload: usize,
    /// Requested size per slot, `None` when the slot is free.
    slots: Box<[Option<usize>]>,
    /// Free list - indices of available slots.
    free_list: Vec<usize>,
    /// Number of allocated slots.
    allocated_count: usize,
    _checking: PhantomData<B>,
}

impl<B: BoundsChecking> PoolAllocator<B> {
    /// Creates a pool of `element_size`-byte slots aligned to `alignment`.
    ///
    /// The slot count is whatever fits in `boundary`.
    ///
    /// # Errors
    ///
    /// Reports an invalid alignment.
    ///
    /// # Safety
    ///
    /// `boundary` must be valid for reads and writes, used by nothing else,
    /// and outlive the allocator.
    #[track_caller]
    pub unsafe fn new(boundary: Boundary, element_size: usize, alignment: usize) -> MemoryResult<Self> {
        check_alignment(alignment)?;

        let slot_bytes = element_size
            .max(1)
            .checked_add(B::SIZE_TOTAL + alignment)
            .map(|bytes| bytes - alignment);
        let Some(slot_bytes) = slot_bytes else {
            return Err(report(MemoryError::UnsupportedRequest {
                size: element_size,
                alignment,
                reason: "pool element too large",
            }));
        };
        let stride = align_forward(slot_bytes, alignment);
        let first_payload =
            align_forward_adjustment_with_header(boundary.start_address(), alignment, B::SIZE_FRONT);
        let first_slot = first_payload - B::SIZE_FRONT;
        let capacity = boundary.size().saturating_sub(first_slot) / stride;

        tracing::debug!(
            "pool over {} bytes: {} slots of {} bytes (stride {})",
            boundary.size(),
            capacity,
            element_size,
            stride
        );

        Ok(Self {
            boundary,
            element_size,
            alignment,
            stride,
            first_payload,
            slots: vec![None; capacity].into_boxed_slice(),
            free_list: (0..capacity).rev().collect(),
            allocated_count: 0,
            _checking: PhantomData,
        })
    }

    /// Returns the total number of slots.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns the number of free slots.
    #[inline]
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    /// Bytes per element as configured.
    #[inline]
    #[must_use]
    pub const fn element_size(&self) -> usize {
        self.element_size
    }

    /// Alignment of every slot.
    #[inline]
    #[must_use]
    pub const fn alignment(&self) -> usize {
        self.alignment
    }

    /// Bytes between two slots, guards and padding included.
    #[inline]
    #[must_use]
    pub const fn stride(&self) -> usize {
        self.stride
    }

    /// Slot index of `ptr`, if it is exactly a slot payload.
    pub fn slot_index(&self, ptr: NonNull<u8>) -> Option<usize> {
        let address = ptr.as_ptr() as usize;
        let first = self.boundary.start_address() + self.first_payload;
        let distance = address.checked_sub(first)?;
        let index = distance / self.stride;
        (distance % self.stride == 0 && index < self.slots.len()).then_some(index)
    }

    #[track_caller]
    fn live_slot(&self, ptr: NonNull<u8>) -> MemoryResult<(usize, usize)> {
        let address = ptr.as_ptr() as usize;
        let Some(index) = self.slot_index(ptr) else {
            return Err(report(MemoryError::ForeignPointer { address }));
        };
        match self.slots[index] {
            Some(size) => Ok((index, size)),
            None => Err(report(MemoryError::DoubleFree { address })),
        }
    }

    fn payload(&self, index: usize) -> *mut u8 {
        pointer_add(self.boundary.as_ptr(), self.first_payload + index * self.stride)
    }
}

impl<B: BoundsChecking> AllocationStrategy for PoolAllocator<B> {
    fn allocate(&mut self, size: usize, alignment: usize) -> MemoryResult<NonNull<u8>> {
        check_alignment(alignment)?;
        if size > self.element_size {
            return Err(report(MemoryError::UnsupportedRequest {
                size,
                alignment,
                reason: "larger than the pool element",
            }));
        }
        if alignment > self.alignment {
            return Err(report(MemoryError::UnsupportedRequest {
                size,
                alignment,
                reason: "stricter than the pool alignment",
            }));
        }

        let Some(index) = self.free_list.pop() else {
            return Err(exhausted(size, 0));
        };

        let payload = self.payload(index);
        // SAFETY: every slot in `0..capacity` lies inside the boundary with
        // room for both guards.
        unsafe { write_guards::<B>(payload, size) };

        self.slots[index] = Some(size);
        self.allocated_count += 1;

        NonNull::new(payload).ok_or_else(|| exhausted(size, 0))
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) -> MemoryResult<()> {
        let (index, size) = self.live_slot(ptr)?;
        // SAFETY: the slot is live, its guards are inside the boundary.
        unsafe { verify_guards::<B>(ptr.as_ptr(), size)? };

        self.slots[index] = None;
        self.free_list.push(index);
        self.allocated_count -= 1;
        Ok(())
    }

    fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.free_list.clear();
        self.free_list.extend((0..self.slots.len()).rev());
        self.allocated_count = 0;
    }

    unsafe fn allocation_size(&self, ptr: NonNull<u8>) -> MemoryResult<usize> {
        Ok(self.live_slot(ptr)?.1)
    }

    unsafe fn verify(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        let (_, size) = self.live_slot(ptr)?;
        unsafe { verify_guards::<B>(ptr.as_ptr(), size) }
    }

    fn total_bytes_allocated(&self) -> usize {
        self.allocated_count * self.stride
    }

    fn allocation_count(&self) -> usize {
        self.allocated_count
    }

    fn boundary(&self) -> Boundary {
        self.boundary
    }
}
