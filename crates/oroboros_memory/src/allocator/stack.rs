//! # Stack Allocator
//!
//! Bump allocation with last-in-first-out frees.
//!
//! Only the most recent live block can be freed. Anything else is a
//! bookkeeping mismatch: it is reported and nothing is reclaimed.

use std::marker::PhantomData;
use std::ptr::NonNull;

use super::{
    bump_layout, check_alignment, exhausted, read_header, verify_guards, write_guards,
    write_header, AllocationHeader, AllocationStrategy, ALLOCATION_HEADER_SIZE, LIVE_MAGIC, NIL,
};
use crate::boundary::{pointer_add, Boundary};
use crate::bounds::{BoundsChecking, DefaultBoundsChecking};
use crate::error::{MemoryError, MemoryResult};
use crate::report::report;

/// A LIFO allocator over one boundary.
///
/// # Thread Safety
///
/// This allocator is NOT thread-safe. Use one per thread.
pub struct StackAllocator<B: BoundsChecking = DefaultBoundsChecking> {
    /// The managed region.
    boundary: Boundary,
    /// Offset of the first free byte (the top of the stack).
    top: usize,
    /// Payload offset of the most recent live block, if any.
    last_payload: Option<usize>,
    /// Live blocks.
    live: usize,
    _checking: PhantomData<B>,
}

impl<B: BoundsChecking> StackAllocator<B> {
    /// Creates an empty stack allocator over `boundary`.
    ///
    /// # Safety
    ///
    /// `boundary` must be valid for reads and writes, used by nothing else,
    /// and outlive the allocator.
    #[must_use]
    pub unsafe fn new(boundary: Boundary) -> Self {
        Self {
            boundary,
            top: 0,
            last_payload: None,
            live: 0,
            _checking: PhantomData,
        }
    }

    /// Remaining bytes above the top.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.boundary.size() - self.top
    }

    /// Payload offset of `ptr` if it lies below the top.
    fn live_offset(&self, ptr: NonNull<u8>) -> Option<usize> {
        let address = ptr.as_ptr() as usize;
        let start = self.boundary.start_address();
        let front = ALLOCATION_HEADER_SIZE + B::SIZE_FRONT;
        (address >= start + front && address < start + self.top).then(|| address - start)
    }

    #[track_caller]
    fn header_of(&self, ptr: NonNull<u8>) -> MemoryResult<(usize, AllocationHeader)> {
        let address = ptr.as_ptr() as usize;
        let Some(offset) = self.live_offset(ptr) else {
            let error = if self.boundary.contains(ptr.as_ptr()) {
                MemoryError::DoubleFree { address }
            } else {
                MemoryError::ForeignPointer { address }
            };
            return Err(report(error));
        };
        let at = ptr.as_ptr().wrapping_sub(B::SIZE_FRONT + ALLOCATION_HEADER_SIZE);
        // SAFETY: the header sits below the top, inside the boundary.
        let header: AllocationHeader = unsafe { read_header(at) };
        if header.magic != LIVE_MAGIC || header.adjustment > offset {
            return Err(report(MemoryError::ForeignPointer { address }));
        }
        Ok((offset, header))
    }
}

impl<B: BoundsChecking> AllocationStrategy for StackAllocator<B> {
    fn allocate(&mut self, size: usize, alignment: usize) -> MemoryResult<NonNull<u8>> {
        check_alignment(alignment)?;

        let cursor = self.boundary.start_address() + self.top;
        let (adjustment, needed) = match bump_layout::<B>(cursor, size, alignment) {
            Some((adjustment, needed)) if needed <= self.remaining() => (adjustment, needed),
            _ => return Err(exhausted(size, self.remaining())),
        };

        let payload_offset = self.top + adjustment;
        let payload = pointer_add(self.boundary.as_ptr(), payload_offset);
        // SAFETY: `needed` bytes above the top fit inside the boundary.
        unsafe {
            write_header(
                payload.wrapping_sub(B::SIZE_FRONT + ALLOCATION_HEADER_SIZE),
                AllocationHeader {
                    size,
                    adjustment,
                    previous: self.last_payload.unwrap_or(NIL),
                    magic: LIVE_MAGIC,
                },
            );
            write_guards::<B>(payload, size);
        }

        self.top += needed;
        self.last_payload = Some(payload_offset);
        self.live += 1;

        NonNull::new(payload).ok_or_else(|| exhausted(size, 0))
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) -> MemoryResult<()> {
        let (offset, header) = self.header_of(ptr)?;
        let block_end = offset + header.size.max(1) + B::SIZE_BACK;
        if block_end != self.top {
            let expected = self
                .last_payload
                .map_or(0, |last| self.boundary.start_address() + last);
            return Err(report(MemoryError::StackOrderViolation {
                address: ptr.as_ptr() as usize,
                expected,
            }));
        }

        // SAFETY: header and guards of the top block are inside the boundary.
        unsafe { verify_guards::<B>(ptr.as_ptr(), header.size)? };

        self.top = offset - header.adjustment;
        self.live -= 1;
        self.last_payload = (header.previous != NIL).then_some(header.previous);
        Ok(())
    }

    fn reset(&mut self) {
        self.top = 0;
        self.last_payload = None;
        self.live = 0;
    }

    unsafe fn allocation_size(&self, ptr: NonNull<u8>) -> MemoryResult<usize> {
        Ok(self.header_of(ptr)?.1.size)
    }

    unsafe fn verify(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        let (_, header) = self.header_of(ptr)?;
        unsafe { verify_guards::<B>(ptr.as_ptr(), header.size) }
    }

    fn total_bytes_allocated(&self) -> usize {
        self.top
    }

    fn allocation_count(&self) -> usize {
        self.live
    }

    fn boundary(&self) -> Boundary {
        self.boundary
    }
}
