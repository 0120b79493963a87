//! # Linear Allocator
//!
//! A bump allocator for data that dies all at once.
//!
//! `free` never gives memory back: it validates the pointer and the guards
//! and marks the header freed, so a second free is reported. Space returns
//! on [`AllocationStrategy::reset`], which makes the next allocation start
//! at the same address as the very first one.

use std::marker::PhantomData;
use std::ptr::NonNull;

use super::{
    bump_layout, check_alignment, exhausted, read_header, verify_guards, write_guards,
    write_header, AllocationHeader, AllocationStrategy, ALLOCATION_HEADER_SIZE, FREED_MAGIC,
    LIVE_MAGIC, NIL,
};
use crate::boundary::{pointer_add, Boundary};
use crate::bounds::{BoundsChecking, DefaultBoundsChecking};
use crate::error::{MemoryError, MemoryResult};
use crate::report::report;

/// A bump-pointer allocator over one boundary.
///
/// # Thread Safety
///
/// This allocator is NOT thread-safe. Use one per thread.
///
/// # Example
///
/// ```rust,ignore
/// let mut linear: LinearAllocator = unsafe { LinearAllocator::new(boundary) };
/// let a = linear.allocate(256, 16)?;
/// let b = linear.allocate(64, 8)?;
///
/// // Everything goes away together
/// linear.reset();
/// ```
pub struct LinearAllocator<B: BoundsChecking = DefaultBoundsChecking> {
    /// The managed region.
    boundary: Boundary,
    /// Bytes consumed from the start of the boundary.
    offset: usize,
    /// Allocations handed out and not yet passed to `free`.
    live: usize,
    _checking: PhantomData<B>,
}

impl<B: BoundsChecking> LinearAllocator<B> {
    /// Creates an empty linear allocator over `boundary`.
    ///
    /// # Safety
    ///
    /// `boundary` must be valid for reads and writes, used by nothing else,
    /// and outlive the allocator.
    #[must_use]
    pub unsafe fn new(boundary: Boundary) -> Self {
        Self {
            boundary,
            offset: 0,
            live: 0,
            _checking: PhantomData,
        }
    }

    /// Remaining bytes before the bump pointer hits the end.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.boundary.size() - self.offset
    }

    /// Whether `ptr` can be a payload inside the used part.
    fn in_use(&self, ptr: NonNull<u8>) -> bool {
        let address = ptr.as_ptr() as usize;
        let start = self.boundary.start_address();
        let front = ALLOCATION_HEADER_SIZE + B::SIZE_FRONT;
        address >= start + front && address < start + self.offset
    }

    #[inline]
    fn header_ptr(ptr: NonNull<u8>) -> *mut u8 {
        ptr.as_ptr().wrapping_sub(B::SIZE_FRONT + ALLOCATION_HEADER_SIZE)
    }

    /// Reads the header of a live payload.
    #[track_caller]
    fn header_of(&self, ptr: NonNull<u8>) -> MemoryResult<AllocationHeader> {
        let address = ptr.as_ptr() as usize;
        if !self.in_use(ptr) {
            return Err(report(MemoryError::ForeignPointer { address }));
        }
        // SAFETY: `in_use` proved the header lies in the used part.
        let header: AllocationHeader = unsafe { read_header(Self::header_ptr(ptr)) };
        match header.magic {
            LIVE_MAGIC => Ok(header),
            FREED_MAGIC => Err(report(MemoryError::DoubleFree { address })),
            _ => Err(report(MemoryError::ForeignPointer { address })),
        }
    }
}

impl<B: BoundsChecking> AllocationStrategy for LinearAllocator<B> {
    fn allocate(&mut self, size: usize, alignment: usize) -> MemoryResult<NonNull<u8>> {
        check_alignment(alignment)?;

        let cursor = self.boundary.start_address() + self.offset;
        // Zero-sized requests still occupy a byte so every payload is unique.
        let (adjustment, needed) = match bump_layout::<B>(cursor, size, alignment) {
            Some((adjustment, needed)) if needed <= self.remaining() => (adjustment, needed),
            _ => return Err(exhausted(size, self.remaining())),
        };

        let payload = pointer_add(self.boundary.as_ptr(), self.offset + adjustment);
        // SAFETY: `needed` bytes from the cursor fit inside the boundary, and
        // they cover header, guards and payload.
        unsafe {
            write_header(
                payload.wrapping_sub(B::SIZE_FRONT + ALLOCATION_HEADER_SIZE),
                AllocationHeader {
                    size,
                    adjustment,
                    previous: NIL,
                    magic: LIVE_MAGIC,
                },
            );
            write_guards::<B>(payload, size);
        }

        self.offset += needed;
        self.live += 1;

        NonNull::new(payload).ok_or_else(|| exhausted(size, 0))
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) -> MemoryResult<()> {
        let header = self.header_of(ptr)?;
        // SAFETY: the header lies in the used part, so do its guards.
        unsafe {
            verify_guards::<B>(ptr.as_ptr(), header.size)?;
            write_header(
                Self::header_ptr(ptr),
                AllocationHeader {
                    magic: FREED_MAGIC,
                    ..header
                },
            );
        }
        self.live = self.live.saturating_sub(1);
        Ok(())
    }

    fn reset(&mut self) {
        self.offset = 0;
        self.live = 0;
    }

    unsafe fn allocation_size(&self, ptr: NonNull<u8>) -> MemoryResult<usize> {
        Ok(self.header_of(ptr)?.size)
    }

    unsafe fn verify(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        let header = self.header_of(ptr)?;
        unsafe { verify_guards::<B>(ptr.as_ptr(), header.size) }
    }

    fn total_bytes_allocated(&self) -> usize {
        self.offset
    }

    fn allocation_count(&self) -> usize {
        self.live
    }

    fn boundary(&self) -> Boundary {
        self.boundary
    }
}
