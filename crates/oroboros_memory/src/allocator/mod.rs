//! # Allocator Strategies
//!
//! Four ways of handing out bytes from one [`Boundary`]:
//!
//! | Strategy   | Allocate | Free                 | Reset | Sizes    |
//! |------------|----------|----------------------|-------|----------|
//! | Linear     | O(1)     | no-op                | O(1)  | any      |
//! | Stack      | O(1)     | LIFO only            | O(1)  | any      |
//! | Pool       | O(1)     | any order            | O(n)  | one slot |
//! | FreeList   | O(n)     | any order, coalesced | O(n)  | any      |
//!
//! No strategy owns the bytes it manages. Every strategy reports capacity
//! exhaustion, foreign pointers and guard corruption through
//! [`crate::report`].
//!
//! [`AllocatorKind::max_memory_for`] sizes a boundary that is guaranteed to
//! hold one allocation.

// SAFETY: Strategies store headers inside the memory they manage.
// Headers are plain-old-data and always read/written unaligned.
#![allow(unsafe_code)]

mod free_list;
mod linear;
mod pool;
mod stack;

pub use free_list::{FitPolicy, FreeListAllocator};
pub use linear::LinearAllocator;
pub use pool::PoolAllocator;
pub use stack::StackAllocator;

use std::ptr::{self, NonNull};

use bytemuck::{Pod, Zeroable};

use crate::boundary::{
    align_forward_adjustment_with_header, get_max_memory_for_allocation, is_power_of_two, Boundary,
};
use crate::bounds::{BoundsChecking, DefaultBoundsChecking};
use crate::error::{GuardSide, MemoryError, MemoryResult};
use crate::report::report;

/// The capability set every strategy provides.
pub trait AllocationStrategy {
    /// Hands out `size` bytes aligned to `alignment`.
    ///
    /// # Errors
    ///
    /// Reports and returns an error when the boundary has no room left or
    /// the request is malformed.
    #[track_caller]
    fn allocate(&mut self, size: usize, alignment: usize) -> MemoryResult<NonNull<u8>>;

    /// Returns an allocation according to the strategy's free discipline.
    ///
    /// # Errors
    ///
    /// Reports foreign pointers, double frees, order violations and
    /// damaged guards.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on this strategy and the
    /// caller must not touch the payload afterwards.
    #[track_caller]
    unsafe fn free(&mut self, ptr: NonNull<u8>) -> MemoryResult<()>;

    /// Drops every allocation at once. The caller guarantees none is in use.
    fn reset(&mut self);

    /// The payload size originally requested for `ptr`.
    ///
    /// # Errors
    ///
    /// Reports pointers that do not name a live allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on this strategy.
    #[track_caller]
    unsafe fn allocation_size(&self, ptr: NonNull<u8>) -> MemoryResult<usize>;

    /// Checks the guards of a live allocation without freeing it.
    ///
    /// # Errors
    ///
    /// Reports damaged guards as corruption.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this strategy.
    #[track_caller]
    unsafe fn verify(&self, ptr: NonNull<u8>) -> MemoryResult<()>;

    /// Bytes currently considered in use, overhead included.
    fn total_bytes_allocated(&self) -> usize;

    /// Number of allocations not yet freed.
    fn allocation_count(&self) -> usize;

    /// The region this strategy manages.
    fn boundary(&self) -> Boundary;

    /// Whether `ptr` lies inside the managed region.
    fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.boundary().contains(ptr.as_ptr())
    }
}

/// Which strategy to build, with its parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocatorKind {
    /// Bump pointer, reset-only reclamation.
    Linear,
    /// Bump pointer with LIFO frees.
    Stack,
    /// Fixed-size slots.
    Pool {
        /// Bytes per element.
        element_size: usize,
        /// Alignment of every slot.
        alignment: usize,
    },
    /// General purpose with coalescing.
    FreeList {
        /// Search policy for free blocks.
        policy: FitPolicy,
    },
}

impl AllocatorKind {
    /// Pool sized and aligned for `T`.
    #[must_use]
    pub const fn pool_for<T>() -> Self {
        Self::Pool {
            element_size: std::mem::size_of::<T>(),
            alignment: std::mem::align_of::<T>(),
        }
    }

    /// Whether individual frees give memory back.
    #[must_use]
    pub const fn reclaims_on_free(&self) -> bool {
        !matches!(self, Self::Linear)
    }

    /// Bookkeeping bytes stored in front of every payload's front guard.
    #[must_use]
    pub const fn header_size(&self) -> usize {
        match self {
            Self::Linear | Self::Stack => ALLOCATION_HEADER_SIZE,
            Self::Pool { .. } => 0,
            Self::FreeList { .. } => free_list::USED_HEADER_SIZE,
        }
    }

    /// Smallest boundary size that always holds one `size`-byte allocation
    /// aligned to `alignment`, wherever the boundary starts.
    ///
    /// A pool always needs one whole slot, whatever the request.
    #[must_use]
    pub fn max_memory_for<B: BoundsChecking>(&self, size: usize, alignment: usize) -> usize {
        match *self {
            Self::Linear | Self::Stack => get_max_memory_for_allocation(
                size,
                alignment,
                ALLOCATION_HEADER_SIZE,
                B::SIZE_TOTAL,
            ),
            // Slot stride rounding plus the first slot's alignment.
            Self::Pool {
                element_size,
                alignment: slot_alignment,
            } => get_max_memory_for_allocation(element_size, slot_alignment, 0, B::SIZE_TOTAL)
                .saturating_add(slot_alignment.saturating_sub(1)),
            Self::FreeList { .. } => get_max_memory_for_allocation(
                size,
                alignment,
                free_list::USED_HEADER_SIZE,
                B::SIZE_TOTAL,
            )
            .max(free_list::NODE_SIZE),
        }
    }
}

impl std::fmt::Display for AllocatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Linear => f.write_str("linear"),
            Self::Stack => f.write_str("stack"),
            Self::Pool { element_size, alignment } => {
                write!(f, "pool({element_size}b, align {alignment})")
            }
            Self::FreeList { policy } => write!(f, "free-list({policy:?})"),
        }
    }
}

/// Closed sum over the four strategies, sharing one bounds-checking policy.
pub enum Allocator<B: BoundsChecking = DefaultBoundsChecking> {
    /// See [`LinearAllocator`].
    Linear(LinearAllocator<B>),
    /// See [`StackAllocator`].
    Stack(StackAllocator<B>),
    /// See [`PoolAllocator`].
    Pool(PoolAllocator<B>),
    /// See [`FreeListAllocator`].
    FreeList(FreeListAllocator<B>),
}

macro_rules! dispatch {
    ($self:expr, $inner:ident => $body:expr) => {
        match $self {
            Allocator::Linear($inner) => $body,
            Allocator::Stack($inner) => $body,
            Allocator::Pool($inner) => $body,
            Allocator::FreeList($inner) => $body,
        }
    };
}

impl<B: BoundsChecking> Allocator<B> {
    /// Builds the strategy described by `kind` over `boundary`.
    ///
    /// # Errors
    ///
    /// Fails when a pool's parameters are invalid.
    ///
    /// # Safety
    ///
    /// `boundary` must be valid for reads and writes, used by nothing else,
    /// and outlive the allocator.
    #[track_caller]
    pub unsafe fn new(kind: AllocatorKind, boundary: Boundary) -> MemoryResult<Self> {
        let allocator = match kind {
            AllocatorKind::Linear => Self::Linear(unsafe { LinearAllocator::new(boundary) }),
            AllocatorKind::Stack => Self::Stack(unsafe { StackAllocator::new(boundary) }),
            AllocatorKind::Pool {
                element_size,
                alignment,
            } => Self::Pool(unsafe { PoolAllocator::new(boundary, element_size, alignment)? }),
            AllocatorKind::FreeList { policy } => {
                Self::FreeList(unsafe { FreeListAllocator::new(boundary, policy) })
            }
        };
        Ok(allocator)
    }

    /// The kind this allocator was built from.
    #[must_use]
    pub fn kind(&self) -> AllocatorKind {
        match self {
            Self::Linear(_) => AllocatorKind::Linear,
            Self::Stack(_) => AllocatorKind::Stack,
            Self::Pool(pool) => AllocatorKind::Pool {
                element_size: pool.element_size(),
                alignment: pool.alignment(),
            },
            Self::FreeList(list) => AllocatorKind::FreeList {
                policy: list.policy(),
            },
        }
    }
}

impl<B: BoundsChecking> AllocationStrategy for Allocator<B> {
    fn allocate(&mut self, size: usize, alignment: usize) -> MemoryResult<NonNull<u8>> {
        dispatch!(self, inner => inner.allocate(size, alignment))
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) -> MemoryResult<()> {
        dispatch!(self, inner => unsafe { inner.free(ptr) })
    }

    fn reset(&mut self) {
        dispatch!(self, inner => inner.reset());
    }

    unsafe fn allocation_size(&self, ptr: NonNull<u8>) -> MemoryResult<usize> {
        dispatch!(self, inner => unsafe { inner.allocation_size(ptr) })
    }

    unsafe fn verify(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        dispatch!(self, inner => unsafe { inner.verify(ptr) })
    }

    fn total_bytes_allocated(&self) -> usize {
        dispatch!(self, inner => inner.total_bytes_allocated())
    }

    fn allocation_count(&self) -> usize {
        dispatch!(self, inner => inner.allocation_count())
    }

    fn boundary(&self) -> Boundary {
        dispatch!(self, inner => inner.boundary())
    }
}

/// Header stored in front of every linear and stack allocation.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct AllocationHeader {
    /// Requested payload size.
    pub(crate) size: usize,
    /// Distance from the block start to the payload.
    pub(crate) adjustment: usize,
    /// Stack only: payload offset of the block below, or [`NIL`].
    pub(crate) previous: usize,
    /// [`LIVE_MAGIC`] while allocated, [`FREED_MAGIC`] after free.
    pub(crate) magic: usize,
}

/// Size of [`AllocationHeader`] in bytes.
pub(crate) const ALLOCATION_HEADER_SIZE: usize = std::mem::size_of::<AllocationHeader>();

/// Offset sentinel for "no block".
pub(crate) const NIL: usize = usize::MAX;
pub(crate) const LIVE_MAGIC: usize = 0xA110_CA7E;
pub(crate) const FREED_MAGIC: usize = 0xF4EE_B10C;

/// Adjustment and total bytes of a bump block placed at `cursor`.
///
/// The total is the worst case from [`get_max_memory_for_allocation`] minus
/// the alignment padding this cursor does not need. `None` on overflow.
pub(crate) fn bump_layout<B: BoundsChecking>(
    cursor: usize,
    size: usize,
    alignment: usize,
) -> Option<(usize, usize)> {
    let worst =
        get_max_memory_for_allocation(size, alignment, ALLOCATION_HEADER_SIZE, B::SIZE_TOTAL);
    if worst == usize::MAX {
        return None;
    }
    let front = ALLOCATION_HEADER_SIZE + B::SIZE_FRONT;
    let adjustment = align_forward_adjustment_with_header(cursor, alignment, front);
    let unused_padding = (alignment - 1) - (adjustment - front);
    Some((adjustment, worst - unused_padding))
}

/// Reads a header from possibly unaligned memory.
///
/// `Pod` guarantees any bit pattern is a valid header, so even a trampled
/// header reads back as a value the caller can validate.
///
/// # Safety
///
/// `ptr` must be valid for `size_of::<H>()` byte reads.
#[inline]
pub(crate) unsafe fn read_header<H: Pod>(ptr: *const u8) -> H {
    unsafe { ptr::read_unaligned(ptr.cast::<H>()) }
}

/// Writes a header to possibly unaligned memory.
///
/// # Safety
///
/// `ptr` must be valid for `size_of::<H>()` byte writes.
#[inline]
pub(crate) unsafe fn write_header<H: Pod>(ptr: *mut u8, header: H) {
    unsafe { ptr::write_unaligned(ptr.cast::<H>(), header) };
}

/// Rejects zero and non-power-of-two alignments.
#[inline]
#[track_caller]
pub(crate) fn check_alignment(alignment: usize) -> MemoryResult<()> {
    if is_power_of_two(alignment) {
        Ok(())
    } else {
        Err(report(MemoryError::InvalidAlignment { alignment }))
    }
}

/// Writes both guards around a payload of `size` bytes.
///
/// # Safety
///
/// The guard ranges in front of and behind the payload must be writable.
#[inline]
pub(crate) unsafe fn write_guards<B: BoundsChecking>(payload: *mut u8, size: usize) {
    unsafe {
        B::guard_front(payload.wrapping_sub(B::SIZE_FRONT));
        B::guard_back(payload.wrapping_add(size));
    }
}

/// Verifies both guards around a payload of `size` bytes.
///
/// # Safety
///
/// The guard ranges in front of and behind the payload must be readable.
#[track_caller]
pub(crate) unsafe fn verify_guards<B: BoundsChecking>(
    payload: *const u8,
    size: usize,
) -> MemoryResult<()> {
    let address = payload as usize;
    if !unsafe { B::check_front(payload.wrapping_sub(B::SIZE_FRONT)) } {
        return Err(report(MemoryError::Corruption {
            address,
            side: GuardSide::Front,
        }));
    }
    if !unsafe { B::check_back(payload.wrapping_add(size)) } {
        return Err(report(MemoryError::Corruption {
            address,
            side: GuardSide::Back,
        }));
    }
    Ok(())
}

/// Reports a request that does not fit in what is left.
#[track_caller]
pub(crate) fn exhausted(requested: usize, available: usize) -> MemoryError {
    report(MemoryError::CapacityExhausted {
        requested,
        available,
    })
}
