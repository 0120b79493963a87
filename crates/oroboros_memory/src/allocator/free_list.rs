//! # Free-List Allocator
//!
//! General-purpose allocation with arbitrary sizes and out-of-order frees.
//!
//! Free blocks form a singly linked list kept in **address order**, with
//! the nodes stored inside the free memory itself:
//!
//! ```text
//! free block:  | FreeNode { size, next } | ...unused...                 |
//! used block:  | pad | UsedHeader | G | payload | G | ...tail slack...  |
//!              ^ block start (size = block_size)
//! ```
//!
//! Allocation searches first-fit or best-fit and splits the block when the
//! remainder can hold a node. Freeing re-inserts the block in address
//! order and merges it with adjacent free neighbours.

use std::marker::PhantomData;
use std::ptr::NonNull;

use bytemuck::{Pod, Zeroable};

use super::{
    check_alignment, exhausted, read_header, verify_guards, write_guards, write_header,
    AllocationStrategy, FREED_MAGIC, LIVE_MAGIC, NIL,
};
use crate::boundary::{align_forward_adjustment_with_header, pointer_add, Boundary};
use crate::bounds::{BoundsChecking, DefaultBoundsChecking};
use crate::error::{MemoryError, MemoryResult};
use crate::report::report;

/// How a free block is chosen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FitPolicy {
    /// The first block in address order that fits.
    #[default]
    FirstFit,
    /// The smallest block that fits.
    BestFit,
}

/// Node at the start of every free block.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct FreeNode {
    /// Whole block size, node included.
    size: usize,
    /// Offset of the next free block, or [`NIL`].
    next: usize,
}

/// Header right in front of every live payload's front guard.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct UsedHeader {
    /// Requested payload size.
    size: usize,
    /// Whole block size.
    block_size: usize,
    /// Distance from the block start to the payload.
    adjustment: usize,
    /// [`LIVE_MAGIC`] while allocated, [`FREED_MAGIC`] after free.
    /// Last field so a node written over the block start keeps it.
    magic: usize,
}

pub(super) const NODE_SIZE: usize = std::mem::size_of::<FreeNode>();
pub(super) const USED_HEADER_SIZE: usize = std::mem::size_of::<UsedHeader>();

struct Candidate {
    prev: usize,
    offset: usize,
    node: FreeNode,
    adjustment: usize,
    needed: usize,
}

/// A first-fit / best-fit allocator with coalescing.
///
/// # Invariants
///
/// - Free blocks never overlap and are sorted by address.
/// - No two free blocks are adjacent after a free completes.
/// - Every block is at least one `FreeNode` large.
///
/// # Thread Safety
///
/// This allocator is NOT thread-safe. Use one per thread.
pub struct FreeListAllocator<B: BoundsChecking = DefaultBoundsChecking> {
    /// The managed region.
    boundary: Boundary,
    /// Search policy.
    policy: FitPolicy,
    /// Offset of the first free block, or [`NIL`].
    head: usize,
    /// Bytes held by live blocks.
    used: usize,
    /// Live blocks.
    live: usize,
    _checking: PhantomData<B>,
}

impl<B: BoundsChecking> FreeListAllocator<B> {
    /// Creates an allocator whose whole boundary is one free block.
    ///
    /// # Safety
    ///
    /// `boundary` must be valid for reads and writes, used by nothing else,
    /// and outlive the allocator.
    #[must_use]
    pub unsafe fn new(boundary: Boundary, policy: FitPolicy) -> Self {
        let mut allocator = Self {
            boundary,
            policy,
            head: NIL,
            used: 0,
            live: 0,
            _checking: PhantomData,
        };
        allocator.reset();
        allocator
    }

    /// The search policy.
    #[inline]
    #[must_use]
    pub const fn policy(&self) -> FitPolicy {
        self.policy
    }

    /// Number of blocks in the free list.
    #[must_use]
    pub fn free_block_count(&self) -> usize {
        self.free_blocks().count()
    }

    /// Size of the largest free block.
    #[must_use]
    pub fn largest_free_block(&self) -> usize {
        self.free_blocks().map(|(_, node)| node.size).max().unwrap_or(0)
    }

    /// Bytes in all free blocks.
    #[must_use]
    pub fn total_free(&self) -> usize {
        self.free_blocks().map(|(_, node)| node.size).sum()
    }

    fn free_blocks(&self) -> impl Iterator<Item = (usize, FreeNode)> + '_ {
        let mut current = self.head;
        std::iter::from_fn(move || {
            if current == NIL {
                return None;
            }
            let offset = current;
            let node = self.node(offset);
            current = node.next;
            Some((offset, node))
        })
    }

    fn node(&self, offset: usize) -> FreeNode {
        // SAFETY: free-list offsets always point at a node inside the boundary.
        unsafe { read_header(pointer_add(self.boundary.as_ptr(), offset)) }
    }

    fn set_node(&mut self, offset: usize, node: FreeNode) {
        // SAFETY: callers only write nodes inside blocks they own.
        unsafe { write_header(pointer_add(self.boundary.as_ptr(), offset), node) };
    }

    fn link(&mut self, prev: usize, next: usize) {
        if prev == NIL {
            self.head = next;
        } else {
            let node = self.node(prev);
            self.set_node(prev, FreeNode { next, ..node });
        }
    }

    fn find(&self, size: usize, alignment: usize) -> Option<Candidate> {
        let start = self.boundary.start_address();
        let mut best: Option<Candidate> = None;
        let mut prev = NIL;

        for (offset, node) in self.free_blocks() {
            let adjustment = align_forward_adjustment_with_header(
                start + offset,
                alignment,
                USED_HEADER_SIZE + B::SIZE_FRONT,
            );
            let needed = adjustment
                .checked_add(size.max(1))
                .and_then(|bytes| bytes.checked_add(B::SIZE_BACK))
                .map(|bytes| bytes.max(NODE_SIZE));

            if let Some(needed) = needed.filter(|needed| *needed <= node.size) {
                let better = best.as_ref().map_or(true, |current| node.size < current.node.size);
                if better {
                    best = Some(Candidate {
                        prev,
                        offset,
                        node,
                        adjustment,
                        needed,
                    });
                }
                if self.policy == FitPolicy::FirstFit || node.size == needed {
                    break;
                }
            }
            prev = offset;
        }

        best
    }

    /// Reads and validates the header of a live payload.
    #[track_caller]
    fn live_header(&self, ptr: NonNull<u8>) -> MemoryResult<(usize, UsedHeader)> {
        let address = ptr.as_ptr() as usize;
        let foreign = MemoryError::ForeignPointer { address };
        if !self.boundary.contains(ptr.as_ptr()) {
            return Err(report(foreign));
        }

        let offset = address - self.boundary.start_address();
        let front = USED_HEADER_SIZE + B::SIZE_FRONT;
        if offset < front {
            return Err(report(foreign));
        }

        // SAFETY: `offset >= front`, so the header lies inside the boundary.
        let header: UsedHeader = unsafe { read_header(ptr.as_ptr().wrapping_sub(front)) };
        match header.magic {
            LIVE_MAGIC => {}
            FREED_MAGIC => return Err(report(MemoryError::DoubleFree { address })),
            _ => return Err(report(foreign)),
        }

        let consistent = header.adjustment >= front
            && header.adjustment <= offset
            && header.block_size >= NODE_SIZE
            && (offset - header.adjustment)
                .checked_add(header.block_size)
                .is_some_and(|end| end <= self.boundary.size());
        if !consistent {
            return Err(report(foreign));
        }

        Ok((offset, header))
    }
}

impl<B: BoundsChecking> AllocationStrategy for FreeListAllocator<B> {
    fn allocate(&mut self, size: usize, alignment: usize) -> MemoryResult<NonNull<u8>> {
        check_alignment(alignment)?;

        let Some(candidate) = self.find(size, alignment) else {
            return Err(exhausted(size, self.largest_free_block()));
        };

        let remainder = candidate.node.size - candidate.needed;
        let (block_size, next) = if remainder >= NODE_SIZE {
            let split = candidate.offset + candidate.needed;
            self.set_node(
                split,
                FreeNode {
                    size: remainder,
                    next: candidate.node.next,
                },
            );
            (candidate.needed, split)
        } else {
            (candidate.node.size, candidate.node.next)
        };
        self.link(candidate.prev, next);

        let payload_offset = candidate.offset + candidate.adjustment;
        let payload = pointer_add(self.boundary.as_ptr(), payload_offset);
        // SAFETY: header, guards and payload lie inside the chosen block.
        unsafe {
            write_header(
                payload.wrapping_sub(B::SIZE_FRONT + USED_HEADER_SIZE),
                UsedHeader {
                    size,
                    block_size,
                    adjustment: candidate.adjustment,
                    magic: LIVE_MAGIC,
                },
            );
            write_guards::<B>(payload, size);
        }

        self.used += block_size;
        self.live += 1;

        NonNull::new(payload).ok_or_else(|| exhausted(size, 0))
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) -> MemoryResult<()> {
        let address = ptr.as_ptr() as usize;
        let (offset, header) = self.live_header(ptr)?;
        // SAFETY: the header is consistent, so the guards lie in the block.
        unsafe { verify_guards::<B>(ptr.as_ptr(), header.size)? };

        let block = offset - header.adjustment;
        let block_size = header.block_size;

        let mut prev = NIL;
        let mut next = self.head;
        while next != NIL && next < block {
            prev = next;
            next = self.node(next).next;
        }

        let overlaps_next = next != NIL && block + block_size > next;
        let overlaps_prev = prev != NIL && prev + self.node(prev).size > block;
        if overlaps_next || overlaps_prev {
            return Err(report(MemoryError::DoubleFree { address }));
        }

        // SAFETY: same header location that `live_header` just read.
        unsafe {
            write_header(
                ptr.as_ptr().wrapping_sub(B::SIZE_FRONT + USED_HEADER_SIZE),
                UsedHeader {
                    magic: FREED_MAGIC,
                    ..header
                },
            );
        }

        self.set_node(
            block,
            FreeNode {
                size: block_size,
                next,
            },
        );
        self.link(prev, block);

        if next != NIL && block + block_size == next {
            let following = self.node(next);
            self.set_node(
                block,
                FreeNode {
                    size: block_size + following.size,
                    next: following.next,
                },
            );
        }
        if prev != NIL {
            let preceding = self.node(prev);
            if prev + preceding.size == block {
                let merged = self.node(block);
                self.set_node(
                    prev,
                    FreeNode {
                        size: preceding.size + merged.size,
                        next: merged.next,
                    },
                );
            }
        }

        self.used -= block_size;
        self.live -= 1;
        Ok(())
    }

    fn reset(&mut self) {
        if self.boundary.size() >= NODE_SIZE {
            self.set_node(
                0,
                FreeNode {
                    size: self.boundary.size(),
                    next: NIL,
                },
            );
            self.head = 0;
        } else {
            self.head = NIL;
        }
        self.used = 0;
        self.live = 0;
    }

    unsafe fn allocation_size(&self, ptr: NonNull<u8>) -> MemoryResult<usize> {
        Ok(self.live_header(ptr)?.1.size)
    }

    unsafe fn verify(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        let (_, header) = self.live_header(ptr)?;
        unsafe { verify_guards::<B>(ptr.as_ptr(), header.size) }
    }

    fn total_bytes_allocated(&self) -> usize {
        self.used
    }

    fn allocation_count(&self) -> usize {
        self.live
    }

    fn boundary(&self) -> Boundary {
        self.boundary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::{BasicBoundsChecking, NoBoundsChecking};
    use crate::report;

    #[repr(C, align(64))]
    struct Backing([u8; 1024]);

    impl Backing {
        fn new() -> Box<Self> {
            Box::new(Self([0; 1024]))
        }

        fn boundary(&mut self) -> Boundary {
            Boundary::new(self.0.as_mut_ptr(), self.0.len())
        }
    }

    #[test]
    fn test_adjacent_frees_coalesce() {
        let capture = report::capture();
        let mut backing = Backing::new();
        let mut list: FreeListAllocator<NoBoundsChecking> =
            unsafe { FreeListAllocator::new(backing.boundary(), FitPolicy::FirstFit) };

        let a = list.allocate(200, 8).unwrap();
        let b = list.allocate(200, 8).unwrap();
        // Fill the rest so no large tail block is left over.
        while list.allocate(64, 8).is_ok() {}
        assert!(capture.count() > 0);
        assert!(list.largest_free_block() < 232);

        unsafe {
            list.free(a).unwrap();
            list.free(b).unwrap();
        }
        assert_eq!(list.largest_free_block(), 464);
        assert_eq!(list.free_block_count(), 2);

        // Only fits if both blocks were merged.
        let merged = list.allocate(400, 8).unwrap();
        assert_eq!(merged, a);
    }

    #[test]
    fn test_full_release_restores_single_block() {
        let mut backing = Backing::new();
        let mut list: FreeListAllocator<BasicBoundsChecking> =
            unsafe { FreeListAllocator::new(backing.boundary(), FitPolicy::FirstFit) };

        let blocks: Vec<_> = (1..=6).map(|i| list.allocate(i * 10, 8).unwrap()).collect();
        for index in [3, 0, 5, 1, 4, 2] {
            unsafe { list.free(blocks[index]).unwrap() };
        }

        assert_eq!(list.free_block_count(), 1);
        assert_eq!(list.largest_free_block(), 1024);
        assert_eq!(list.total_bytes_allocated(), 0);
        assert_eq!(list.allocation_count(), 0);
    }

    #[test]
    fn test_fit_policies_pick_different_blocks() {
        for (policy, expect_small) in [(FitPolicy::FirstFit, false), (FitPolicy::BestFit, true)] {
            let mut backing = Backing::new();
            let mut list: FreeListAllocator<NoBoundsChecking> =
                unsafe { FreeListAllocator::new(backing.boundary(), policy) };

            let large = list.allocate(100, 8).unwrap();
            let _spacer = list.allocate(8, 8).unwrap();
            let small = list.allocate(50, 8).unwrap();
            let _spacer = list.allocate(8, 8).unwrap();
            unsafe {
                list.free(large).unwrap();
                list.free(small).unwrap();
            }

            let chosen = list.allocate(40, 8).unwrap();
            let expected = if expect_small { small } else { large };
            assert_eq!(chosen, expected, "{policy:?}");
        }
    }

    #[test]
    fn test_double_free_and_foreign_are_flagged() {
        let capture = report::capture();
        let mut backing = Backing::new();
        let mut list: FreeListAllocator<NoBoundsChecking> =
            unsafe { FreeListAllocator::new(backing.boundary(), FitPolicy::FirstFit) };

        let a = list.allocate(32, 8).unwrap();
        let _b = list.allocate(32, 8).unwrap();
        unsafe {
            list.free(a).unwrap();
            assert!(matches!(list.free(a), Err(MemoryError::DoubleFree { .. })));
        }

        let mut outside = 0u8;
        assert!(matches!(
            unsafe { list.free(NonNull::from(&mut outside)) },
            Err(MemoryError::ForeignPointer { .. })
        ));
        assert_eq!(capture.count(), 2);
    }

    #[test]
    fn test_guard_corruption_blocks_free() {
        let capture = report::capture();
        let mut backing = Backing::new();
        let mut list: FreeListAllocator<BasicBoundsChecking> =
            unsafe { FreeListAllocator::new(backing.boundary(), FitPolicy::BestFit) };

        let ptr = list.allocate(24, 8).unwrap();
        unsafe {
            ptr.as_ptr().sub(1).write(0x00);
            assert!(list.free(ptr).is_err());
        }
        assert!(matches!(
            capture.last_error(),
            Some(MemoryError::Corruption { side: crate::error::GuardSide::Front, .. })
        ));
        assert_eq!(list.allocation_count(), 1);
    }
}
