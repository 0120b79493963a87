//! Property-based tests for the allocator strategies.
//!
//! Random request streams against every strategy, checking the guarantees
//! arenas build on: alignment, containment, disjointness, exact sizes,
//! worst-case sizing and full reclamation.

// SAFETY: sizes and frees go through the unsafe strategy API.
#![allow(unsafe_code)]

use oroboros_memory::report;
use oroboros_memory::{
    AllocationStrategy, Allocator, AllocatorKind, BasicBoundsChecking, Boundary, FitPolicy,
    FreeListAllocator, LinearAllocator, MemoryArea, MemoryError, NoBoundsChecking,
};
use proptest::prelude::*;

const ARENA_BYTES: usize = 64 * 1024;

// =============================================================================
// STRATEGIES
// =============================================================================

fn arb_request() -> impl Strategy<Value = (usize, usize)> {
    (0usize..256, 0u32..7).prop_map(|(size, shift)| (size, 1usize << shift))
}

fn arb_requests() -> impl Strategy<Value = Vec<(usize, usize)>> {
    prop::collection::vec(arb_request(), 1..48)
}

fn arb_general_kind() -> impl Strategy<Value = AllocatorKind> {
    prop_oneof![
        Just(AllocatorKind::Linear),
        Just(AllocatorKind::Stack),
        Just(AllocatorKind::FreeList {
            policy: FitPolicy::FirstFit
        }),
        Just(AllocatorKind::FreeList {
            policy: FitPolicy::BestFit
        }),
    ]
}

fn arb_policy() -> impl Strategy<Value = FitPolicy> {
    prop_oneof![Just(FitPolicy::FirstFit), Just(FitPolicy::BestFit)]
}

/// Any kind, with pools shaped after the request.
fn kind_for(choice: u8, size: usize, alignment: usize) -> AllocatorKind {
    match choice % 4 {
        0 => AllocatorKind::Linear,
        1 => AllocatorKind::Stack,
        2 => AllocatorKind::Pool {
            element_size: size,
            alignment,
        },
        _ => AllocatorKind::FreeList {
            policy: FitPolicy::BestFit,
        },
    }
}

#[repr(C, align(64))]
struct Backing([u8; 4096]);

fn area() -> MemoryArea {
    let area = MemoryArea::new("Properties");
    area.init(ARENA_BYTES, 0).unwrap();
    area
}

// =============================================================================
// PROPERTIES
// =============================================================================

proptest! {
    #[test]
    fn prop_allocations_are_aligned_disjoint_and_exact(
        kind in arb_general_kind(),
        requests in arb_requests(),
    ) {
        let area = area();
        let sub_area = area.add_sub_area(ARENA_BYTES, "Requests").unwrap();
        let arena = area.create_arena::<BasicBoundsChecking>(sub_area, kind).unwrap();
        let boundary = arena.boundary();

        let mut live: Vec<(usize, usize)> = Vec::new();
        for (size, alignment) in requests {
            let ptr = arena.allocate(size, alignment).unwrap();
            let start = ptr.as_ptr() as usize;
            let end = start + size.max(1);

            prop_assert_eq!(start % alignment, 0);
            prop_assert!(boundary.contains_range(ptr.as_ptr(), size.max(1)));
            prop_assert_eq!(unsafe { arena.allocation_size(ptr) }.unwrap(), size);
            for &(other_start, other_end) in &live {
                prop_assert!(end <= other_start || other_end <= start);
            }
            live.push((start, end));
        }
        prop_assert_eq!(arena.allocation_count(), live.len());
    }

    #[test]
    fn prop_linear_is_monotonic_and_resets_to_start(requests in arb_requests()) {
        let area = area();
        let sub_area = area.add_sub_area(ARENA_BYTES, "Linear").unwrap();
        let mut arena = area
            .create_arena::<BasicBoundsChecking>(sub_area, AllocatorKind::Linear)
            .unwrap();

        let (first_size, first_alignment) = requests[0];
        let first = arena.allocate(first_size, first_alignment).unwrap();
        let mut previous = first.as_ptr() as usize;
        let mut used = arena.total_bytes_allocated();

        for &(size, alignment) in &requests[1..] {
            let ptr = arena.allocate(size, alignment).unwrap();
            prop_assert!(ptr.as_ptr() as usize > previous);
            prop_assert!(arena.total_bytes_allocated() > used);
            previous = ptr.as_ptr() as usize;
            used = arena.total_bytes_allocated();
        }

        arena.reset();
        prop_assert_eq!(arena.total_bytes_allocated(), 0);
        let again = arena.allocate(first_size, first_alignment).unwrap();
        prop_assert_eq!(again, first);
    }

    #[test]
    fn prop_stack_unwinds_to_empty(requests in arb_requests()) {
        let area = area();
        let sub_area = area.add_sub_area(ARENA_BYTES, "Stack").unwrap();
        let arena = area
            .create_arena::<BasicBoundsChecking>(sub_area, AllocatorKind::Stack)
            .unwrap();

        let mut live = Vec::new();
        let mut marks = Vec::new();
        for (size, alignment) in requests {
            marks.push(arena.total_bytes_allocated());
            live.push(arena.allocate(size, alignment).unwrap());
        }
        while let Some(ptr) = live.pop() {
            unsafe { arena.free(ptr) }.unwrap();
            prop_assert_eq!(Some(arena.total_bytes_allocated()), marks.pop());
        }
        prop_assert_eq!(arena.total_bytes_allocated(), 0);
    }

    #[test]
    fn prop_pool_cycles_never_exhaust(
        element_size in 1usize..128,
        shift in 0u32..6,
        rounds in 1usize..6,
    ) {
        let capture = report::capture();
        let area = area();
        let sub_area = area.add_sub_area(16 * 1024, "Pool").unwrap();
        let kind = AllocatorKind::Pool { element_size, alignment: 1 << shift };
        let arena = area.create_arena::<BasicBoundsChecking>(sub_area, kind).unwrap();

        let mut capacity = None;
        for _ in 0..rounds {
            let mut slots = Vec::new();
            while let Ok(slot) = arena.allocate(element_size, 1 << shift) {
                slots.push(slot);
            }
            prop_assert!(!slots.is_empty());
            prop_assert_eq!(*capacity.get_or_insert(slots.len()), slots.len());

            for slot in slots {
                unsafe { arena.free(slot) }.unwrap();
            }
            prop_assert_eq!(arena.allocation_count(), 0);
        }
        // One exhaustion report per round, nothing else.
        prop_assert_eq!(capture.count(), rounds);
    }

    #[test]
    fn prop_free_list_coalesces_back_to_one_block(
        policy in arb_policy(),
        blocks in prop::collection::vec((1usize..512, any::<u16>()), 1..32),
    ) {
        let area = area();
        let sub_area = area.add_sub_area(ARENA_BYTES, "FreeList").unwrap();
        let boundary = area.sub_area_boundary(sub_area).unwrap();
        // SAFETY: the sub-area is never handed to an arena in this test.
        let mut allocator: FreeListAllocator<BasicBoundsChecking> =
            unsafe { FreeListAllocator::new(boundary, policy) };
        let initial = allocator.largest_free_block();

        let mut live: Vec<_> = blocks
            .iter()
            .map(|&(size, order)| (order, allocator.allocate(size, 8).unwrap()))
            .collect();
        live.sort_by_key(|&(order, _)| order);

        for (_, ptr) in live {
            unsafe { allocator.free(ptr) }.unwrap();
        }
        prop_assert_eq!(allocator.allocation_count(), 0);
        prop_assert_eq!(allocator.free_block_count(), 1);
        prop_assert_eq!(allocator.largest_free_block(), initial);
    }

    #[test]
    fn prop_worst_case_size_always_fits_one_allocation(
        choice in any::<u8>(),
        (size, alignment) in arb_request(),
        shift in 0usize..64,
    ) {
        let kind = kind_for(choice, size, alignment);
        let bytes = kind.max_memory_for::<BasicBoundsChecking>(size, alignment);
        prop_assert!(bytes >= size + kind.header_size());

        let mut backing = Box::new(Backing([0; 4096]));
        let boundary = Boundary::new(backing.0.as_mut_ptr().wrapping_add(shift), bytes);
        let mut allocator: Allocator<BasicBoundsChecking> =
            unsafe { Allocator::new(kind, boundary) }.unwrap();

        let ptr = allocator.allocate(size, alignment).unwrap();
        prop_assert!(boundary.contains_range(ptr.as_ptr(), size.max(1)));
        prop_assert_eq!(unsafe { allocator.allocation_size(ptr) }.unwrap(), size);
    }

    #[test]
    fn prop_linear_second_free_is_reported(requests in arb_requests(), pick in any::<usize>()) {
        let _capture = report::capture();
        let mut backing = Box::new(Backing([0; 4096]));
        let boundary = Boundary::new(backing.0.as_mut_ptr(), 4096);
        let mut linear: LinearAllocator<NoBoundsChecking> =
            unsafe { LinearAllocator::new(boundary) };

        let live: Vec<_> = requests
            .iter()
            .map_while(|&(size, alignment)| linear.allocate(size, alignment).ok())
            .collect();
        prop_assume!(!live.is_empty());
        let ptr = live[pick % live.len()];

        unsafe { linear.free(ptr) }.unwrap();
        let second = unsafe { linear.free(ptr) };
        let address = ptr.as_ptr() as usize;
        prop_assert_eq!(second, Err(MemoryError::DoubleFree { address }));
        prop_assert_eq!(linear.allocation_count(), live.len() - 1);
    }
}
