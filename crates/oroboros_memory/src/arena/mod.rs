//! # Arenas
//!
//! An arena binds one allocator strategy to one boundary and adds the
//! bookkeeping the engine relies on:
//!
//! - call-site tags for every live allocation (when tracking is enabled)
//! - requested-bytes and peak counters
//! - a leak report when the arena drops with live allocations
//!
//! ## Ownership
//!
//! `Arena<'m, B>` borrows its memory source for `'m`:
//!
//! - over a sub-area: the [`crate::MemoryArea`] cannot shut down while the
//!   arena lives, and the sub-area cannot back a second arena
//! - as a child: the parent arena stays mutably borrowed, so children are
//!   torn down before their parent and give their block back on drop
//!
//! Allocation goes through `&self` so typed boxes and containers can share
//! one arena.

// SAFETY: Arenas hand out raw blocks and rebuild typed views over them.
// Every block comes from the arena's own strategy and is released exactly
// once by its owner.
#![allow(unsafe_code)]

mod boxed;
mod tag;

pub use boxed::{ArenaArray, ArenaBox};
pub use tag::{ArenaStats, MemoryTag};

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::allocator::{AllocationStrategy, Allocator, AllocatorKind};
use crate::area::SubAreaClaim;
use crate::boundary::Boundary;
use crate::bounds::{BoundsChecking, DefaultBoundsChecking};
use crate::error::{MemoryError, MemoryResult};
use crate::report::report;

/// Alignment of the block a child arena is carved from.
const CHILD_ALIGNMENT: usize = 64;

/// Untyped allocation interface shared by typed boxes and containers.
pub trait RawArena {
    /// Allocates `size` bytes aligned to `alignment`, tagged with
    /// `description`.
    ///
    /// # Errors
    ///
    /// Reports and returns any allocation failure.
    #[track_caller]
    fn allocate_raw(
        &self,
        size: usize,
        alignment: usize,
        description: &'static str,
    ) -> MemoryResult<NonNull<u8>>;

    /// Gives a block back.
    ///
    /// # Errors
    ///
    /// Reports foreign pointers, double frees and damaged guards.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate_raw` on the same arena and must not be
    /// used afterwards.
    #[track_caller]
    unsafe fn free_raw(&self, ptr: NonNull<u8>) -> MemoryResult<()>;
}

enum Backing<'m> {
    /// Caller-managed memory.
    Unowned(PhantomData<&'m mut [u8]>),
    /// A claimed sub-area, released when the claim drops.
    SubArea {
        _claim: SubAreaClaim<'m>,
    },
    /// A block of a parent arena, freed on drop.
    Child {
        parent: &'m dyn RawArena,
        block: NonNull<u8>,
    },
}

/// One allocator strategy plus tracking.
///
/// # Thread Safety
///
/// Arenas are `!Sync`. Use one arena per thread.
///
/// # Example
///
/// ```rust,ignore
/// let level = area.add_sub_area(64 * 1024, "Level")?;
/// let arena: Arena = area.create_arena(level, AllocatorKind::Linear)?;
///
/// let enemies = arena.alloc_array_default::<Enemy>(128)?;
/// let raw = arena.allocate_tagged(256, 16, "nav mesh")?;
/// ```
pub struct Arena<'m, B: BoundsChecking = DefaultBoundsChecking> {
    name: String,
    allocator: RefCell<Allocator<B>>,
    tracking: bool,
    tags: RefCell<HashMap<usize, MemoryTag>>,
    bytes_requested: Cell<usize>,
    peak_bytes: Cell<usize>,
    lifetime_allocations: Cell<usize>,
    backing: Backing<'m>,
}

impl<'m, B: BoundsChecking> Arena<'m, B> {
    /// Builds an arena over caller-managed memory.
    ///
    /// # Errors
    ///
    /// Fails when `kind` describes an invalid pool.
    ///
    /// # Safety
    ///
    /// `boundary` must be valid for reads and writes for `'m`, and nothing
    /// else may use it while the arena lives.
    #[track_caller]
    pub unsafe fn from_boundary(
        name: impl Into<String>,
        boundary: Boundary,
        kind: AllocatorKind,
    ) -> MemoryResult<Self> {
        let allocator = unsafe { Allocator::new(kind, boundary)? };
        Ok(Self::assemble(name.into(), allocator, Backing::Unowned(PhantomData)))
    }

    /// Builds an arena over a claimed sub-area.
    ///
    /// # Safety
    ///
    /// `boundary` must be the claimed sub-area's boundary.
    #[track_caller]
    pub(crate) unsafe fn over_sub_area(
        name: String,
        boundary: Boundary,
        kind: AllocatorKind,
        claim: SubAreaClaim<'m>,
    ) -> MemoryResult<Self> {
        let allocator = unsafe { Allocator::new(kind, boundary)? };
        Ok(Self::assemble(name, allocator, Backing::SubArea { _claim: claim }))
    }

    fn assemble(name: String, allocator: Allocator<B>, backing: Backing<'m>) -> Self {
        tracing::debug!(
            "arena '{}': {} over {} bytes",
            name,
            allocator.kind(),
            allocator.boundary().size()
        );
        Self {
            name,
            allocator: RefCell::new(allocator),
            tracking: cfg!(debug_assertions),
            tags: RefCell::new(HashMap::new()),
            bytes_requested: Cell::new(0),
            peak_bytes: Cell::new(0),
            lifetime_allocations: Cell::new(0),
            backing,
        }
    }

    /// Turns call-site tagging on or off. Only legal before the first
    /// allocation.
    #[must_use]
    pub fn with_tracking(mut self, enabled: bool) -> Self {
        debug_assert_eq!(self.allocation_count(), 0);
        self.tracking = enabled;
        self
    }

    /// Carves a child arena of `size` bytes out of this arena.
    ///
    /// The parent stays mutably borrowed until the child drops, at which
    /// point the block goes back to the parent.
    ///
    /// # Errors
    ///
    /// Fails when the parent has no room or `kind` is invalid.
    #[track_caller]
    pub fn emplace_child(
        &mut self,
        name: impl Into<String>,
        size: usize,
        kind: AllocatorKind,
    ) -> MemoryResult<Arena<'_, B>> {
        let name = name.into();
        let block = self.allocate_tagged(size, CHILD_ALIGNMENT, "child arena")?;
        let boundary = Boundary::new(block.as_ptr(), size);

        // SAFETY: the block is `size` bytes handed out by this arena and
        // nothing else sees it until it is freed.
        match unsafe { Allocator::new(kind, boundary) } {
            Ok(allocator) => {
                let parent: &Self = self;
                Ok(Arena::assemble(name, allocator, Backing::Child { parent, block }))
            }
            Err(error) => {
                // SAFETY: the block was allocated above and never shared.
                let _ = unsafe { self.free(block) };
                Err(error)
            }
        }
    }

    /// Arena name, for diagnostics.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The strategy this arena uses.
    #[must_use]
    pub fn kind(&self) -> AllocatorKind {
        self.allocator.borrow().kind()
    }

    /// The memory this arena manages.
    #[must_use]
    pub fn boundary(&self) -> Boundary {
        self.allocator.borrow().boundary()
    }

    /// Whether call-site tags are recorded.
    #[inline]
    #[must_use]
    pub const fn is_tracking(&self) -> bool {
        self.tracking
    }

    /// Allocates `size` raw bytes aligned to `alignment`.
    ///
    /// # Errors
    ///
    /// Reports and returns exhaustion and malformed requests.
    #[track_caller]
    pub fn allocate(&self, size: usize, alignment: usize) -> MemoryResult<NonNull<u8>> {
        self.allocate_tagged(size, alignment, "")
    }

    /// Like [`Self::allocate`], with a description stored in the tag.
    ///
    /// # Errors
    ///
    /// Reports and returns exhaustion and malformed requests.
    #[track_caller]
    pub fn allocate_tagged(
        &self,
        size: usize,
        alignment: usize,
        description: &'static str,
    ) -> MemoryResult<NonNull<u8>> {
        let ptr = self.allocator.borrow_mut().allocate(size, alignment)?;

        if self.tracking {
            let tag = MemoryTag::capture(ptr.as_ptr() as usize, size, alignment, description);
            self.tags.borrow_mut().insert(tag.address, tag);
        }

        self.bytes_requested.set(self.bytes_requested.get() + size);
        self.lifetime_allocations.set(self.lifetime_allocations.get() + 1);
        let total = self.total_bytes_allocated();
        if total > self.peak_bytes.get() {
            self.peak_bytes.set(total);
        }

        Ok(ptr)
    }

    /// Returns an allocation to the strategy.
    ///
    /// With tracking on, the tag is checked first: an owned pointer without
    /// a tag is a double free, anything else is foreign.
    ///
    /// # Errors
    ///
    /// Reports double frees, foreign pointers, order violations and
    /// damaged guards. Nothing is released on error.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this arena and must not be used afterwards.
    #[track_caller]
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        let address = ptr.as_ptr() as usize;

        let size = if self.tracking {
            let Some(tag) = self.tags.borrow_mut().remove(&address) else {
                let error = if self.owns(ptr) {
                    MemoryError::DoubleFree { address }
                } else {
                    MemoryError::ForeignPointer { address }
                };
                return Err(report(error));
            };
            if let Err(error) = unsafe { self.allocator.borrow_mut().free(ptr) } {
                self.tags.borrow_mut().insert(address, tag);
                return Err(error);
            }
            tag.size
        } else {
            let mut allocator = self.allocator.borrow_mut();
            let size = unsafe { allocator.allocation_size(ptr)? };
            unsafe { allocator.free(ptr)? };
            size
        };

        self.bytes_requested
            .set(self.bytes_requested.get().saturating_sub(size));
        Ok(())
    }

    /// The payload size originally requested for `ptr`.
    ///
    /// # Errors
    ///
    /// Reports pointers that are not live allocations of this arena.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this arena.
    #[track_caller]
    pub unsafe fn allocation_size(&self, ptr: NonNull<u8>) -> MemoryResult<usize> {
        unsafe { self.allocator.borrow().allocation_size(ptr) }
    }

    /// Checks the guards of a live allocation.
    ///
    /// # Errors
    ///
    /// Reports damaged guards as corruption.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this arena.
    #[track_caller]
    pub unsafe fn verify(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        unsafe { self.allocator.borrow().verify(ptr) }
    }

    /// Whether `ptr` lies inside this arena's boundary.
    #[must_use]
    pub fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.allocator.borrow().owns(ptr)
    }

    /// Drops every allocation at once.
    ///
    /// Taking `&mut self` guarantees no box, array or container still
    /// borrows the arena.
    pub fn reset(&mut self) {
        self.allocator.get_mut().reset();
        self.tags.get_mut().clear();
        self.bytes_requested.set(0);
        self.peak_bytes.set(0);
    }

    /// Bytes in use according to the strategy, overhead included.
    #[must_use]
    pub fn total_bytes_allocated(&self) -> usize {
        self.allocator.borrow().total_bytes_allocated()
    }

    /// Allocations not yet freed.
    #[must_use]
    pub fn allocation_count(&self) -> usize {
        self.allocator.borrow().allocation_count()
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> ArenaStats {
        let allocator = self.allocator.borrow();
        ArenaStats {
            total_bytes_allocated: allocator.total_bytes_allocated(),
            bytes_requested: self.bytes_requested.get(),
            live_allocations: allocator.allocation_count(),
            peak_bytes: self.peak_bytes.get(),
            lifetime_allocations: self.lifetime_allocations.get(),
            capacity: allocator.boundary().size(),
        }
    }

    /// Tags of all live tracked allocations, by address.
    #[must_use]
    pub fn live_tags(&self) -> Vec<MemoryTag> {
        let mut tags: Vec<MemoryTag> = self.tags.borrow().values().copied().collect();
        tags.sort_unstable_by_key(|tag| tag.address);
        tags
    }

    /// Tag of one live allocation.
    #[must_use]
    pub fn tag_of(&self, ptr: NonNull<u8>) -> Option<MemoryTag> {
        self.tags.borrow().get(&(ptr.as_ptr() as usize)).copied()
    }

    fn report_leaks(&self) {
        let allocator = self.allocator.borrow();
        let live = allocator.allocation_count();
        if live == 0 || !allocator.kind().reclaims_on_free() {
            return;
        }

        tracing::warn!(
            "arena '{}' dropped with {} live allocations ({} bytes)",
            self.name,
            live,
            self.bytes_requested.get()
        );
        for tag in self.live_tags() {
            tracing::warn!("  leaked {}", tag);
        }
    }
}

impl<B: BoundsChecking> RawArena for Arena<'_, B> {
    fn allocate_raw(
        &self,
        size: usize,
        alignment: usize,
        description: &'static str,
    ) -> MemoryResult<NonNull<u8>> {
        self.allocate_tagged(size, alignment, description)
    }

    unsafe fn free_raw(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        unsafe { self.free(ptr) }
    }
}

impl<B: BoundsChecking> Drop for Arena<'_, B> {
    fn drop(&mut self) {
        self.report_leaks();

        if let Backing::Child { parent, block } = &self.backing {
            // SAFETY: the block came from `parent` in `emplace_child` and is
            // freed exactly once, here.
            let _ = unsafe { parent.free_raw(*block) };
        }
        tracing::debug!("arena '{}' dropped", self.name);
    }
}

impl<B: BoundsChecking> std::fmt::Debug for Arena<'_, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
