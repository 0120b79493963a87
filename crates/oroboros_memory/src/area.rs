//! # Memory Areas
//!
//! A memory area performs ONE bulk allocation at init and carves it into
//! named, non-overlapping sub-areas by bumping an offset.
//!
//! ```text
//! | Scratch | Physics | Level         | ...remaining...       |
//! ^ block start                        ^ offset               ^ block end
//! ```
//!
//! Sub-areas are never resized or freed on their own. The whole block goes
//! back to the system on `shutdown` (or drop).

// SAFETY: The area owns one raw block from the global allocator and hands
// out views into it. The block is released exactly once.
#![allow(unsafe_code)]

use std::alloc::{self, Layout};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::ptr::NonNull;

use crate::allocator::AllocatorKind;
use crate::arena::Arena;
use crate::boundary::Boundary;
use crate::bounds::BoundsChecking;
use crate::error::{MemoryError, MemoryResult};
use crate::handle::SubAreaHandle;
use crate::report::report;

/// Alignment of every bulk block (one cache line).
pub const AREA_ALIGNMENT: usize = 64;

/// Name given to the automatically carved scratch sub-area.
pub const SCRATCH_SUB_AREA: &str = "Scratch";

/// Lifecycle of a [`MemoryArea`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AreaState {
    /// Registered, no memory yet.
    Uninitialized,
    /// Block allocated, sub-areas can be carved.
    Initialized,
    /// Block released. Terminal.
    ShutDown,
}

/// The bulk allocation behind an area.
struct RawBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl RawBlock {
    #[track_caller]
    fn allocate(size: usize) -> MemoryResult<Self> {
        let layout = Layout::from_size_align(size, AREA_ALIGNMENT)
            .map_err(|_| report(MemoryError::SystemAllocationFailed { size }))?;
        // SAFETY: `size` is non-zero, checked by the caller.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| report(MemoryError::SystemAllocationFailed { size }))?;
        Ok(Self { ptr, layout })
    }

    fn boundary(&self) -> Boundary {
        Boundary::new(self.ptr.as_ptr(), self.layout.size())
    }
}

impl Drop for RawBlock {
    fn drop(&mut self) {
        // SAFETY: allocated in `RawBlock::allocate` with the same layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// A named region carved out of a memory area.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemorySubArea {
    boundary: Boundary,
    name: String,
}

impl MemorySubArea {
    /// The carved region.
    #[inline]
    #[must_use]
    pub const fn boundary(&self) -> Boundary {
        self.boundary
    }

    /// Sub-area name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size in bytes.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.boundary.size()
    }
}

struct SubAreaEntry {
    sub_area: MemorySubArea,
    claimed: bool,
}

/// One bulk allocation, carved into sub-areas.
///
/// # Invariants
///
/// - Sub-areas never overlap and lie inside the block.
/// - Sum of sub-area sizes plus [`MemoryArea::remaining`] equals the block
///   size.
/// - A sub-area backs at most one live arena.
///
/// # Thread Safety
///
/// Areas are `!Sync`. Carving goes through `&self` so arenas over earlier
/// sub-areas can stay alive while new ones are added.
pub struct MemoryArea {
    name: String,
    state: Cell<AreaState>,
    block: RefCell<Option<RawBlock>>,
    offset: Cell<usize>,
    sub_areas: RefCell<Vec<SubAreaEntry>>,
    scratch: Cell<SubAreaHandle>,
}

impl MemoryArea {
    /// Creates an uninitialized area.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Cell::new(AreaState::Uninitialized),
            block: RefCell::new(None),
            offset: Cell::new(0),
            sub_areas: RefCell::new(Vec::new()),
            scratch: Cell::new(SubAreaHandle::INVALID),
        }
    }

    /// Area name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> AreaState {
        self.state.get()
    }

    /// Checks if the block is allocated.
    #[inline]
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state.get() == AreaState::Initialized
    }

    /// Allocates `size + scratch_size` bytes in one go.
    ///
    /// A `"Scratch"` sub-area of `scratch_size` bytes is carved first when
    /// `scratch_size > 0`. Calling `init` again on an initialized area does
    /// nothing.
    ///
    /// # Errors
    ///
    /// Reports an empty or overflowing request, a failed system allocation
    /// and any `init` after shutdown.
    #[track_caller]
    pub fn init(&self, size: usize, scratch_size: usize) -> MemoryResult<()> {
        match self.state.get() {
            AreaState::Initialized => {
                tracing::debug!("memory area '{}' already initialized", self.name);
                return Ok(());
            }
            AreaState::ShutDown => return Err(self.lifecycle_error("init")),
            AreaState::Uninitialized => {}
        }

        let total = match size.checked_add(scratch_size) {
            Some(0) => {
                return Err(report(MemoryError::UnsupportedRequest {
                    size: 0,
                    alignment: AREA_ALIGNMENT,
                    reason: "memory area of zero bytes",
                }))
            }
            Some(total) => total,
            None => {
                return Err(report(MemoryError::UnsupportedRequest {
                    size,
                    alignment: AREA_ALIGNMENT,
                    reason: "area size overflows usize",
                }))
            }
        };

        let block = RawBlock::allocate(total)?;
        *self.block.borrow_mut() = Some(block);
        self.state.set(AreaState::Initialized);

        tracing::info!(
            "memory area '{}' initialized: {} bytes ({} scratch)",
            self.name,
            total,
            scratch_size
        );

        if scratch_size > 0 {
            let scratch = self.add_sub_area(scratch_size, SCRATCH_SUB_AREA)?;
            self.scratch.set(scratch);
        }
        Ok(())
    }

    /// Carves the next `size` bytes into a sub-area named `name`.
    ///
    /// Either the whole request fits or nothing changes.
    ///
    /// # Errors
    ///
    /// Reports calls outside the initialized state, empty requests and
    /// requests larger than the remaining space.
    #[track_caller]
    pub fn add_sub_area(&self, size: usize, name: &str) -> MemoryResult<SubAreaHandle> {
        if !self.is_initialized() {
            return Err(self.lifecycle_error("add a sub-area"));
        }
        if size == 0 {
            return Err(report(MemoryError::UnsupportedRequest {
                size,
                alignment: 1,
                reason: "sub-area of zero bytes",
            }));
        }

        let remaining = self.remaining();
        if size > remaining {
            return Err(report(MemoryError::CapacityExhausted {
                requested: size,
                available: remaining,
            }));
        }

        let offset = self.offset.get();
        let boundary = self
            .boundary()
            .sub_boundary(offset, size)
            .ok_or_else(|| report(MemoryError::CapacityExhausted {
                requested: size,
                available: remaining,
            }))?;

        let mut sub_areas = self.sub_areas.borrow_mut();
        let handle = SubAreaHandle::from_index(sub_areas.len());
        if !handle.is_valid() {
            return Err(report(MemoryError::RegistryFull {
                capacity: sub_areas.len(),
            }));
        }
        sub_areas.push(SubAreaEntry {
            sub_area: MemorySubArea {
                boundary,
                name: name.to_owned(),
            },
            claimed: false,
        });
        self.offset.set(offset + size);

        tracing::debug!(
            "memory area '{}': sub-area '{}' at +{} ({} bytes, {} left)",
            self.name,
            name,
            offset,
            size,
            remaining - size
        );
        Ok(handle)
    }

    /// Copy of a sub-area's description.
    #[must_use]
    pub fn sub_area(&self, handle: SubAreaHandle) -> Option<MemorySubArea> {
        self.sub_areas
            .borrow()
            .get(handle.index())
            .map(|entry| entry.sub_area.clone())
    }

    /// Boundary of a sub-area.
    ///
    /// # Errors
    ///
    /// Reports handles that do not name a sub-area of this area.
    #[track_caller]
    pub fn sub_area_boundary(&self, handle: SubAreaHandle) -> MemoryResult<Boundary> {
        self.sub_area(handle)
            .map(|sub_area| sub_area.boundary)
            .ok_or_else(|| report(MemoryError::InvalidHandle { index: handle.raw() }))
    }

    /// First sub-area named `name`.
    #[must_use]
    pub fn sub_area_by_name(&self, name: &str) -> Option<SubAreaHandle> {
        self.sub_areas
            .borrow()
            .iter()
            .position(|entry| entry.sub_area.name == name)
            .map(SubAreaHandle::from_index)
    }

    /// The automatically carved scratch sub-area, if any.
    #[must_use]
    pub fn scratch_sub_area(&self) -> Option<SubAreaHandle> {
        Some(self.scratch.get()).filter(|handle| handle.is_valid())
    }

    /// Number of sub-areas carved so far.
    #[must_use]
    pub fn sub_area_count(&self) -> usize {
        self.sub_areas.borrow().len()
    }

    /// The whole block, empty before init and after shutdown.
    #[must_use]
    pub fn boundary(&self) -> Boundary {
        self.block
            .borrow()
            .as_ref()
            .map_or(Boundary::EMPTY, RawBlock::boundary)
    }

    /// Block size in bytes.
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.boundary().size()
    }

    /// Bytes carved into sub-areas.
    #[must_use]
    pub fn used(&self) -> usize {
        self.offset.get()
    }

    /// Bytes still available for sub-areas.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.total_size() - self.offset.get()
    }

    /// Builds an arena over a sub-area.
    ///
    /// The sub-area stays claimed until the arena drops, and the area
    /// cannot shut down before that.
    ///
    /// # Errors
    ///
    /// Reports an uninitialized area, unknown handles, sub-areas that
    /// already back an arena and invalid allocator parameters.
    #[track_caller]
    pub fn create_arena<B: BoundsChecking>(
        &self,
        handle: SubAreaHandle,
        kind: AllocatorKind,
    ) -> MemoryResult<Arena<'_, B>> {
        if !self.is_initialized() {
            return Err(self.lifecycle_error("create an arena"));
        }

        let (boundary, name) = {
            let mut sub_areas = self.sub_areas.borrow_mut();
            let Some(entry) = sub_areas.get_mut(handle.index()) else {
                return Err(report(MemoryError::InvalidHandle { index: handle.raw() }));
            };
            if entry.claimed {
                return Err(report(MemoryError::SubAreaClaimed {
                    name: entry.sub_area.name.clone(),
                }));
            }
            entry.claimed = true;
            (entry.sub_area.boundary, entry.sub_area.name.clone())
        };

        let claim = SubAreaClaim {
            area: self,
            index: handle.index(),
        };
        // SAFETY: the boundary lies in this area's block, which cannot be
        // released while `claim` borrows the area, and the claim keeps
        // every other arena off the sub-area.
        unsafe { Arena::over_sub_area(name, boundary, kind, claim) }
    }

    /// Checks if a sub-area currently backs an arena.
    #[must_use]
    pub fn is_claimed(&self, handle: SubAreaHandle) -> bool {
        self.sub_areas
            .borrow()
            .get(handle.index())
            .is_some_and(|entry| entry.claimed)
    }

    /// Releases the block and forgets every sub-area.
    ///
    /// # Errors
    ///
    /// Reports a second shutdown.
    #[track_caller]
    pub fn shutdown(&mut self) -> MemoryResult<()> {
        match self.state.get() {
            AreaState::ShutDown => Err(self.lifecycle_error("shut down")),
            AreaState::Uninitialized => {
                self.state.set(AreaState::ShutDown);
                Ok(())
            }
            AreaState::Initialized => {
                self.release();
                Ok(())
            }
        }
    }

    fn release(&mut self) {
        let total = self.total_size();
        let carved = self.sub_areas.get_mut().len();
        self.sub_areas.get_mut().clear();
        *self.block.get_mut() = None;
        self.offset.set(0);
        self.scratch.set(SubAreaHandle::INVALID);
        self.state.set(AreaState::ShutDown);

        tracing::info!(
            "memory area '{}' shut down: released {} bytes, {} sub-areas",
            self.name,
            total,
            carved
        );
    }

    fn release_claim(&self, index: usize) {
        if let Some(entry) = self.sub_areas.borrow_mut().get_mut(index) {
            entry.claimed = false;
        }
    }

    #[track_caller]
    fn lifecycle_error(&self, operation: &'static str) -> MemoryError {
        report(MemoryError::Lifecycle {
            area: self.name.clone(),
            operation,
            state: self.state.get(),
        })
    }
}

impl Drop for MemoryArea {
    fn drop(&mut self) {
        if self.is_initialized() {
            self.release();
        }
    }
}

impl fmt::Debug for MemoryArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryArea")
            .field("name", &self.name)
            .field("state", &self.state.get())
            .field("size", &self.total_size())
            .field("used", &self.used())
            .field("sub_areas", &self.sub_area_count())
            .finish()
    }
}

/// Marks a sub-area as backing an arena until dropped.
pub(crate) struct SubAreaClaim<'a> {
    area: &'a MemoryArea,
    index: usize,
}

impl Drop for SubAreaClaim<'_> {
    fn drop(&mut self) {
        self.area.release_claim(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::NoBoundsChecking;
    use crate::report;

    #[test]
    fn test_init_is_idempotent() {
        let area = MemoryArea::new("Game");
        area.init(4096, 0).unwrap();
        let first = area.boundary();
        area.init(8192, 0).unwrap();

        assert_eq!(area.boundary(), first);
        assert_eq!(area.total_size(), 4096);
        assert_eq!(first.start_address() % AREA_ALIGNMENT, 0);
    }

    #[test]
    fn test_scratch_is_carved_first() {
        let area = MemoryArea::new("Game");
        area.init(1024, 256).unwrap();

        let scratch = area.scratch_sub_area().unwrap();
        assert_eq!(area.sub_area_by_name(SCRATCH_SUB_AREA), Some(scratch));
        let boundary = area.sub_area_boundary(scratch).unwrap();
        assert_eq!(boundary.location(), area.boundary().location());
        assert_eq!(boundary.size(), 256);
        assert_eq!(area.remaining(), 1024);
    }

    #[test]
    fn test_sub_areas_tile_the_block() {
        let area = MemoryArea::new("Game");
        area.init(1000, 0).unwrap();

        let handles: Vec<_> = [100, 250, 50, 600]
            .iter()
            .enumerate()
            .map(|(i, size)| area.add_sub_area(*size, &format!("part{i}")).unwrap())
            .collect();

        let mut expected_start = area.boundary().start_address();
        for handle in &handles {
            let boundary = area.sub_area_boundary(*handle).unwrap();
            assert_eq!(boundary.start_address(), expected_start);
            expected_start = boundary.end_address();
        }
        assert_eq!(expected_start, area.boundary().end_address());
        assert_eq!(area.remaining(), 0);
    }

    #[test]
    fn test_rejected_sub_area_changes_nothing() {
        let capture = report::capture();
        let area = MemoryArea::new("Game");
        area.init(512, 0).unwrap();
        area.add_sub_area(500, "big").unwrap();

        assert!(matches!(
            area.add_sub_area(13, "too big"),
            Err(MemoryError::CapacityExhausted {
                requested: 13,
                available: 12
            })
        ));
        assert_eq!(area.sub_area_count(), 1);
        assert_eq!(area.remaining(), 12);
        assert_eq!(capture.count(), 1);
    }

    #[test]
    fn test_lifecycle_misuse() {
        let capture = report::capture();
        let mut area = MemoryArea::new("Game");
        assert!(area.add_sub_area(16, "early").is_err());

        area.init(256, 0).unwrap();
        area.shutdown().unwrap();
        assert_eq!(area.state(), AreaState::ShutDown);
        assert_eq!(area.total_size(), 0);

        assert!(area.init(256, 0).is_err());
        assert!(area.shutdown().is_err());
        assert!(matches!(
            capture.last_error(),
            Some(MemoryError::Lifecycle {
                state: AreaState::ShutDown,
                ..
            })
        ));
        assert_eq!(capture.count(), 3);
    }

    #[test]
    fn test_sub_area_backs_one_arena() {
        let capture = report::capture();
        let area = MemoryArea::new("Game");
        area.init(2048, 0).unwrap();
        let level = area.add_sub_area(1024, "Level").unwrap();

        {
            let arena = area
                .create_arena::<NoBoundsChecking>(level, AllocatorKind::Linear)
                .unwrap();
            assert_eq!(arena.name(), "Level");
            assert!(area.is_claimed(level));
            assert!(area
                .create_arena::<NoBoundsChecking>(level, AllocatorKind::Stack)
                .is_err());
        }

        assert!(!area.is_claimed(level));
        let again = area
            .create_arena::<NoBoundsChecking>(level, AllocatorKind::Stack)
            .unwrap();
        assert_eq!(again.boundary(), area.sub_area_boundary(level).unwrap());
        assert_eq!(capture.count(), 1);
    }

    #[test]
    fn test_invalid_handle_is_reported() {
        let capture = report::capture();
        let area = MemoryArea::new("Game");
        area.init(64, 0).unwrap();

        assert!(area.sub_area_boundary(SubAreaHandle::INVALID).is_err());
        assert!(area.sub_area(SubAreaHandle::new(3)).is_none());
        assert!(area
            .create_arena::<NoBoundsChecking>(SubAreaHandle::INVALID, AllocatorKind::Linear)
            .is_err());
        assert_eq!(capture.count(), 2);
    }

    #[test]
    fn test_arena_over_sub_area_allocates_inside_it() {
        let area = MemoryArea::new("Game");
        area.init(4096, 0).unwrap();
        let _pad = area.add_sub_area(1024, "Pad").unwrap();
        let pool = area.add_sub_area(1024, "Pool").unwrap();

        let arena = area
            .create_arena::<NoBoundsChecking>(pool, AllocatorKind::pool_for::<[u64; 4]>())
            .unwrap();
        let boundary = area.sub_area_boundary(pool).unwrap();
        for _ in 0..8 {
            let ptr = arena.allocate(32, 8).unwrap();
            assert!(boundary.contains_range(ptr.as_ptr(), 32));
        }
        assert!(arena.total_bytes_allocated() >= 8 * 32);
    }
}
