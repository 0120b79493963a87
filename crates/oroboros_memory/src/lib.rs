//! # OROBOROS Memory
//!
//! Hierarchical, arena-based memory management for the engine:
//! - One bulk OS allocation per memory area, carved into named sub-areas
//! - Four allocator strategies: linear, stack, pool, free-list
//! - Arenas with bounds checking and call-site tagging
//! - Fixed-capacity containers that live inside arenas
//!
//! ## Architecture Rules
//!
//! 1. **Pre-size everything** - Areas are allocated once at startup
//! 2. **Fail loudly** - Every failure goes through [`report::report`]
//! 3. **Borrow, don't own** - Arenas borrow their area, children borrow their parent
//!
//! ## Example
//!
//! ```rust,ignore
//! use oroboros_memory::{AllocatorKind, DefaultBoundsChecking, GlobalMemory};
//!
//! let memory = GlobalMemory::init(1, 1 << 20, 1 << 19, 1 << 16)?;
//! let game = memory.add_memory_area("Game")?;
//! let area = memory.memory_area(game).expect("just registered");
//! area.init(1 << 20, 0)?;
//!
//! let level = area.add_sub_area(512 * 1024, "Level")?;
//! let arena = area.create_arena::<DefaultBoundsChecking>(level, AllocatorKind::Linear)?;
//! let tiles = arena.alloc_array_zeroed::<u32>(4096)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod allocator;
pub mod area;
pub mod arena;
pub mod boundary;
pub mod bounds;
pub mod config;
pub mod containers;
pub mod error;
pub mod global;
pub mod handle;
pub mod report;

pub use allocator::{
    AllocationStrategy, Allocator, AllocatorKind, FitPolicy, FreeListAllocator, LinearAllocator,
    PoolAllocator, StackAllocator,
};
pub use area::{AreaState, MemoryArea, MemorySubArea};
pub use arena::{Arena, ArenaArray, ArenaBox, ArenaStats, MemoryTag, RawArena};
pub use boundary::{get_max_memory_for_allocation, pointer_add, pointer_offset, Boundary};
pub use bounds::{BasicBoundsChecking, BoundsChecking, DefaultBoundsChecking, NoBoundsChecking};
pub use config::{ConfigError, ConfigResult, MemoryConfig};
pub use containers::{FixedHashMap, FixedQueue, FixedVec};
pub use error::{GuardSide, MemoryError, MemoryResult};
pub use global::GlobalMemory;
pub use handle::{MemoryAreaHandle, SubAreaHandle};
pub use report::{FailureCapture, FailurePolicy};
