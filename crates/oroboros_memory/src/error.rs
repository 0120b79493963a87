//! # Memory Error Types
//!
//! Every failure the memory core can report.

use thiserror::Error;

use crate::area::AreaState;

/// Which guard of an allocation was found damaged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuardSide {
    /// Guard bytes in front of the payload (underrun).
    Front,
    /// Guard bytes behind the payload (overrun).
    Back,
}

impl std::fmt::Display for GuardSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Front => f.write_str("front"),
            Self::Back => f.write_str("back"),
        }
    }
}

/// Errors that can occur in the memory core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// Not enough room left in a boundary, area or pool.
    #[error("capacity exhausted: requested {requested} bytes, {available} available")]
    CapacityExhausted {
        /// Bytes asked for.
        requested: usize,
        /// Bytes that were still free.
        available: usize,
    },

    /// The registry has no free memory-area slot left.
    #[error("memory area registry full: capacity {capacity}")]
    RegistryFull {
        /// Number of slots reserved at init.
        capacity: usize,
    },

    /// A handle that does not name a live area or sub-area.
    #[error("invalid handle: {index:#x}")]
    InvalidHandle {
        /// Raw handle value.
        index: u32,
    },

    /// The pointer does not belong to the allocator it was handed to.
    #[error("pointer {address:#x} is not owned by this allocator")]
    ForeignPointer {
        /// Offending address.
        address: usize,
    },

    /// The pointer was already returned.
    #[error("double free of {address:#x}")]
    DoubleFree {
        /// Offending address.
        address: usize,
    },

    /// A stack allocator was asked to free something other than its top block.
    #[error("stack order violation: freed {address:#x}, top block is {expected:#x}")]
    StackOrderViolation {
        /// Address that was freed.
        address: usize,
        /// Address of the block that has to go first.
        expected: usize,
    },

    /// Guard bytes around an allocation were overwritten.
    #[error("heap corruption: {side} guard of {address:#x} damaged")]
    Corruption {
        /// Payload address of the damaged allocation.
        address: usize,
        /// Which guard failed.
        side: GuardSide,
    },

    /// The strategy cannot serve this kind of request.
    #[error("unsupported request ({size} bytes, align {alignment}): {reason}")]
    UnsupportedRequest {
        /// Requested size.
        size: usize,
        /// Requested alignment.
        alignment: usize,
        /// Why it was refused.
        reason: &'static str,
    },

    /// Alignment was zero or not a power of two.
    #[error("invalid alignment {alignment}: must be a non-zero power of two")]
    InvalidAlignment {
        /// Offending alignment.
        alignment: usize,
    },

    /// A size computation overflowed `usize`.
    #[error("size overflow: {count} x {element_size} bytes")]
    SizeOverflow {
        /// Element count.
        count: usize,
        /// Size of one element.
        element_size: usize,
    },

    /// An operation was issued in the wrong lifecycle state.
    #[error("memory area '{area}': cannot {operation} while {state:?}")]
    Lifecycle {
        /// Area name.
        area: String,
        /// What was attempted.
        operation: &'static str,
        /// State the area was in.
        state: AreaState,
    },

    /// A sub-area already backs a live arena.
    #[error("sub-area '{name}' already backs a live arena")]
    SubAreaClaimed {
        /// Sub-area name.
        name: String,
    },

    /// The system allocator refused the bulk allocation.
    #[error("system allocation of {size} bytes failed")]
    SystemAllocationFailed {
        /// Bytes requested from the system.
        size: usize,
    },
}

/// Result type for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;
