//! Call-site tags recorded for every tracked allocation.

use std::fmt;
use std::panic::Location;

/// Where and why an allocation was made.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryTag {
    /// Payload address.
    pub address: usize,
    /// Requested payload size.
    pub size: usize,
    /// Requested alignment.
    pub alignment: usize,
    /// Source file of the allocating call.
    pub file: &'static str,
    /// Line of the allocating call.
    pub line: u32,
    /// Free-form description, the type name for typed allocations.
    pub description: &'static str,
}

impl MemoryTag {
    /// Records the caller's location.
    #[track_caller]
    pub(crate) fn capture(
        address: usize,
        size: usize,
        alignment: usize,
        description: &'static str,
    ) -> Self {
        let location = Location::caller();
        Self {
            address,
            size,
            alignment,
            file: location.file(),
            line: location.line(),
            description,
        }
    }
}

impl fmt::Display for MemoryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#x} ({} bytes, align {}) from {}:{}",
            self.address, self.size, self.alignment, self.file, self.line
        )?;
        if !self.description.is_empty() {
            write!(f, " [{}]", self.description)?;
        }
        Ok(())
    }
}

/// Snapshot of an arena's bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Bytes the strategy considers in use, overhead included.
    pub total_bytes_allocated: usize,
    /// Payload bytes requested by live allocations.
    pub bytes_requested: usize,
    /// Allocations not yet freed.
    pub live_allocations: usize,
    /// Highest `total_bytes_allocated` seen since creation or reset.
    pub peak_bytes: usize,
    /// Allocations made since creation.
    pub lifetime_allocations: usize,
    /// Size of the backing boundary.
    pub capacity: usize,
}

impl ArenaStats {
    /// Fraction of the capacity in use, `0.0` for an empty boundary.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.total_bytes_allocated as f64 / self.capacity as f64
        }
    }
}
