//! # Boundaries & Alignment
//!
//! A [`Boundary`] is the currency every layer of the memory core trades in:
//! a non-owning `(pointer, size)` view over contiguous bytes.
//!
//! The free functions below are pure address arithmetic. They never touch
//! memory and never fail.
//!
//! ## Allocation Layout
//!
//! ```text
//! | padding | header | front guard | payload (size) | back guard |
//! ^ cursor                         ^ aligned
//! ```
//!
//! [`get_max_memory_for_allocation`] returns the worst case of the whole
//! picture, which is what the engine uses to pre-size sub-areas.

use std::fmt;
use std::ptr::NonNull;

/// A non-owning view over `size` contiguous bytes.
///
/// Invariant: `size == 0` if and only if there is no location.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Boundary {
    location: Option<NonNull<u8>>,
    size: usize,
}

impl Boundary {
    /// The empty boundary: no location, zero bytes.
    pub const EMPTY: Self = Self {
        location: None,
        size: 0,
    };

    /// Creates a view over `[location, location + size)`.
    ///
    /// A null location or a zero size both yield [`Boundary::EMPTY`].
    #[must_use]
    pub fn new(location: *mut u8, size: usize) -> Self {
        match NonNull::new(location) {
            Some(location) if size > 0 => Self {
                location: Some(location),
                size,
            },
            _ => Self::EMPTY,
        }
    }

    /// Start of the region, if any.
    #[inline]
    #[must_use]
    pub const fn location(&self) -> Option<NonNull<u8>> {
        self.location
    }

    /// Start of the region as a raw pointer (null when empty).
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.location.map_or(std::ptr::null_mut(), NonNull::as_ptr)
    }

    /// Size in bytes.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Whether the boundary covers no bytes.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Address of the first byte (0 when empty).
    #[inline]
    #[must_use]
    pub fn start_address(&self) -> usize {
        self.as_ptr() as usize
    }

    /// Address one past the last byte (0 when empty).
    #[inline]
    #[must_use]
    pub fn end_address(&self) -> usize {
        self.start_address() + self.size
    }

    /// Whether `ptr` points inside the region.
    #[inline]
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let address = ptr as usize;
        !self.is_empty() && address >= self.start_address() && address < self.end_address()
    }

    /// Whether `[ptr, ptr + len)` lies entirely inside the region.
    #[must_use]
    pub fn contains_range(&self, ptr: *const u8, len: usize) -> bool {
        let address = ptr as usize;
        match address.checked_add(len) {
            Some(end) => {
                !self.is_empty() && address >= self.start_address() && end <= self.end_address()
            }
            None => false,
        }
    }

    /// Whether the two regions share at least one byte.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.start_address() < other.end_address()
            && other.start_address() < self.end_address()
    }

    /// A view over `[offset, offset + size)` of this region, if it fits.
    #[must_use]
    pub fn sub_boundary(&self, offset: usize, size: usize) -> Option<Self> {
        let end = offset.checked_add(size)?;
        if self.is_empty() || size == 0 || end > self.size {
            return None;
        }
        Some(Self::new(pointer_add(self.as_ptr(), offset), size))
    }
}

impl Default for Boundary {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for Boundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Boundary")
            .field("location", &self.as_ptr())
            .field("size", &self.size)
            .finish()
    }
}

/// Advances `base` by `offset` bytes. No bounds validation.
#[inline]
#[must_use]
pub fn pointer_add(base: *mut u8, offset: usize) -> *mut u8 {
    base.wrapping_add(offset)
}

/// Signed byte distance from `from` to `to`.
#[inline]
#[must_use]
pub fn pointer_offset(from: *const u8, to: *const u8) -> isize {
    (to as isize).wrapping_sub(from as isize)
}

/// Whether `value` is a non-zero power of two.
#[inline]
#[must_use]
pub const fn is_power_of_two(value: usize) -> bool {
    value != 0 && value & (value - 1) == 0
}

/// Rounds `address` up to the next multiple of `alignment` (power of two).
#[inline]
#[must_use]
pub const fn align_forward(address: usize, alignment: usize) -> usize {
    (address + alignment - 1) & !(alignment - 1)
}

/// Bytes to add to `address` to make it a multiple of `alignment`.
#[inline]
#[must_use]
pub const fn align_forward_adjustment(address: usize, alignment: usize) -> usize {
    align_forward(address, alignment) - address
}

/// Bytes to add to `address` so that `header_size` bytes fit before an
/// address that is a multiple of `alignment`.
///
/// The result is always `>= header_size`.
#[inline]
#[must_use]
pub const fn align_forward_adjustment_with_header(
    address: usize,
    alignment: usize,
    header_size: usize,
) -> usize {
    align_forward(address + header_size, alignment) - address
}

/// Worst-case bytes needed for `size` payload bytes once aligned to
/// `alignment` and fitted with `header_size` header bytes and
/// `bounds_checking` guard bytes.
///
/// A zero-sized request still reserves one payload byte. Pure and
/// saturating: the result is never smaller than `size`.
#[inline]
#[must_use]
pub const fn get_max_memory_for_allocation(
    size: usize,
    alignment: usize,
    header_size: usize,
    bounds_checking: usize,
) -> usize {
    let padding = if alignment > 1 { alignment - 1 } else { 0 };
    let payload = if size == 0 { 1 } else { size };
    payload
        .saturating_add(header_size)
        .saturating_add(bounds_checking)
        .saturating_add(padding)
}
