//! # Bounds Checking
//!
//! Guard bytes written around every payload and verified on free.
//!
//! ```text
//! | FRONT_GUARD | payload | BACK_GUARD |
//! ```
//!
//! The policy is a type parameter of every allocator, so the checked and
//! unchecked variants share one call-site API and the unchecked variant
//! costs nothing.

// SAFETY: This module writes and reads guard bytes through raw pointers.
// Callers guarantee the guard ranges lie inside the allocator's boundary.
#![allow(unsafe_code)]

use std::ptr;

/// Guard-byte policy applied around each allocation.
pub trait BoundsChecking: 'static {
    /// Bytes reserved in front of the payload.
    const SIZE_FRONT: usize;
    /// Bytes reserved behind the payload.
    const SIZE_BACK: usize;
    /// Total guard overhead per allocation.
    const SIZE_TOTAL: usize = Self::SIZE_FRONT + Self::SIZE_BACK;

    /// Writes the front guard at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for `SIZE_FRONT` byte writes.
    unsafe fn guard_front(ptr: *mut u8);

    /// Writes the back guard at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for `SIZE_BACK` byte writes.
    unsafe fn guard_back(ptr: *mut u8);

    /// Whether the front guard at `ptr` is intact.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for `SIZE_FRONT` byte reads.
    unsafe fn check_front(ptr: *const u8) -> bool;

    /// Whether the back guard at `ptr` is intact.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for `SIZE_BACK` byte reads.
    unsafe fn check_back(ptr: *const u8) -> bool;
}

/// No guards, no overhead.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NoBoundsChecking;

impl BoundsChecking for NoBoundsChecking {
    const SIZE_FRONT: usize = 0;
    const SIZE_BACK: usize = 0;

    #[inline]
    unsafe fn guard_front(_ptr: *mut u8) {}

    #[inline]
    unsafe fn guard_back(_ptr: *mut u8) {}

    #[inline]
    unsafe fn check_front(_ptr: *const u8) -> bool {
        true
    }

    #[inline]
    unsafe fn check_back(_ptr: *const u8) -> bool {
        true
    }
}

/// Pattern written in front of each payload.
pub const FRONT_GUARD: [u8; 4] = [0xDE, 0xAD, 0xBE, 0xEF];
/// Pattern written behind each payload.
pub const BACK_GUARD: [u8; 4] = [0xFE, 0xED, 0xFA, 0xCE];

/// Four-byte front and back guards with fixed patterns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BasicBoundsChecking;

impl BoundsChecking for BasicBoundsChecking {
    const SIZE_FRONT: usize = FRONT_GUARD.len();
    const SIZE_BACK: usize = BACK_GUARD.len();

    #[inline]
    unsafe fn guard_front(ptr: *mut u8) {
        unsafe { ptr::copy_nonoverlapping(FRONT_GUARD.as_ptr(), ptr, FRONT_GUARD.len()) };
    }

    #[inline]
    unsafe fn guard_back(ptr: *mut u8) {
        unsafe { ptr::copy_nonoverlapping(BACK_GUARD.as_ptr(), ptr, BACK_GUARD.len()) };
    }

    #[inline]
    unsafe fn check_front(ptr: *const u8) -> bool {
        unsafe { ptr::read_unaligned(ptr.cast::<[u8; 4]>()) == FRONT_GUARD }
    }

    #[inline]
    unsafe fn check_back(ptr: *const u8) -> bool {
        unsafe { ptr::read_unaligned(ptr.cast::<[u8; 4]>()) == BACK_GUARD }
    }
}

/// Guards are on in debug builds and compiled out in release.
#[cfg(debug_assertions)]
pub type DefaultBoundsChecking = BasicBoundsChecking;

/// Guards are on in debug builds and compiled out in release.
#[cfg(not(debug_assertions))]
pub type DefaultBoundsChecking = NoBoundsChecking;
