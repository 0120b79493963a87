//! # Handles
//!
//! Opaque indices into the registry and into a memory area's sub-area
//! list. `INVALID` never names a live entry.

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(transparent)]
        pub struct $name(u32);

        impl $name {
            /// Sentinel that never names a live entry.
            pub const INVALID: Self = Self(u32::MAX);

            /// Wraps a raw index.
            #[inline]
            #[must_use]
            pub const fn new(index: u32) -> Self {
                Self(index)
            }

            /// The raw index.
            #[inline]
            #[must_use]
            pub const fn raw(self) -> u32 {
                self.0
            }

            /// The index as a `usize`, for slice lookups.
            #[inline]
            #[must_use]
            pub const fn index(self) -> usize {
                self.0 as usize
            }

            /// Checks if this handle is not the sentinel.
            #[inline]
            #[must_use]
            pub const fn is_valid(self) -> bool {
                self.0 != u32::MAX
            }

            pub(crate) fn from_index(index: usize) -> Self {
                u32::try_from(index)
                    .ok()
                    .filter(|raw| *raw != u32::MAX)
                    .map_or(Self::INVALID, Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::INVALID
            }
        }
    };
}

define_handle!(
    /// Names a memory area inside a [`crate::GlobalMemory`].
    MemoryAreaHandle
);

define_handle!(
    /// Names a sub-area inside one [`crate::MemoryArea`].
    SubAreaHandle
);
