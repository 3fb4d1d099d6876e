#![doc = include_str!("../README.md")]
#![no_std]
#![forbid(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]

extern crate alloc;

mod allocator;
mod bins;
mod small_float;

#[cfg(test)]
mod tests;

use core::fmt;

pub use crate::allocator::OffsetAllocator;

/// Number of top-level bins in the occupancy mask.
pub const NUM_TOP_BINS: usize = 32;

/// Number of leaf bins per top-level bin.
pub const BINS_PER_LEAF: usize = 8;

/// Total number of size classes.
pub const NUM_LEAF_BINS: usize = NUM_TOP_BINS * BINS_PER_LEAF;

/// The error type for allocator constructors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocInitError {
    /// The configuration of the allocator is invalid.
    ///
    /// This variant is returned when `max_allocs` cannot be represented by
    /// the chosen node index width.
    InvalidConfig,
}

/// Indicates an allocation failure due to exhaustion of free space or of
/// region descriptors.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AllocError;

/// A claimed sub-range of the allocator's address space.
///
/// Returned by [`OffsetAllocator::allocate`] and passed back to
/// [`OffsetAllocator::free`]. `metadata` identifies the internal region
/// descriptor; treat it as opaque.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    /// First unit of the claimed range.
    pub offset: u32,
    /// Index of the region descriptor backing this allocation.
    pub metadata: u32,
}

impl Allocation {
    /// Out-of-band marker distinct from any legal descriptor index.
    ///
    /// Never produced by a successful [`OffsetAllocator::allocate`]; freeing
    /// an allocation carrying it is ignored (debug builds assert).
    pub const NO_SPACE: u32 = 0xffff_ffff;
}

/// Summary of the allocator's free space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StorageReport {
    /// Sum of the sizes of all free regions.
    pub total_free_space: u32,
    /// Decoded size of the highest non-empty bin.
    ///
    /// This is quantized to the bin resolution and therefore a slight
    /// underestimate of the true largest free region.
    pub largest_free_region: u32,
}

/// Per-bin occupancy of the free lists.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BinReport {
    /// Decoded size of this bin.
    pub size: u32,
    /// Number of free regions currently filed under this bin.
    pub count: u32,
}

/// Exhaustive listing of free regions, bucketed by size class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StorageReportFull {
    /// One entry per size class, in bin order.
    pub free_regions: [BinReport; NUM_LEAF_BINS],
}

/// Integer types usable as node indices.
///
/// The index width is a space/capacity trade-off: `u16` halves the metadata
/// footprint but caps `max_allocs` at 65535, while `u32` supports the full
/// address range. The full-width maximum of the type is reserved as the
/// "no link" sentinel.
pub trait NodeIndex: Copy + Eq + fmt::Debug + private::Sealed {
    /// The "no link" sentinel: the widest value of the index type.
    const UNUSED: Self;

    /// Largest `max_allocs` value supported by this index width.
    const MAX_ALLOCS_LIMIT: u32;

    /// Converts a raw `u32` index. Must not be called with values above
    /// [`MAX_ALLOCS_LIMIT`](Self::MAX_ALLOCS_LIMIT).
    fn from_u32(raw: u32) -> Self;

    /// Widens the index back to `u32`.
    fn to_u32(self) -> u32;
}

impl NodeIndex for u16 {
    const UNUSED: Self = u16::MAX;
    const MAX_ALLOCS_LIMIT: u32 = u16::MAX as u32;

    #[inline]
    fn from_u32(raw: u32) -> Self {
        raw as u16
    }

    #[inline]
    fn to_u32(self) -> u32 {
        u32::from(self)
    }
}

impl NodeIndex for u32 {
    const UNUSED: Self = u32::MAX;
    // Keeps the sentinel and the max_allocs + 1 slot count representable.
    const MAX_ALLOCS_LIMIT: u32 = u32::MAX - 1;

    #[inline]
    fn from_u32(raw: u32) -> Self {
        raw
    }

    #[inline]
    fn to_u32(self) -> u32 {
        self
    }
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}

    impl Sealed for u16 {}
    impl Sealed for u32 {}
}
