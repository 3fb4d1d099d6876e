extern crate std;

use std::prelude::rust_2021::*;

use quickcheck::{Arbitrary, Gen, QuickCheck};

use crate::{AllocInitError, Allocation, OffsetAllocator};

/// Managed range used by the property tests. Kept representable (a power of
/// two) so the whole range can be reclaimed with a single allocation.
const TOTAL: u32 = 1 << 18;

/// Descriptor budget for the property tests; generous enough that the
/// descriptor pool never gates an operation sequence.
const MAX_ALLOCS: u32 = 1024;

/// Limit on generated allocation size, expressed in bits.
const SIZE_LIMIT_BITS: u32 = 14;

enum AllocatorOpTag {
    Allocate,
    Free,
}

#[derive(Clone, Debug)]
enum AllocatorOp {
    /// Allocate a range of `size` units.
    Allocate { size: u32 },
    /// Free an existing allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at index
    /// `index % n`.
    Free { index: usize },
}

impl Arbitrary for AllocatorOp {
    fn arbitrary(g: &mut Gen) -> Self {
        match g
            .choose(&[AllocatorOpTag::Allocate, AllocatorOpTag::Free])
            .unwrap()
        {
            AllocatorOpTag::Allocate => AllocatorOp::Allocate {
                size: {
                    // Distribute sizes evenly across the size classes.
                    let exp = u32::arbitrary(g) % (SIZE_LIMIT_BITS + 1);
                    1 + u32::arbitrary(g) % (1 << exp)
                },
            },
            AllocatorOpTag::Free => AllocatorOp::Free {
                index: usize::arbitrary(g),
            },
        }
    }
}

/// Replays `ops`, returning the outstanding allocations. Checks the internal
/// invariants and the external accounting after every step.
fn replay(alloc: &mut OffsetAllocator<u32>, ops: Vec<AllocatorOp>) -> Option<Vec<(Allocation, u32)>> {
    let mut live: Vec<(Allocation, u32)> = Vec::new();

    for op in ops {
        match op {
            AllocatorOp::Allocate { size } => {
                if let Ok(a) = alloc.allocate(size) {
                    if u64::from(a.offset) + u64::from(size) > u64::from(TOTAL) {
                        return None;
                    }
                    if alloc.allocation_size(a) != size {
                        return None;
                    }
                    live.push((a, size));
                }
            }

            AllocatorOp::Free { index } => {
                if live.is_empty() {
                    continue;
                }
                let (a, _) = live.swap_remove(index % live.len());
                alloc.free(a);
            }
        }

        alloc.check_invariants();

        // Outstanding allocations are pairwise disjoint.
        let mut spans: Vec<(u32, u32)> = live.iter().map(|&(a, size)| (a.offset, size)).collect();
        spans.sort_unstable();
        if spans.windows(2).any(|w| w[0].0 + w[0].1 > w[1].0) {
            return None;
        }

        // Every unit is either claimed or reported free.
        let claimed: u32 = live.iter().map(|&(_, size)| size).sum();
        if alloc.storage_report().total_free_space != TOTAL - claimed {
            return None;
        }
    }

    Some(live)
}

#[test]
fn allocations_are_disjoint_and_accounted() {
    fn prop(ops: Vec<AllocatorOp>) -> bool {
        let mut alloc = OffsetAllocator::<u32>::new(MAX_ALLOCS);
        alloc.reset(TOTAL);
        replay(&mut alloc, ops).is_some()
    }

    let mut qc = QuickCheck::new();
    qc.quickcheck(prop as fn(_) -> bool);
}

#[test]
fn freeing_everything_coalesces_to_one_region() {
    fn prop(ops: Vec<AllocatorOp>) -> bool {
        let mut alloc = OffsetAllocator::<u32>::new(MAX_ALLOCS);
        alloc.reset(TOTAL);

        let Some(live) = replay(&mut alloc, ops) else {
            return false;
        };

        for (a, _) in live {
            alloc.free(a);
        }
        alloc.check_invariants();

        if alloc.storage_report().total_free_space != TOTAL {
            return false;
        }

        // The merged region must satisfy a whole-range allocation again.
        alloc.allocate(TOTAL).map(|a| a.offset) == Ok(0)
    }

    let mut qc = QuickCheck::new();
    qc.quickcheck(prop as fn(_) -> bool);
}

#[test]
fn whole_range_allocation_consumes_everything() {
    let mut alloc = OffsetAllocator::<u32>::new(8);
    alloc.reset(1 << 20);

    let a = alloc.allocate(1 << 20).unwrap();
    assert_eq!(a.offset, 0);
    assert_eq!(alloc.storage_report().total_free_space, 0);
    assert_eq!(alloc.storage_report().largest_free_region, 0);

    alloc.allocate(1).unwrap_err();
}

#[test]
fn tiny_allocation_leaves_usable_remainder() {
    let mut alloc = OffsetAllocator::<u32>::new(16);
    alloc.reset(1024);

    let a = alloc.allocate(1).unwrap();
    assert_eq!(a.offset, 0);
    assert_eq!(alloc.allocation_size(a), 1);
    assert_eq!(alloc.storage_report().total_free_space, 1023);

    // The remainder was refiled under the 960-unit class, the largest whose
    // advertised size does not exceed 1023; anything up to that fits.
    let b = alloc.allocate(960).unwrap();
    assert_eq!(b.offset, 1);
    assert_eq!(alloc.storage_report().total_free_space, 63);
}

#[test]
fn freeing_in_any_order_coalesces_to_one_region() {
    let mut alloc = OffsetAllocator::<u32>::new(16);
    alloc.reset(384);

    let a = alloc.allocate(128).unwrap();
    let b = alloc.allocate(128).unwrap();
    let c = alloc.allocate(128).unwrap();
    assert_eq!((a.offset, b.offset, c.offset), (0, 128, 256));
    assert_eq!(alloc.storage_report().total_free_space, 0);

    // Outer regions first, so the final free merges in both directions.
    alloc.free(a);
    alloc.free(c);
    alloc.free(b);

    assert_eq!(alloc.storage_report().total_free_space, 384);
    let regions = alloc.storage_report_full().free_regions;
    assert_eq!(regions.iter().map(|r| r.count).sum::<u32>(), 1);

    let whole = alloc.allocate(384).unwrap();
    assert_eq!(whole.offset, 0);
}

#[test]
fn denormal_sizes_fit_exactly() {
    // Sizes below 8 are represented exactly, so an exact-size region always
    // satisfies an exact-size request.
    let mut alloc = OffsetAllocator::<u32>::new(8);
    alloc.reset(7);

    let a = alloc.allocate(7).unwrap();
    assert_eq!(a.offset, 0);
    assert_eq!(alloc.storage_report().total_free_space, 0);
    alloc.free(a);

    let b = alloc.allocate(3).unwrap();
    let c = alloc.allocate(4).unwrap();
    assert_eq!((b.offset, c.offset), (0, 3));

    alloc.free(b);
    alloc.free(c);
    assert_eq!(alloc.storage_report().total_free_space, 7);
    assert_eq!(alloc.allocate(7).unwrap().offset, 0);
}

#[test]
fn descriptor_pool_bounds_live_allocations() {
    let mut alloc = OffsetAllocator::<u32>::new(3);
    alloc.reset(1024);

    // Each one-unit allocation splits off a remainder, consuming one
    // descriptor; the pool limits concurrent live regions to max_allocs.
    let mut succeeded = 0;
    while alloc.allocate(1).is_ok() {
        succeeded += 1;
        assert!(succeeded <= 3, "descriptor pool failed to bound allocations");
    }
    assert_eq!(succeeded, 3);
}

#[test]
fn fresh_reset_reports_single_free_region() {
    let mut alloc = OffsetAllocator::<u32>::new(64);
    alloc.reset(1000);

    let report = alloc.storage_report_full();
    let occupied: Vec<_> = report
        .free_regions
        .iter()
        .filter(|r| r.count != 0)
        .collect();

    assert_eq!(occupied.len(), 1);
    assert_eq!(occupied[0].count, 1);
    assert!(occupied[0].size <= 1000);
}

#[test]
fn reset_to_same_size_is_a_noop() {
    let mut alloc = OffsetAllocator::<u32>::new(16);
    alloc.reset(1024);

    let a = alloc.allocate(10).unwrap();
    alloc.reset(1024);

    // The allocation survived, and the space it claims is still claimed.
    assert_eq!(alloc.allocation_size(a), 10);
    assert_eq!(alloc.storage_report().total_free_space, 1014);

    // A different size rebuilds from scratch.
    alloc.reset(2048);
    assert_eq!(alloc.storage_report().total_free_space, 2048);
    assert_eq!(alloc.allocate(2048).unwrap().offset, 0);
}

#[test]
fn descriptor_indices_are_deterministic_after_reset() {
    let mut alloc = OffsetAllocator::<u32>::new(16);

    for _ in 0..2 {
        alloc.reset(1024);
        let a = alloc.allocate(4).unwrap();
        let b = alloc.allocate(4).unwrap();
        let c = alloc.allocate(4).unwrap();
        assert_eq!((a.metadata, b.metadata, c.metadata), (0, 1, 2));
        assert_eq!((a.offset, b.offset, c.offset), (0, 4, 8));
        // Force the rebuild; reset to the same size would be a no-op.
        alloc.reset(2048);
    }
}

#[test]
fn allocate_before_reset_fails() {
    let mut alloc = OffsetAllocator::<u32>::new(16);
    alloc.allocate(1).unwrap_err();
}

#[test]
fn oversized_request_fails() {
    let mut alloc = OffsetAllocator::<u32>::new(16);
    alloc.reset(1024);
    alloc.allocate(1025).unwrap_err();
    alloc.allocate(u32::MAX).unwrap_err();
}

#[test]
fn free_before_reset_is_ignored() {
    let mut alloc = OffsetAllocator::<u32>::new(8);
    alloc.free_by_index(0);

    alloc.reset(64);
    assert_eq!(alloc.storage_report().total_free_space, 64);
}

#[test]
fn report_is_zero_with_one_descriptor_left() {
    let mut alloc = OffsetAllocator::<u32>::new(2);
    alloc.reset(1024);

    alloc.allocate(1).unwrap();

    // One descriptor slot remains; the summary reports zeros even though
    // free space exists. The gate is on descriptor availability, not on
    // free storage.
    assert_eq!(alloc.storage_report(), crate::StorageReport::default());
}

#[test]
fn largest_free_region_is_quantized_underestimate() {
    let mut alloc = OffsetAllocator::<u32>::new(16);
    alloc.reset(1000);

    let report = alloc.storage_report();
    assert_eq!(report.total_free_space, 1000);
    // 960 is the decoded size of the bin holding the 1000-unit region.
    assert_eq!(report.largest_free_region, 960);
    assert!(report.largest_free_region <= report.total_free_space);
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "double free")]
fn double_free_asserts_in_debug_builds() {
    let mut alloc = OffsetAllocator::<u32>::new(8);
    alloc.reset(64);

    let a = alloc.allocate(8).unwrap();
    alloc.free(a);
    alloc.free(a);
}

#[test]
fn sixteen_bit_indices_behave_identically() {
    let mut narrow = OffsetAllocator::<u16>::new(64);
    let mut wide = OffsetAllocator::<u32>::new(64);

    for alloc_sizes in [[5u32, 900, 64], [128, 1, 31]] {
        narrow.reset(4096);
        wide.reset(4096);

        let mut pairs = Vec::new();
        for size in alloc_sizes {
            let n = narrow.allocate(size).unwrap();
            let w = wide.allocate(size).unwrap();
            assert_eq!(n, w);
            pairs.push(n);
        }

        for a in pairs {
            narrow.free(a);
            wide.free(a);
            assert_eq!(narrow.storage_report(), wide.storage_report());
        }

        // Force the next reset to rebuild.
        narrow.reset(1);
        wide.reset(1);
    }
}

#[test]
fn max_allocs_is_bounded_by_index_width() {
    assert_eq!(
        OffsetAllocator::<u16>::try_new(65536).unwrap_err(),
        AllocInitError::InvalidConfig
    );
    OffsetAllocator::<u16>::try_new(65535).unwrap();
    OffsetAllocator::<u32>::try_new(1 << 20).unwrap();
}

#[test]
#[should_panic]
fn new_panics_when_max_allocs_exceeds_index_width() {
    let _ = OffsetAllocator::<u16>::new(1 << 16);
}
