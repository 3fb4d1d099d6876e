#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use offset_alloc::{Allocation, OffsetAllocator};

const MAX_ALLOCS: u32 = 512;
const MAX_SIZE: u32 = 1 << 24;

#[derive(Clone, Debug, Arbitrary)]
enum AllocatorOp {
    Allocate { size: u32 },
    Free { index: usize },
}

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    total: u32,
    ops: Vec<AllocatorOp>,
}

fuzz_target!(|args: Args| {
    let total = args.total % MAX_SIZE + 1;

    let mut alloc = OffsetAllocator::<u32>::new(MAX_ALLOCS);
    alloc.reset(total);

    let mut outstanding: Vec<(Allocation, u32)> = Vec::new();

    for op in args.ops {
        match op {
            AllocatorOp::Allocate { size } => {
                let size = size % total + 1;
                if let Ok(a) = alloc.allocate(size) {
                    assert!(u64::from(a.offset) + u64::from(size) <= u64::from(total));
                    assert_eq!(alloc.allocation_size(a), size);
                    outstanding.push((a, size));
                }
            }

            AllocatorOp::Free { index } => {
                if outstanding.is_empty() {
                    continue;
                }
                let (a, _) = outstanding.swap_remove(index % outstanding.len());
                alloc.free(a);
            }
        }

        // Outstanding allocations never overlap.
        let mut spans: Vec<(u32, u32)> = outstanding
            .iter()
            .map(|&(a, size)| (a.offset, size))
            .collect();
        spans.sort_unstable();
        for pair in spans.windows(2) {
            assert!(pair[0].0 + pair[0].1 <= pair[1].0, "overlapping allocations");
        }
    }

    // Releasing everything coalesces the range back into one region.
    for (a, _) in outstanding.drain(..) {
        alloc.free(a);
    }
    let report = alloc.storage_report();
    assert_eq!(report.total_free_space, total);
    assert!(report.largest_free_region <= report.total_free_space);
});
