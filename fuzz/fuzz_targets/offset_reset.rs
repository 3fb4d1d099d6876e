#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use offset_alloc::{Allocation, OffsetAllocator};

const MAX_ALLOCS: u32 = 256;
const MAX_SIZE: u32 = 1 << 20;

#[derive(Clone, Debug, Arbitrary)]
enum AllocatorOp {
    Allocate { size: u32 },
    Free { index: usize },
    Reset { size: u32 },
}

fuzz_target!(|ops: Vec<AllocatorOp>| {
    let mut alloc = OffsetAllocator::<u32>::new(MAX_ALLOCS);
    let mut total = 0u32;
    let mut outstanding: Vec<Allocation> = Vec::new();

    for op in ops {
        match op {
            AllocatorOp::Allocate { size } => {
                if total == 0 {
                    // A zero-capacity allocator can satisfy nothing.
                    alloc.allocate(size.max(1)).unwrap_err();
                    continue;
                }
                let size = size % total + 1;
                if let Ok(a) = alloc.allocate(size) {
                    assert!(u64::from(a.offset) + u64::from(size) <= u64::from(total));
                    outstanding.push(a);
                }
            }

            AllocatorOp::Free { index } => {
                if outstanding.is_empty() {
                    continue;
                }
                let a = outstanding.swap_remove(index % outstanding.len());
                alloc.free(a);
            }

            AllocatorOp::Reset { size } => {
                let size = size % MAX_SIZE;
                let effective = size != total;
                alloc.reset(size);
                if effective {
                    // Prior allocations are forgotten wholesale.
                    outstanding.clear();
                    total = size;

                    // A repeated reset is a no-op: the state after one reset
                    // and after two is indistinguishable.
                    let before = alloc.storage_report();
                    alloc.reset(size);
                    assert_eq!(alloc.storage_report(), before);
                }
            }
        }
    }
});
