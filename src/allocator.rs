//! The binned offset allocator.
//!
//! All bookkeeping lives in a fixed pool of region descriptors ("nodes")
//! cross-linked by integer indices; no pointers, no per-allocation heap
//! traffic. Each node sits in up to two doubly-linked lists at once:
//!
//! - its size class's free list (only while free), headed in `bin_heads`,
//!   with occupancy accelerated by the two-level [`BinMask`];
//! - the neighbor list, which threads *every* live region, free and used,
//!   in strictly increasing offset order. Freeing a region consults its two
//!   fixed neighbors and merges with whichever of them is free, so no two
//!   adjacent free regions ever persist.
//!
//! Descriptor slots are recycled through an index stack. The stack is
//! rebuilt in reverse on every effective [`reset`](OffsetAllocator::reset)
//! so that slot 0 pops first; returned `metadata` values are therefore
//! deterministic for a fixed operation sequence.

use alloc::boxed::Box;
use alloc::vec;

use crate::bins::BinMask;
use crate::{
    small_float, AllocError, AllocInitError, Allocation, BinReport, NodeIndex, StorageReport,
    StorageReportFull, NUM_LEAF_BINS,
};

/// Descriptor for one contiguous region, free or used.
#[derive(Clone, Copy, Debug)]
struct Node<I: NodeIndex> {
    offset: u32,
    size: u32,
    bin_prev: I,
    bin_next: I,
    neighbor_prev: I,
    neighbor_next: I,
    used: bool,
}

impl<I: NodeIndex> Node<I> {
    const EMPTY: Node<I> = Node {
        offset: 0,
        size: 0,
        bin_prev: I::UNUSED,
        bin_next: I::UNUSED,
        neighbor_prev: I::UNUSED,
        neighbor_next: I::UNUSED,
        used: false,
    };
}

/// Sub-allocates integer ranges out of `[0, size)` without owning storage.
///
/// Construct with [`new`](Self::new) or [`try_new`](Self::try_new), then
/// call [`reset`](Self::reset) to set the managed range. The allocator is a
/// single-owner structure: it is `Send` but deliberately offers no interior
/// mutability, and it does not implement `Clone`.
pub struct OffsetAllocator<I: NodeIndex = u32> {
    size: u32,
    max_allocs: u32,
    free_storage: u32,
    used_bins: BinMask,
    bin_heads: [I; NUM_LEAF_BINS],
    nodes: Box<[Node<I>]>,
    free_nodes: Box<[I]>,
    /// Top of the free-slot stack; `Allocation::NO_SPACE` when every
    /// descriptor is in use.
    free_offset: u32,
}

impl<I: NodeIndex> OffsetAllocator<I> {
    /// Default number of concurrent allocations supported.
    pub const DEFAULT_MAX_ALLOCS: u32 = 65535;

    /// Constructs an allocator able to track up to `max_allocs` concurrent
    /// allocations.
    ///
    /// The allocator starts with zero capacity; nothing can be allocated
    /// until [`reset`](Self::reset) is called with a nonzero size.
    ///
    /// # Panics
    ///
    /// Panics if `max_allocs` exceeds the range of the node index type `I`.
    pub fn new(max_allocs: u32) -> OffsetAllocator<I> {
        Self::try_new(max_allocs).expect("max_allocs exceeds the node index range")
    }

    /// Fallible variant of [`new`](Self::new).
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if `max_allocs` exceeds the
    /// range of the node index type `I`.
    pub fn try_new(max_allocs: u32) -> Result<OffsetAllocator<I>, AllocInitError> {
        if max_allocs > I::MAX_ALLOCS_LIMIT {
            return Err(AllocInitError::InvalidConfig);
        }

        Ok(OffsetAllocator {
            size: 0,
            max_allocs,
            free_storage: 0,
            used_bins: BinMask::default(),
            bin_heads: [I::UNUSED; NUM_LEAF_BINS],
            nodes: Box::default(),
            free_nodes: Box::default(),
            free_offset: 0,
        })
    }

    /// Reinitializes the allocator to manage `[0, new_size)`.
    ///
    /// Every outstanding allocation is forgotten and the whole range becomes
    /// a single free region. Calling with the current size is a no-op, so
    /// back-to-back resets are idempotent.
    pub fn reset(&mut self, new_size: u32) {
        if self.size == new_size {
            return;
        }

        self.size = new_size;
        self.free_storage = 0;
        self.used_bins.clear_all();
        self.bin_heads = [I::UNUSED; NUM_LEAF_BINS];
        self.free_offset = self.max_allocs;

        let slots = self.max_allocs as usize + 1;
        self.nodes = vec![Node::EMPTY; slots].into_boxed_slice();

        // The stack pops from the top, so load slots in reverse for index 0
        // to come out first.
        let mut free_nodes = vec![I::UNUSED; slots].into_boxed_slice();
        for (i, slot) in free_nodes.iter_mut().enumerate() {
            *slot = I::from_u32(self.max_allocs - i as u32);
        }
        self.free_nodes = free_nodes;

        // Start state: the whole range as one free node. Allocation splits
        // remainders off it and files them back as smaller nodes.
        self.insert_into_bin(new_size, 0);
    }

    /// Claims a sub-range of `size` units.
    ///
    /// The search rounds the request up to the smallest adequate size class
    /// and takes the head of the first non-empty free list at or above it;
    /// any excess is split off and refiled, so the returned region is
    /// exactly `size` units.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] when no free region fits or when all region
    /// descriptors are in use. The descriptor check happens up front: an
    /// exhausted pool fails the request even if an exact fit would not have
    /// needed a spare descriptor.
    pub fn allocate(&mut self, size: u32) -> Result<Allocation, AllocError> {
        if self.free_offset == Allocation::NO_SPACE {
            return Err(AllocError);
        }

        let min_bin = small_float::round_up(size);
        let bin = self.used_bins.lowest_fit(min_bin).ok_or(AllocError)?;

        // Pop the head node of the chosen bin.
        let node_index = self.bin_heads[bin as usize];
        debug_assert!(node_index != I::UNUSED);
        let idx = node_index.to_u32() as usize;
        let node_total = self.nodes[idx].size;
        let bin_next = self.nodes[idx].bin_next;
        self.nodes[idx].size = size;
        self.nodes[idx].used = true;
        self.bin_heads[bin as usize] = bin_next;
        if bin_next != I::UNUSED {
            self.nodes[bin_next.to_u32() as usize].bin_prev = I::UNUSED;
        } else {
            self.used_bins.unmark(bin);
        }
        self.free_storage -= node_total;
        log::trace!(
            "allocate: {size} from bin {bin} (node {idx}), free storage {} (-{node_total})",
            self.free_storage
        );

        // Split the excess into a fresh node directly after this one in
        // neighbor order.
        let remainder = node_total - size;
        if remainder > 0 {
            let offset = self.nodes[idx].offset + size;
            let new_index = self.insert_into_bin(remainder, offset);
            let new_idx = new_index.to_u32() as usize;

            let old_next = self.nodes[idx].neighbor_next;
            if old_next != I::UNUSED {
                self.nodes[old_next.to_u32() as usize].neighbor_prev = new_index;
            }
            self.nodes[new_idx].neighbor_prev = node_index;
            self.nodes[new_idx].neighbor_next = old_next;
            self.nodes[idx].neighbor_next = new_index;
        }

        Ok(Allocation {
            offset: self.nodes[idx].offset,
            metadata: node_index.to_u32(),
        })
    }

    /// Releases an allocation, merging it with any free neighbor.
    pub fn free(&mut self, allocation: Allocation) {
        self.free_by_index(allocation.metadata);
    }

    /// Releases an allocation by its `metadata` descriptor index.
    ///
    /// Invalid indices ([`Allocation::NO_SPACE`], out of range, or on an
    /// allocator that was never reset) are ignored; debug builds assert.
    /// Freeing a region that is already free is likewise a debug-build
    /// assertion and a release-mode no-op.
    pub fn free_by_index(&mut self, metadata: u32) {
        debug_assert!(metadata != Allocation::NO_SPACE, "free of an invalid allocation");
        let Some(node) = self.nodes.get(metadata as usize) else {
            return;
        };
        debug_assert!(node.used, "double free of node {metadata}");
        if !node.used {
            return;
        }

        let idx = metadata as usize;
        let mut offset = self.nodes[idx].offset;
        let mut size = self.nodes[idx].size;

        // Absorb a free lower neighbor: the merged region starts where the
        // neighbor started.
        let prev = self.nodes[idx].neighbor_prev;
        if prev != I::UNUSED && !self.nodes[prev.to_u32() as usize].used {
            let p = prev.to_u32() as usize;
            debug_assert_eq!(self.nodes[p].neighbor_next.to_u32(), metadata);
            offset = self.nodes[p].offset;
            size += self.nodes[p].size;

            self.remove_from_bin(prev);
            self.nodes[idx].neighbor_prev = self.nodes[p].neighbor_prev;
        }

        // Absorb a free upper neighbor: the offset stays, the sizes sum.
        let next = self.nodes[idx].neighbor_next;
        if next != I::UNUSED && !self.nodes[next.to_u32() as usize].used {
            let n = next.to_u32() as usize;
            debug_assert_eq!(self.nodes[n].neighbor_prev.to_u32(), metadata);
            size += self.nodes[n].size;

            self.remove_from_bin(next);
            self.nodes[idx].neighbor_next = self.nodes[n].neighbor_next;
        }

        let neighbor_prev = self.nodes[idx].neighbor_prev;
        let neighbor_next = self.nodes[idx].neighbor_next;

        // Return this descriptor before taking one for the merged region;
        // with a single free slot left, that slot is this very node.
        self.free_offset = self.free_offset.wrapping_add(1);
        self.free_nodes[self.free_offset as usize] = I::from_u32(metadata);
        log::trace!("free: node {metadata} merged into [{offset}, {})", offset + size);

        let merged = self.insert_into_bin(size, offset);
        let m = merged.to_u32() as usize;

        if neighbor_next != I::UNUSED {
            self.nodes[m].neighbor_next = neighbor_next;
            self.nodes[neighbor_next.to_u32() as usize].neighbor_prev = merged;
        }
        if neighbor_prev != I::UNUSED {
            self.nodes[m].neighbor_prev = neighbor_prev;
            self.nodes[neighbor_prev.to_u32() as usize].neighbor_next = merged;
        }
    }

    /// Size of the given allocation, or 0 if it is not valid.
    pub fn allocation_size(&self, allocation: Allocation) -> u32 {
        self.nodes
            .get(allocation.metadata as usize)
            .map_or(0, |node| node.size)
    }

    /// Summarizes free space.
    ///
    /// `largest_free_region` is the decoded size of the highest non-empty
    /// bin, an underestimate at the bin resolution. When only one descriptor
    /// slot remains the report is all zeros.
    pub fn storage_report(&self) -> StorageReport {
        if self.free_offset == 0 {
            return StorageReport::default();
        }

        let largest_free_region = match self.used_bins.highest() {
            Some(bin) => {
                let largest = small_float::to_uint(bin);
                debug_assert!(self.free_storage >= largest);
                largest
            }
            None => 0,
        };

        StorageReport {
            total_free_space: self.free_storage,
            largest_free_region,
        }
    }

    /// Counts the free regions filed under every size class.
    pub fn storage_report_full(&self) -> StorageReportFull {
        let mut free_regions = [BinReport::default(); NUM_LEAF_BINS];

        for (bin, region) in free_regions.iter_mut().enumerate() {
            let mut count = 0;
            let mut node = self.bin_heads[bin];
            while node != I::UNUSED {
                node = self.nodes[node.to_u32() as usize].bin_next;
                count += 1;
            }
            *region = BinReport {
                size: small_float::to_uint(bin as u32),
                count,
            };
        }

        StorageReportFull { free_regions }
    }

    /// Files a free region of `size` units at `offset`, taking a descriptor
    /// slot and pushing it onto the head of its size class's free list.
    ///
    /// The caller must guarantee a free slot exists.
    fn insert_into_bin(&mut self, size: u32, offset: u32) -> I {
        // Round down so the bin's advertised minimum never exceeds the
        // region; paired with the rounded-up search in `allocate`.
        let bin = small_float::round_down(size);

        let head = self.bin_heads[bin as usize];
        if head == I::UNUSED {
            self.used_bins.mark(bin);
        }

        let node_index = self.free_nodes[self.free_offset as usize];
        self.free_offset = self.free_offset.wrapping_sub(1);

        let idx = node_index.to_u32() as usize;
        self.nodes[idx] = Node {
            offset,
            size,
            bin_prev: I::UNUSED,
            bin_next: head,
            neighbor_prev: I::UNUSED,
            neighbor_next: I::UNUSED,
            used: false,
        };
        if head != I::UNUSED {
            self.nodes[head.to_u32() as usize].bin_prev = node_index;
        }
        self.bin_heads[bin as usize] = node_index;

        self.free_storage += size;
        log::trace!("insert: node {idx} into bin {bin}, free storage {} (+{size})", self.free_storage);

        node_index
    }

    /// Unlinks a free node from its size class's list and returns its
    /// descriptor slot to the stack.
    fn remove_from_bin(&mut self, node_index: I) {
        let idx = node_index.to_u32() as usize;
        let node = self.nodes[idx];

        if node.bin_prev != I::UNUSED {
            // Interior node: unlink in place.
            self.nodes[node.bin_prev.to_u32() as usize].bin_next = node.bin_next;
            if node.bin_next != I::UNUSED {
                self.nodes[node.bin_next.to_u32() as usize].bin_prev = node.bin_prev;
            }
        } else {
            // Head node: recompute which bin owns it and advance the head.
            let bin = small_float::round_down(node.size);
            self.bin_heads[bin as usize] = node.bin_next;
            if node.bin_next != I::UNUSED {
                self.nodes[node.bin_next.to_u32() as usize].bin_prev = I::UNUSED;
            } else {
                self.used_bins.unmark(bin);
            }
        }

        self.free_offset = self.free_offset.wrapping_add(1);
        self.free_nodes[self.free_offset as usize] = node_index;

        self.free_storage -= node.size;
        log::trace!("remove: node {idx}, free storage {} (-{})", self.free_storage, node.size);
    }
}

impl<I: NodeIndex> Default for OffsetAllocator<I> {
    fn default() -> OffsetAllocator<I> {
        OffsetAllocator::new(Self::DEFAULT_MAX_ALLOCS)
    }
}

impl<I: NodeIndex> core::fmt::Debug for OffsetAllocator<I> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OffsetAllocator")
            .field("size", &self.size)
            .field("max_allocs", &self.max_allocs)
            .field("free_storage", &self.free_storage)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
impl<I: NodeIndex> OffsetAllocator<I> {
    /// Walks every internal structure and asserts the resting invariants:
    /// bitmask/bin-list agreement, bin discipline, neighbor-chain coverage
    /// and ordering, coalescing minimality, and free-storage accounting.
    pub(crate) fn check_invariants(&self) {
        if self.nodes.is_empty() {
            return;
        }

        // Which descriptor slots are live (not on the free stack).
        let mut live = vec![true; self.nodes.len()];
        if self.free_offset != Allocation::NO_SPACE {
            for slot in &self.free_nodes[..=self.free_offset as usize] {
                let s = slot.to_u32() as usize;
                assert!(live[s], "slot {s} appears twice in the free stack");
                live[s] = false;
            }
        }

        // Bin lists: mask bit set iff list non-empty; members are free,
        // correctly back-linked, and file to exactly this bin.
        let mut free_total = 0u64;
        let mut listed = 0usize;
        for bin in 0..NUM_LEAF_BINS as u32 {
            let head = self.bin_heads[bin as usize];
            assert_eq!(head != I::UNUSED, self.used_bins.is_marked(bin));

            let mut prev = I::UNUSED;
            let mut cursor = head;
            while cursor != I::UNUSED {
                let c = cursor.to_u32() as usize;
                assert!(live[c], "bin {bin} links a recycled slot");
                let node = &self.nodes[c];
                assert!(!node.used);
                assert_eq!(small_float::round_down(node.size), bin);
                assert_eq!(node.bin_prev, prev);
                free_total += u64::from(node.size);
                listed += 1;
                prev = cursor;
                cursor = node.bin_next;
            }
        }
        assert_eq!(free_total, u64::from(self.free_storage));

        // Neighbor chain: starts at offset 0, is contiguous and strictly
        // increasing, never holds two free regions back to back, visits
        // every live node, and covers the whole range.
        let head = (0..self.nodes.len())
            .find(|&i| live[i] && self.nodes[i].neighbor_prev == I::UNUSED && self.nodes[i].offset == 0)
            .expect("neighbor chain has no head");

        let mut visited = 0usize;
        let mut free_visited = 0usize;
        let mut expected_offset = 0u64;
        let mut prev_free = false;
        let mut prev_index = I::UNUSED;
        let mut cursor = head;
        loop {
            let node = &self.nodes[cursor];
            assert!(live[cursor], "neighbor chain links a recycled slot");
            assert_eq!(u64::from(node.offset), expected_offset);
            assert_eq!(node.neighbor_prev, prev_index);
            if visited > 0 {
                assert!(node.used || !prev_free, "adjacent free regions left uncoalesced");
            }

            visited += 1;
            free_visited += usize::from(!node.used);
            expected_offset += u64::from(node.size);
            prev_free = !node.used;
            prev_index = I::from_u32(cursor as u32);

            if node.neighbor_next == I::UNUSED {
                break;
            }
            cursor = node.neighbor_next.to_u32() as usize;
        }
        assert_eq!(expected_offset, u64::from(self.size), "neighbor chain does not cover the range");
        assert_eq!(visited, live.iter().filter(|&&l| l).count());
        assert_eq!(free_visited, listed, "free node outside every bin list");
    }
}
