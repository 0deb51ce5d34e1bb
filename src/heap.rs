use std::{cmp, fmt, ptr, ptr::NonNull};

use crate::{
    block::{ALIGNMENT, Block, DSIZE, MIN_BLOCK_SIZE, OVERHEAD, WSIZE},
    freelist::FreeList,
    kernel::Segment,
    utils::align,
};

/// Bytes requested from the extension primitive whenever the heap runs out
/// of free space and the pending request is not larger than this.
pub const CHUNK_SIZE: usize = 1 << 12;

/// Reservation size used by [`Heap::new`].
pub const DEFAULT_CAPACITY: usize = 32 * 1024 * 1024;

/// Largest reservation a heap accepts. Free-list links are 4 byte offsets
/// from the heap base, so the managed region must stay addressable by them.
pub const MAX_CAPACITY: usize = 1 << 31;

/// Errors surfaced while bringing a heap up. After initialization the only
/// failure mode is exhaustion, reported as a null pointer per operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// The requested capacity exceeds [`MAX_CAPACITY`].
    CapacityTooLarge,
    /// The platform refused to reserve the backing region.
    ReservationFailed,
    /// The reservation is too small to hold the sentinels and the initial
    /// free pool.
    InitialExtendFailed,
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::CapacityTooLarge => {
                write!(f, "requested capacity exceeds the maximum heap size")
            }
            HeapError::ReservationFailed => {
                write!(f, "the platform refused to reserve the heap region")
            }
            HeapError::InitialExtendFailed => {
                write!(f, "the reservation cannot hold the initial free pool")
            }
        }
    }
}

impl std::error::Error for HeapError {}

/// A dynamic memory allocator over one growable contiguous region.
///
/// The managed region is one unbroken sequence of boundary-tagged blocks,
/// fenced by two permanently allocated sentinels so neighbor lookups never
/// step outside the region:
///
/// ```text
///          pad  prologue                                        epilogue
///         +----+----+----+-----------+-----------+-----~~~-----+----+
///         |    | 8|1| 8|1|   block   |   block   |     ...     | 0|1|
///         +----+----+----+-----------+-----------+-----~~~-----+----+
///         ^         ^                                               ^
///        base   heap start                                   grows here
/// ```
///
/// Free space is found by a first-fit walk over the block chain in address
/// order. Freed blocks are also indexed in a size-segregated [`FreeList`];
/// the search deliberately does not consult it (see DESIGN.md), but the
/// index is maintained through every operation and its summaries are
/// exposed for introspection.
///
/// A heap is a single-owner structure. Nothing here is synchronized and
/// concurrent use from several threads is out of contract.
pub struct Heap {
    /// The reserved region and its growth break.
    segment: Segment,
    /// Size-segregated index of every free block.
    free_list: FreeList,
}

/// Block size needed to serve a request of `size` payload bytes: the
/// payload rounded up to the alignment unit plus both tag words, never
/// less than the minimum block.
#[inline]
fn adjusted_size(size: usize) -> usize {
    if size <= DSIZE {
        MIN_BLOCK_SIZE
    } else {
        align(size, DSIZE) + OVERHEAD
    }
}

impl Heap {
    /// Creates a heap backed by a [`DEFAULT_CAPACITY`] reservation.
    pub fn new() -> Result<Self, HeapError> {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a heap backed by a reservation of `capacity` bytes, rounded
    /// up to the page size. The heap can never grow past the reservation;
    /// a small capacity is the deterministic way to exercise exhaustion.
    pub fn with_capacity(capacity: usize) -> Result<Self, HeapError> {
        if capacity > MAX_CAPACITY {
            return Err(HeapError::CapacityTooLarge);
        }

        let mut segment = Segment::reserve(capacity).ok_or(HeapError::ReservationFailed)?;
        let base = segment.base();

        // Pad word, prologue header and footer, epilogue header.
        let start = segment
            .extend_region(4 * WSIZE)
            .ok_or(HeapError::InitialExtendFailed)?;

        let mut heap = unsafe {
            start.as_ptr().cast::<u32>().write(0);

            let prologue = Block::from_payload(NonNull::new_unchecked(
                start.as_ptr().add(2 * WSIZE),
            ));
            prologue.write_tags(DSIZE, true);

            let epilogue = Block::from_payload(NonNull::new_unchecked(
                start.as_ptr().add(4 * WSIZE),
            ));
            epilogue.write_header(0, true);

            Heap {
                segment,
                free_list: FreeList::new(base),
            }
        };

        // Seed the free pool with one chunk.
        heap.extend_heap(CHUNK_SIZE)
            .ok_or(HeapError::InitialExtendFailed)?;

        Ok(heap)
    }

    /// The prologue sentinel, where address-order walks start.
    #[inline]
    fn prologue(&self) -> Block {
        unsafe { Block::at_offset(self.segment.base(), (2 * WSIZE) as u32) }
    }

    /// Grows the managed region by at least `bytes` and formats the new
    /// span as one free block. The new block's header lands where the old
    /// epilogue was and a fresh epilogue is written behind it. The block is
    /// then coalesced with a free predecessor, so the returned block may
    /// start before the new span.
    ///
    /// Returns None and leaves the heap untouched when the extension
    /// primitive fails.
    fn extend_heap(&mut self, bytes: usize) -> Option<Block> {
        let size = align(bytes, ALIGNMENT);
        let addr = self.segment.extend_region(size)?;

        unsafe {
            let block = Block::from_payload(addr);
            block.write_tags(size, false);
            block.next().write_header(0, true);

            Some(self.coalesce(block))
        }
    }

    /// First fit over the whole block chain in address order. Returns the
    /// first free block of at least `asize` bytes, or None when the walk
    /// reaches the epilogue.
    unsafe fn find_fit(&self, asize: usize) -> Option<Block> {
        unsafe {
            let mut block = self.prologue();

            while block.size() > 0 {
                if block.is_free() && block.size() >= asize {
                    return Some(block);
                }
                block = block.next();
            }

            None
        }
    }

    /// Turns the free block into an allocated one of `asize` bytes. When
    /// the tail that remains is big enough to stand on its own it becomes a
    /// new free block, otherwise the whole block is consumed. A split never
    /// produces a free block below the minimum size.
    unsafe fn place(&mut self, block: Block, asize: usize) {
        unsafe {
            let csize = block.size();

            self.free_list.remove(block);

            if csize - asize >= MIN_BLOCK_SIZE {
                block.write_tags(asize, true);

                let rest = block.next();
                rest.write_tags(csize - asize, false);
                self.free_list.add(rest);
            } else {
                block.write_tags(csize, true);
            }
        }
    }

    /// Merges a free block with whichever physical neighbors are free and
    /// indexes the result. Neighbor membership changes all go through the
    /// free-list index so it never holds an absorbed block. Returns the
    /// block that survives the merge.
    ///
    /// After this returns, no two adjacent blocks are both free.
    unsafe fn coalesce(&mut self, block: Block) -> Block {
        unsafe {
            let prev_free = block.prev_is_free();
            let next = block.next();
            let next_free = next.is_free();

            match (prev_free, next_free) {
                (false, false) => {
                    self.free_list.add(block);
                    block
                }
                (false, true) => {
                    self.free_list.remove(next);

                    let size = block.size() + next.size();
                    block.write_tags(size, false);

                    self.free_list.add(block);
                    block
                }
                (true, false) => {
                    let prev = block.prev();
                    self.free_list.remove(prev);

                    let size = prev.size() + block.size();
                    prev.write_tags(size, false);

                    self.free_list.add(prev);
                    prev
                }
                (true, true) => {
                    let prev = block.prev();
                    self.free_list.remove(prev);
                    self.free_list.remove(next);

                    let size = prev.size() + block.size() + next.size();
                    prev.write_tags(size, false);

                    self.free_list.add(prev);
                    prev
                }
            }
        }
    }

    /// Allocates a block of at least `size` bytes and returns its payload
    /// pointer, aligned to [`ALIGNMENT`]. Returns null for a zero `size`
    /// and when the heap cannot grow to satisfy the request; existing
    /// allocations are never disturbed by a failure.
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }

        let asize = adjusted_size(size);

        unsafe {
            if let Some(block) = self.find_fit(asize) {
                self.place(block, asize);
                return block.payload().as_ptr();
            }

            // No fit anywhere in the chain, grow the heap.
            match self.extend_heap(cmp::max(asize, CHUNK_SIZE)) {
                Some(block) => {
                    self.place(block, asize);
                    block.payload().as_ptr()
                }
                None => ptr::null_mut(),
            }
        }
    }

    /// Releases a block previously returned by [`Heap::allocate`] or
    /// [`Heap::resize`]. A null pointer is explicitly ignored.
    ///
    /// **SAFETY**: `ptr` must be null or originate from this heap and not
    /// have been freed already. Double frees and foreign pointers are
    /// undefined behavior, they are not detected.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        let Some(payload) = NonNull::new(ptr) else {
            return;
        };

        unsafe {
            let block = Block::from_payload(payload);
            block.write_tags(block.size(), false);
            self.coalesce(block);
        }
    }

    /// Resizes the allocation at `ptr` to `size` bytes.
    ///
    /// A zero `size` behaves as [`Heap::free`] and returns null. A null
    /// `ptr` behaves as [`Heap::allocate`]. A shrink happens in place and
    /// keeps the pointer; when the cut tail would be smaller than the
    /// minimum block the layout is left as is. Growth moves the payload to
    /// a fresh block and releases the old one. When growth fails the old
    /// block is untouched and null is returned.
    ///
    /// **SAFETY**: same contract as [`Heap::free`] for non-null `ptr`.
    pub unsafe fn resize(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        if size == 0 {
            unsafe { self.free(ptr) };
            return ptr::null_mut();
        }

        let Some(payload) = NonNull::new(ptr) else {
            return self.allocate(size);
        };

        unsafe {
            let block = Block::from_payload(payload);
            let old_size = block.size();
            let asize = adjusted_size(size);

            if asize == old_size {
                return ptr;
            }

            if asize < old_size {
                if old_size - asize < MIN_BLOCK_SIZE {
                    // The tail would be too small to exist as a block.
                    return ptr;
                }

                block.write_tags(asize, true);

                let rest = block.next();
                rest.write_tags(old_size - asize, true);
                self.free(rest.payload().as_ptr());

                return ptr;
            }

            let new_ptr = self.allocate(size);
            if new_ptr.is_null() {
                return ptr::null_mut();
            }

            let copy = cmp::min(old_size - OVERHEAD, size);
            ptr::copy_nonoverlapping(ptr, new_ptr, copy);

            self.free(ptr);

            new_ptr
        }
    }

    /// Diagnostic entry point reserved for a full heap consistency audit.
    /// It currently performs no checks and always reports success; callers
    /// must not use it as a correctness signal.
    pub fn check_heap(&self) -> bool {
        true
    }

    /// Total bytes of the managed region handed out by the extension
    /// primitive so far, sentinels included.
    pub fn heap_size(&self) -> usize {
        self.segment.len()
    }

    /// Number of free blocks currently tracked by the index.
    pub fn free_blocks(&self) -> usize {
        self.free_list.count()
    }

    /// Lowest nonempty size-class bucket, or None while nothing is free.
    pub fn min_bucket(&self) -> Option<usize> {
        self.free_list.minlist()
    }

    /// Sum of the sizes of all free blocks, tag words included.
    pub fn free_bytes(&self) -> usize {
        let mut total = 0;

        unsafe {
            let mut block = self.prologue();
            while block.size() > 0 {
                if block.is_free() {
                    total += block.size();
                }
                block = block.next();
            }
        }

        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freelist::NUM_BUCKETS;
    use std::collections::BTreeSet;

    /// Walks the block chain and returns `(payload offset, size, free)` for
    /// every block from the prologue up to the epilogue.
    fn chain(heap: &Heap) -> Vec<(usize, usize, bool)> {
        let base = heap.segment.base();
        let mut out = Vec::new();

        unsafe {
            let mut block = heap.prologue();
            loop {
                let size = block.size();
                if size == 0 {
                    break;
                }
                out.push((block.offset_from(base) as usize, size, block.is_free()));
                block = block.next();
            }
        }

        out
    }

    /// Asserts every structural invariant of the heap: tag agreement,
    /// alignment, no adjacent free blocks, a well-formed epilogue, and full
    /// agreement between the block chain and the free-list index with its
    /// two summaries.
    fn check_invariants(heap: &Heap) {
        let base = heap.segment.base();
        let blocks = chain(heap);

        // The prologue sentinel leads the chain.
        assert_eq!((2 * WSIZE, DSIZE, false), blocks[0]);

        unsafe {
            for &(off, size, _) in &blocks {
                let header = base.as_ptr().add(off - WSIZE).cast::<u32>().read();
                let footer = base.as_ptr().add(off + size - DSIZE).cast::<u32>().read();
                assert_eq!(header, footer, "boundary tags disagree at offset {off}");
                assert_eq!(0, off % ALIGNMENT, "misaligned payload at offset {off}");
                assert_eq!(0, size % ALIGNMENT, "misaligned size at offset {off}");
            }

            // Allocated zero-size epilogue right after the last block.
            let (last_off, last_size, _) = *blocks.last().unwrap();
            let epilogue = base
                .as_ptr()
                .add(last_off + last_size - WSIZE)
                .cast::<u32>()
                .read();
            assert_eq!(1, epilogue, "epilogue header is damaged");
            assert_eq!(heap.heap_size(), last_off + last_size);
        }

        for pair in blocks.windows(2) {
            assert!(
                !(pair[0].2 && pair[1].2),
                "adjacent free blocks at offsets {} and {}",
                pair[0].0,
                pair[1].0
            );
        }

        let chain_free: BTreeSet<u32> = blocks
            .iter()
            .filter(|b| b.2)
            .map(|b| b.0 as u32)
            .collect();
        assert_eq!(chain_free.len(), heap.free_list.count());

        let mut indexed = BTreeSet::new();
        let mut min_nonempty = None;

        for bucket in 0..NUM_BUCKETS {
            let entries = unsafe { heap.free_list.bucket_entries(bucket) };

            if !entries.is_empty() && min_nonempty.is_none() {
                min_nonempty = Some(bucket);
            }

            let mut last = 0;
            for (off, size) in entries {
                assert!(size >= last, "bucket {bucket} is not in ascending order");
                last = size;
                assert_eq!(bucket, FreeList::bucket_of(size));
                assert!(indexed.insert(off), "block indexed twice");
            }
        }

        assert_eq!(min_nonempty, heap.free_list.minlist());
        assert_eq!(chain_free, indexed);
    }

    #[test]
    fn fresh_heap_has_one_seeded_free_block() {
        let heap = Heap::new().unwrap();

        assert_eq!(1, heap.free_blocks());
        assert_eq!(CHUNK_SIZE, heap.free_bytes());
        check_invariants(&heap);
    }

    #[test]
    fn allocations_are_aligned() {
        let mut heap = Heap::new().unwrap();

        for size in 1..64 {
            let ptr = heap.allocate(size);
            assert!(!ptr.is_null());
            assert_eq!(0, ptr as usize % ALIGNMENT, "size {size} misaligned");
        }

        check_invariants(&heap);
    }

    #[test]
    fn allocate_zero_returns_null() {
        let mut heap = Heap::new().unwrap();
        assert!(heap.allocate(0).is_null());
        check_invariants(&heap);
    }

    #[test]
    fn free_null_is_ignored() {
        let mut heap = Heap::new().unwrap();
        unsafe { heap.free(ptr::null_mut()) };
        check_invariants(&heap);
    }

    #[test]
    fn live_allocations_do_not_overlap() {
        let mut heap = Heap::new().unwrap();
        let mut spans = Vec::new();

        for (i, size) in [24usize, 100, 8, 300, 56].iter().enumerate() {
            let ptr = heap.allocate(*size);
            assert!(!ptr.is_null());

            unsafe { ptr.write_bytes(i as u8 + 1, *size) };
            spans.push((ptr as usize, *size, i as u8 + 1));
        }

        for (a_start, a_len, _) in &spans {
            for (b_start, b_len, _) in &spans {
                if a_start != b_start {
                    let disjoint = a_start + a_len <= *b_start || b_start + b_len <= *a_start;
                    assert!(disjoint, "payload ranges overlap");
                }
            }
        }

        // Every payload still holds its fill pattern.
        for (start, len, fill) in &spans {
            unsafe {
                for i in 0..*len {
                    assert_eq!(*fill, ((*start + i) as *const u8).read());
                }
            }
        }

        check_invariants(&heap);
    }

    #[test]
    fn freed_space_is_reused_without_growing() {
        let mut heap = Heap::new().unwrap();

        let a = heap.allocate(100);
        let _b = heap.allocate(200);
        let size_before = heap.heap_size();

        unsafe { heap.free(a) };

        let c = heap.allocate(50);
        assert_eq!(a, c, "the freed block was not reused");
        assert_eq!(size_before, heap.heap_size(), "the heap grew needlessly");
        check_invariants(&heap);
    }

    #[test]
    fn search_is_first_fit_in_address_order() {
        let mut heap = Heap::new().unwrap();

        let big = heap.allocate(200);
        let _guard1 = heap.allocate(16);
        let small = heap.allocate(64);
        let _guard2 = heap.allocate(16);

        unsafe {
            heap.free(big);
            heap.free(small);
        }
        check_invariants(&heap);

        // Both free blocks fit. A best-fit search would pick the small one,
        // first fit returns the earlier address.
        let ptr = heap.allocate(50);
        assert_eq!(big, ptr);
        check_invariants(&heap);
    }

    #[test]
    fn reverse_frees_coalesce_to_a_single_block() {
        let mut heap = Heap::new().unwrap();
        let free_before = heap.free_bytes();

        let ptrs: Vec<*mut u8> = (0..8).map(|_| heap.allocate(16)).collect();
        assert!(ptrs.iter().all(|p| !p.is_null()));
        check_invariants(&heap);

        for ptr in ptrs.into_iter().rev() {
            unsafe { heap.free(ptr) };
            check_invariants(&heap);
        }

        assert_eq!(1, heap.free_blocks());
        assert_eq!(free_before, heap.free_bytes());
    }

    #[test]
    fn allocate_then_free_restores_free_bytes() {
        let mut heap = Heap::new().unwrap();
        let free_before = heap.free_bytes();

        let ptr = heap.allocate(100);
        unsafe { heap.free(ptr) };

        assert_eq!(free_before, heap.free_bytes());
        check_invariants(&heap);
    }

    #[test]
    fn heap_grows_when_nothing_fits() {
        let mut heap = Heap::new().unwrap();
        let size_before = heap.heap_size();

        // Larger than the seeded chunk, must extend.
        let ptr = heap.allocate(5000);
        assert!(!ptr.is_null());
        assert!(heap.heap_size() > size_before);
        check_invariants(&heap);
    }

    #[test]
    fn exhaustion_returns_null_and_preserves_the_heap() {
        let mut heap = Heap::with_capacity(2 * CHUNK_SIZE).unwrap();

        let ptr = heap.allocate(100);
        assert!(!ptr.is_null());
        unsafe { ptr.write_bytes(0x5A, 100) };

        // Far beyond the reservation.
        assert!(heap.allocate(1 << 20).is_null());

        unsafe {
            for i in 0..100 {
                assert_eq!(0x5A, ptr.add(i).read());
            }
        }
        check_invariants(&heap);

        // The allocator keeps working after the failure.
        let again = heap.allocate(64);
        assert!(!again.is_null());
        check_invariants(&heap);
    }

    #[test]
    fn oversized_capacity_is_rejected() {
        assert_eq!(
            Err(HeapError::CapacityTooLarge),
            Heap::with_capacity(MAX_CAPACITY + 1).map(|_| ())
        );
    }

    #[test]
    fn resize_equal_size_keeps_the_pointer() {
        let mut heap = Heap::new().unwrap();

        let ptr = heap.allocate(100);
        let resized = unsafe { heap.resize(ptr, 100) };

        assert_eq!(ptr, resized);
        check_invariants(&heap);
    }

    #[test]
    fn resize_shrink_preserves_data_in_place() {
        let mut heap = Heap::new().unwrap();

        let ptr = heap.allocate(100);
        let _guard = heap.allocate(16);
        unsafe {
            for i in 0..100 {
                ptr.add(i).write(i as u8);
            }
        }

        let resized = unsafe { heap.resize(ptr, 40) };
        assert_eq!(ptr, resized);

        unsafe {
            for i in 0..40 {
                assert_eq!(i as u8, ptr.add(i).read());
            }
        }
        check_invariants(&heap);
    }

    #[test]
    fn resize_tiny_shrink_leaves_the_block_alone() {
        let mut heap = Heap::new().unwrap();

        let ptr = heap.allocate(100);
        let free_before = heap.free_bytes();

        // The cut tail would be under the minimum block size.
        let resized = unsafe { heap.resize(ptr, 96) };

        assert_eq!(ptr, resized);
        assert_eq!(free_before, heap.free_bytes());
        check_invariants(&heap);
    }

    #[test]
    fn resize_grow_moves_data_and_recycles_the_old_block() {
        let mut heap = Heap::new().unwrap();

        let ptr = heap.allocate(100);
        let _guard = heap.allocate(16);
        unsafe {
            for i in 0..100 {
                ptr.add(i).write(!(i as u8));
            }
        }

        let grown = unsafe { heap.resize(ptr, 500) };
        assert!(!grown.is_null());
        assert_ne!(ptr, grown);

        unsafe {
            for i in 0..100 {
                assert_eq!(!(i as u8), grown.add(i).read());
            }
        }
        check_invariants(&heap);

        // The old address is free again and first fit hands it back.
        let reused = heap.allocate(100);
        assert_eq!(ptr, reused);
        check_invariants(&heap);
    }

    #[test]
    fn resize_zero_behaves_as_free() {
        let mut heap = Heap::new().unwrap();
        let free_before = heap.free_bytes();

        let ptr = heap.allocate(100);
        let out = unsafe { heap.resize(ptr, 0) };

        assert!(out.is_null());
        assert_eq!(free_before, heap.free_bytes());
        check_invariants(&heap);
    }

    #[test]
    fn resize_null_behaves_as_allocate() {
        let mut heap = Heap::new().unwrap();

        let ptr = unsafe { heap.resize(ptr::null_mut(), 64) };
        assert!(!ptr.is_null());
        assert_eq!(0, ptr as usize % ALIGNMENT);
        check_invariants(&heap);
    }

    #[test]
    fn resize_grow_failure_leaves_the_old_block_valid() {
        let mut heap = Heap::with_capacity(2 * CHUNK_SIZE).unwrap();

        let ptr = heap.allocate(100);
        unsafe { ptr.write_bytes(0xC3, 100) };

        let grown = unsafe { heap.resize(ptr, 1 << 20) };
        assert!(grown.is_null());

        unsafe {
            for i in 0..100 {
                assert_eq!(0xC3, ptr.add(i).read());
            }
        }
        check_invariants(&heap);
    }

    #[test]
    fn check_heap_stub_reports_success() {
        let heap = Heap::new().unwrap();
        assert!(heap.check_heap());
    }

    #[test]
    fn summaries_stay_consistent_under_churn() {
        let mut heap = Heap::new().unwrap();
        let mut live = Vec::new();

        let sizes = [24usize, 100, 72, 300, 8, 56, 1024, 48, 200, 16];

        for round in 0..6 {
            for (i, size) in sizes.iter().enumerate() {
                let ptr = heap.allocate(size + round * 8);
                assert!(!ptr.is_null());
                live.push(ptr);

                if i % 3 == 2 {
                    let victim = live.remove(live.len() / 2);
                    unsafe { heap.free(victim) };
                }
                check_invariants(&heap);
            }
        }

        for ptr in live.drain(..) {
            unsafe { heap.free(ptr) };
            check_invariants(&heap);
        }

        // Everything was returned, one fully coalesced span per heap region.
        assert_eq!(1, heap.free_blocks());
    }

    #[test]
    fn two_heaps_are_independent() {
        let mut first = Heap::new().unwrap();
        let mut second = Heap::new().unwrap();

        let a = first.allocate(100);
        let b = second.allocate(100);
        assert!(!a.is_null() && !b.is_null());

        unsafe { first.free(a) };
        check_invariants(&first);
        check_invariants(&second);

        assert_eq!(1, second.free_blocks());
    }
}
