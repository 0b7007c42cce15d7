use super::small::SMALL_MAX;
use super::stats;
use super::vm::{PlatformVmOps, VmError, VmOps};
use crate::sync::atomic::Ordering;
use crate::sync::{Mutex, OnceLock};
use fixedbitset::FixedBitSet;
use std::ptr::NonNull;

/// Smallest block the buddy engine hands out (layer 0).
pub const SMALLEST_BUDDY_BLOCK: usize = 2 * SMALL_MAX;
/// Layer-0 blocks per chunk. Power of two.
pub const BUDDY_CHUNK_BLOCKS: usize = 4096;
/// Bytes covered by one chunk (4 MiB).
pub const BUDDY_CHUNK_BYTES: usize = BUDDY_CHUNK_BLOCKS * SMALLEST_BUDDY_BLOCK;
/// Largest buddy allocation: one whole chunk may not be returned as one block.
pub const MEDIUM_MAX: usize = BUDDY_CHUNK_BYTES / 2;
/// Maximum number of live chunks in the directory.
pub const BUDDY_CHUNK_CAPACITY: usize = 1024;

/// Layer of the single block covering a whole chunk.
const TOP_LAYER: u32 = BUDDY_CHUNK_BLOCKS.trailing_zeros();

/// A block in the power-of-two hierarchy. A block at layer `L` spans
/// `SMALLEST_BUDDY_BLOCK << L` bytes at byte offset `index · span` within its
/// chunk. Children of `(i, L)` are `(2i, L-1)` and `(2i+1, L-1)`; the buddy
/// is `(i XOR 1, L)`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct BuddyBlock {
    index: u32,
    layer: u32,
}

impl BuddyBlock {
    #[inline]
    fn size(self) -> usize {
        SMALLEST_BUDDY_BLOCK << self.layer
    }

    #[inline]
    fn offset(self) -> usize {
        self.size() * self.index as usize
    }
}

/// Layer serving `block_size`: sizes round up to the next power of two
/// (internal fragmentation is accepted), floored at layer 0.
pub(crate) fn layer_for(block_size: usize) -> u32 {
    let quantized = block_size.next_power_of_two().max(SMALLEST_BUDDY_BLOCK);
    quantized.trailing_zeros() - SMALLEST_BUDDY_BLOCK.trailing_zeros()
}

/// One 4 MiB reservation partitioned by the buddy hierarchy.
///
/// `allocated` and `free` hold only the roots of the subtrees currently in
/// each state: together they partition the chunk, a block appears in exactly
/// one list, and no listed block is an ancestor or descendant of another.
/// Holding roots keeps the block size recoverable on free without a bitmap
/// walk.
pub(crate) struct BuddyChunk {
    /// Chunk base, aligned to `BUDDY_CHUNK_BYTES` so every block is aligned
    /// to its own size in absolute addresses.
    base: NonNull<u8>,
    /// Original reservation pointer (release target).
    original: NonNull<u8>,
    /// Reservation length including alignment padding.
    reserved: usize,
    allocated: Vec<BuddyBlock>,
    free: Vec<BuddyBlock>,
    /// Pages of the chunk currently backed by physical memory.
    committed: FixedBitSet,
}

// Safety: BuddyChunk owns its reservation; the raw pointers are not shared.
unsafe impl Send for BuddyChunk {}

impl BuddyChunk {
    fn new() -> Result<Self, VmError> {
        // The OS only guarantees page alignment of reservations, so
        // over-reserve by one chunk length and align the base up.
        let reserved = BUDDY_CHUNK_BYTES * 2;
        // Safety: FFI call to reserve memory.
        let original = unsafe { PlatformVmOps::reserve(reserved)? };

        let addr = original.as_ptr() as usize;
        let aligned = (addr + BUDDY_CHUNK_BYTES - 1) & !(BUDDY_CHUNK_BYTES - 1);
        // Safety: aligned lies within the reservation and is non-zero.
        let base = unsafe { NonNull::new_unchecked(aligned as *mut u8) };

        stats::TOTAL_RESERVED.fetch_add(reserved, Ordering::Relaxed);

        Ok(Self {
            base,
            original,
            reserved,
            allocated: Vec::new(),
            // A fresh chunk is one free block at the top layer.
            free: vec![BuddyBlock {
                index: 0,
                layer: TOP_LAYER,
            }],
            committed: FixedBitSet::with_capacity(BUDDY_CHUNK_BYTES / PlatformVmOps::page_size()),
        })
    }

    /// Whether `addr` lies inside this chunk. Reservations are never released
    /// while the chunk is live, so this test is stable.
    #[inline]
    pub(crate) fn contains(&self, addr: usize) -> bool {
        let start = self.base.as_ptr() as usize;
        addr >= start && addr < start + BUDDY_CHUNK_BYTES
    }

    /// Commit the page-aligned range covering `[offset, offset + len)`,
    /// skipping pages already committed.
    fn commit_range(&mut self, offset: usize, len: usize) -> Result<(), VmError> {
        let page_size = PlatformVmOps::page_size();
        let first = offset / page_size;
        let last = (offset + len).div_ceil(page_size);

        let mut p = first;
        while p < last {
            if self.committed.contains(p) {
                p += 1;
                continue;
            }
            let run_start = p;
            while p < last && !self.committed.contains(p) {
                p += 1;
            }
            let run_len = (p - run_start) * page_size;
            // Safety: the run lies inside our reservation.
            let ptr = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(run_start * page_size)) };
            // Safety: FFI call to commit memory.
            unsafe { PlatformVmOps::commit(ptr, run_len)? };
            self.committed.set_range(run_start..p, true);
            stats::TOTAL_COMMITTED.fetch_add(run_len, Ordering::Relaxed);
            stats::BUDDY_COMMITTED.fetch_add(run_len, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Decommit every committed page in `[offset, offset + len)`.
    /// The range is page-exact: callers pass block ranges of at least one page,
    /// and such blocks are page-aligned.
    fn decommit_range(&mut self, offset: usize, len: usize) {
        let page_size = PlatformVmOps::page_size();
        debug_assert!(offset.is_multiple_of(page_size) && len.is_multiple_of(page_size));
        let first = offset / page_size;
        let last = (offset + len) / page_size;

        let mut p = first;
        while p < last {
            if !self.committed.contains(p) {
                p += 1;
                continue;
            }
            let run_start = p;
            while p < last && self.committed.contains(p) {
                p += 1;
            }
            let run_len = (p - run_start) * page_size;
            // Safety: the run lies inside our reservation.
            let ptr = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(run_start * page_size)) };
            // Safety: FFI call to decommit memory.
            if unsafe { PlatformVmOps::decommit(ptr, run_len) }.is_ok() {
                self.committed.set_range(run_start..p, false);
                stats::sub_saturating(&stats::TOTAL_COMMITTED, run_len);
                stats::sub_saturating(&stats::BUDDY_COMMITTED, run_len);
            }
        }
    }

    /// Allocate a block at `layer`, or `None` when no free block fits.
    fn alloc(&mut self, layer: u32) -> Result<Option<NonNull<u8>>, VmError> {
        // Best fit by layer, first match on ties.
        let mut best: Option<usize> = None;
        for (i, b) in self.free.iter().enumerate() {
            if b.layer >= layer && best.is_none_or(|j| b.layer < self.free[j].layer) {
                best = Some(i);
            }
        }
        let Some(pos) = best else {
            return Ok(None);
        };

        // Split down to the requested layer; the right child stays free, the
        // left child continues.
        let mut block = self.free.swap_remove(pos);
        while block.layer > layer {
            block.layer -= 1;
            block.index *= 2;
            self.free.push(BuddyBlock {
                index: block.index + 1,
                layer: block.layer,
            });
        }

        if let Err(e) = self.commit_range(block.offset(), block.size()) {
            // Failed allocate leaves no allocated entry behind; the split
            // children stay free and any pages committed so far stay
            // committed for later calls.
            self.free.push(block);
            return Err(e);
        }
        self.allocated.push(block);

        let addr = self.base.as_ptr() as usize + block.offset();
        debug_assert!(addr.is_multiple_of(block.size()));
        // Safety: addr is non-null, inside the chunk.
        Ok(Some(unsafe { NonNull::new_unchecked(addr as *mut u8) }))
    }

    fn free(&mut self, ptr: NonNull<u8>) {
        let page_size = PlatformVmOps::page_size();
        let offset = ptr.as_ptr() as usize - self.base.as_ptr() as usize;

        let Some(pos) = self.allocated.iter().position(|b| b.offset() == offset) else {
            debug_assert!(false, "pointer {ptr:p} matches no allocated buddy block");
            return;
        };
        let mut block = self.allocated.swap_remove(pos);

        if block.size() >= page_size {
            self.decommit_range(block.offset(), block.size());
        }
        self.free.push(block);

        // Coalesce: while the buddy is free, replace the pair with the parent.
        while block.layer < TOP_LAYER {
            let buddy = BuddyBlock {
                index: block.index ^ 1,
                layer: block.layer,
            };
            let Some(buddy_pos) = self.free.iter().position(|&b| b == buddy) else {
                break;
            };
            let block_pos = self
                .free
                .iter()
                .position(|&b| b == block)
                .expect("coalescing block is no longer free");

            // Swap-remove the higher position first so the lower stays valid.
            let (hi, lo) = if buddy_pos > block_pos {
                (buddy_pos, block_pos)
            } else {
                (block_pos, buddy_pos)
            };
            self.free.swap_remove(hi);
            self.free.swap_remove(lo);

            block = BuddyBlock {
                index: block.index >> 1,
                layer: block.layer + 1,
            };
            if block.size() >= page_size {
                self.decommit_range(block.offset(), block.size());
            }
            self.free.push(block);
        }
    }

    #[cfg(test)]
    fn committed_pages(&self) -> usize {
        self.committed.count_ones(..)
    }
}

impl Drop for BuddyChunk {
    fn drop(&mut self) {
        let page_size = PlatformVmOps::page_size();
        let still_committed = self.committed.count_ones(..) * page_size;
        // Safety: we own the reservation; dropping the chunk invalidates all
        // pointers into it, which callers must not retain.
        unsafe {
            drop(PlatformVmOps::release(self.original, self.reserved));
        }
        stats::sub_saturating(&stats::TOTAL_RESERVED, self.reserved);
        stats::sub_saturating(&stats::TOTAL_COMMITTED, still_committed);
        stats::sub_saturating(&stats::BUDDY_COMMITTED, still_committed);
    }
}

/// The chunk directory: up to [`BUDDY_CHUNK_CAPACITY`] chunks, initialized
/// lazily in index order.
pub(crate) struct BuddyAllocator {
    chunks: Vec<BuddyChunk>,
}

impl BuddyAllocator {
    pub(crate) fn new() -> Self {
        Self { chunks: Vec::new() }
    }

    pub(crate) fn alloc(&mut self, block_size: usize) -> Result<NonNull<u8>, VmError> {
        debug_assert!(
            block_size > SMALL_MAX && block_size <= MEDIUM_MAX,
            "block size {block_size} is not a medium allocation"
        );
        let layer = layer_for(block_size);

        for chunk in &mut self.chunks {
            if let Some(ptr) = chunk.alloc(layer)? {
                return Ok(ptr);
            }
        }

        if self.chunks.len() == BUDDY_CHUNK_CAPACITY {
            return Err(VmError::BuddyExhausted { block_size });
        }
        self.chunks.push(BuddyChunk::new()?);
        match self.chunks.last_mut().unwrap().alloc(layer)? {
            Some(ptr) => Ok(ptr),
            // A fresh chunk holds a top-layer block, which covers any medium layer.
            None => unreachable!("fresh buddy chunk could not serve layer {layer}"),
        }
    }

    /// Free `ptr` if one of the chunks owns it.
    /// Returns `false` when no chunk's range contains the pointer.
    pub(crate) fn try_free(&mut self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        for chunk in &mut self.chunks {
            if chunk.contains(addr) {
                chunk.free(ptr);
                return true;
            }
        }
        false
    }

    #[cfg(test)]
    pub(crate) fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Every initialized chunk is back to a single top-layer free block.
    #[cfg(test)]
    pub(crate) fn all_chunks_coalesced(&self) -> bool {
        self.chunks.iter().all(|c| {
            c.allocated.is_empty() && c.free.len() == 1 && c.free[0].layer == TOP_LAYER
        })
    }
}

static GLOBAL_BUDDY: OnceLock<Mutex<BuddyAllocator>> = OnceLock::new();

/// Process-wide buddy directory behind a coarse mutex: one outstanding
/// medium allocate/free at a time.
pub(crate) struct GlobalBuddy;

impl GlobalBuddy {
    fn instance() -> &'static Mutex<BuddyAllocator> {
        GLOBAL_BUDDY.get_or_init(|| Mutex::new(BuddyAllocator::new()))
    }

    /// Allocate a medium block.
    ///
    /// # Panics
    ///
    /// Panics if the global lock is poisoned.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if the directory is exhausted or a commit fails.
    pub(crate) fn alloc(block_size: usize) -> Result<NonNull<u8>, VmError> {
        Self::instance().lock().unwrap().alloc(block_size)
    }

    /// Free `ptr` if the buddy regime owns it; `false` otherwise.
    ///
    /// # Safety
    /// If a chunk's range contains `ptr`, it must be the start of a block
    /// previously returned by [`alloc`](Self::alloc) and not yet freed.
    pub(crate) unsafe fn try_free(ptr: NonNull<u8>) -> bool {
        Self::instance().lock().unwrap().try_free(ptr)
    }

    /// Inspect the directory under the lock.
    #[cfg(test)]
    pub(crate) fn with_directory<R>(f: impl FnOnce(&BuddyAllocator) -> R) -> R {
        f(&Self::instance().lock().unwrap())
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_layer_for_quantization() {
        assert_eq!(layer_for(513), 0);
        assert_eq!(layer_for(1024), 0);
        assert_eq!(layer_for(1025), 1);
        assert_eq!(layer_for(2048), 1);
        assert_eq!(layer_for(4096), 2);
        assert_eq!(layer_for(100_000), layer_for(131_072));
        assert_eq!(layer_for(MEDIUM_MAX), TOP_LAYER - 1);
    }

    #[test]
    fn test_block_geometry() {
        let top = BuddyBlock {
            index: 0,
            layer: TOP_LAYER,
        };
        assert_eq!(top.size(), BUDDY_CHUNK_BYTES);
        assert_eq!(top.offset(), 0);

        let b = BuddyBlock { index: 3, layer: 2 };
        assert_eq!(b.size(), 4096);
        assert_eq!(b.offset(), 3 * 4096);
    }

    #[test]
    fn test_fresh_chunk_is_one_top_block() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let chunk = BuddyChunk::new().unwrap();
        assert_eq!(chunk.free, vec![BuddyBlock { index: 0, layer: TOP_LAYER }]);
        assert!(chunk.allocated.is_empty());
        assert_eq!(chunk.committed_pages(), 0);
        assert_eq!(chunk.base.as_ptr() as usize % BUDDY_CHUNK_BYTES, 0);
    }

    #[test]
    fn test_smallest_alloc_splits_to_layer_zero() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut chunk = BuddyChunk::new().unwrap();
        let ptr = chunk.alloc(0).unwrap().unwrap();

        assert_eq!(ptr.as_ptr(), chunk.base.as_ptr());
        assert_eq!(chunk.allocated, vec![BuddyBlock { index: 0, layer: 0 }]);
        // One right child left free per split: layers 0 through TOP-1.
        assert_eq!(chunk.free.len(), TOP_LAYER as usize);
        for layer in 0..TOP_LAYER {
            assert!(
                chunk.free.contains(&BuddyBlock { index: 1, layer }),
                "missing right child at layer {layer}"
            );
        }

        chunk.free(ptr);
    }

    #[test]
    fn test_free_coalesces_to_top() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut chunk = BuddyChunk::new().unwrap();
        let mut ptrs = Vec::new();
        for _ in 0..8 {
            ptrs.push(chunk.alloc(0).unwrap().unwrap());
        }
        for p in ptrs {
            chunk.free(p);
        }
        assert_eq!(chunk.free, vec![BuddyBlock { index: 0, layer: TOP_LAYER }]);
        assert!(chunk.allocated.is_empty());
        assert_eq!(chunk.committed_pages(), 0);
    }

    #[test]
    fn test_second_alloc_takes_the_buddy() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut chunk = BuddyChunk::new().unwrap();
        let a = chunk.alloc(0).unwrap().unwrap();
        // Best fit by layer: the freed right child at layer 0 beats every
        // larger free block.
        let b = chunk.alloc(0).unwrap().unwrap();
        assert_eq!(
            b.as_ptr() as usize - a.as_ptr() as usize,
            SMALLEST_BUDDY_BLOCK
        );
        chunk.free(a);
        chunk.free(b);
    }

    #[test]
    fn test_blocks_are_naturally_aligned() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut dir = BuddyAllocator::new();
        let mut live = Vec::new();
        let mut size = SMALLEST_BUDDY_BLOCK;
        while size <= MEDIUM_MAX {
            let ptr = dir.alloc(size).unwrap();
            assert_eq!(
                ptr.as_ptr() as usize % size,
                0,
                "block of {size} at {ptr:p} is not size-aligned"
            );
            live.push(ptr);
            size *= 2;
        }
        for ptr in live {
            assert!(dir.try_free(ptr));
        }
    }

    #[test]
    fn test_non_power_of_two_rounds_up() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut chunk = BuddyChunk::new().unwrap();
        let a = chunk.alloc(layer_for(1500)).unwrap().unwrap();
        // 1500 rounds to 2048; the neighbouring 2048 block starts at 2048.
        let b = chunk.alloc(layer_for(2048)).unwrap().unwrap();
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 2048);
        chunk.free(a);
        chunk.free(b);
        assert_eq!(chunk.free.len(), 1);
    }

    #[test]
    fn test_blocks_do_not_overlap() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut dir = BuddyAllocator::new();
        let mut live: Vec<(usize, usize)> = Vec::new();
        let mut ptrs = Vec::new();

        for i in 0..64usize {
            let size = SMALLEST_BUDDY_BLOCK << (i % 4);
            let ptr = dir.alloc(size).unwrap();
            let start = ptr.as_ptr() as usize;
            for &(s, e) in &live {
                assert!(start + size <= s || start >= e, "block overlap detected");
            }
            live.push((start, start + size));
            ptrs.push(ptr);
        }
        for ptr in ptrs {
            assert!(dir.try_free(ptr));
        }
    }

    #[test]
    fn test_chunk_exhaustion_grows_directory() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut dir = BuddyAllocator::new();
        // Two half-chunk blocks fill the first chunk.
        let a = dir.alloc(MEDIUM_MAX).unwrap();
        let b = dir.alloc(MEDIUM_MAX).unwrap();
        assert_eq!(dir.chunk_count(), 1);

        // The third forces a second chunk.
        let c = dir.alloc(MEDIUM_MAX).unwrap();
        assert_eq!(dir.chunk_count(), 2);

        assert!(dir.try_free(a));
        assert!(dir.try_free(b));
        assert!(dir.try_free(c));

        // Both chunks fully coalesced.
        for chunk in &dir.chunks {
            assert_eq!(chunk.free.len(), 1);
            assert!(chunk.allocated.is_empty());
        }
    }

    #[test]
    fn test_free_decommits_page_sized_blocks() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let page_size = PlatformVmOps::page_size();
        let mut chunk = BuddyChunk::new().unwrap();

        let layer = layer_for(page_size.max(SMALLEST_BUDDY_BLOCK));
        let ptr = chunk.alloc(layer).unwrap().unwrap();
        assert!(chunk.committed_pages() >= 1);

        chunk.free(ptr);
        assert_eq!(chunk.committed_pages(), 0);
    }

    #[test]
    fn test_subpage_blocks_share_committed_pages() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let page_size = PlatformVmOps::page_size();
        if SMALLEST_BUDDY_BLOCK >= page_size {
            return; // no sub-page layer on this page size
        }
        let mut chunk = BuddyChunk::new().unwrap();
        let per_page = page_size / SMALLEST_BUDDY_BLOCK;

        let mut ptrs = Vec::new();
        for _ in 0..per_page {
            ptrs.push(chunk.alloc(0).unwrap().unwrap());
        }
        // All layer-0 blocks so far live in the first page.
        assert_eq!(chunk.committed_pages(), 1);

        // Freeing one sub-page block must not decommit the shared page.
        let first = ptrs.remove(0);
        chunk.free(first);
        assert_eq!(chunk.committed_pages(), 1);

        // Freeing the rest coalesces to a page-sized parent, which decommits.
        for p in ptrs {
            chunk.free(p);
        }
        assert_eq!(chunk.committed_pages(), 0);
    }

    #[test]
    fn test_allocations_are_writable() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut dir = BuddyAllocator::new();
        let size = 64 * 1024;
        let ptr = dir.alloc(size).unwrap();
        // Safety: Test code; ptr points to `size` committed bytes.
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0xB7, size);
            assert_eq!(*ptr.as_ptr(), 0xB7);
            assert_eq!(*ptr.as_ptr().add(size - 1), 0xB7);
        }
        assert!(dir.try_free(ptr));
    }

    #[test]
    fn test_try_free_rejects_foreign_pointer() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut dir = BuddyAllocator::new();
        let ptr = dir.alloc(2048).unwrap();

        let mut local = 0u64;
        let foreign = NonNull::new(&mut local as *mut u64 as *mut u8).unwrap();
        assert!(!dir.try_free(foreign));

        assert!(dir.try_free(ptr));
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "matches no allocated buddy block")]
    fn test_misaligned_free_panics_in_debug() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut chunk = BuddyChunk::new().unwrap();
        let ptr = chunk.alloc(1).unwrap().unwrap();
        // An interior pointer matches no allocated block offset.
        // Safety: Test code; the pointer is only used for the lookup.
        let interior = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(SMALLEST_BUDDY_BLOCK)) };
        chunk.free(interior);
    }
}
