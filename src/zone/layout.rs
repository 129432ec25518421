//! Persistent metadata layout of a zone shelf.
//!
//! Everything the allocator needs to recover after a crash lives at the
//! front of the shelf: the header, per-level scan cursors, the retire ring,
//! the per-level free bitmaps, the split bitmaps used to infer a block's
//! size from its offset, and the merge-queue bitmaps for the deferred top
//! levels. The user-allocatable region starts at `meta_end`, which is always
//! a multiple of the minimum allocation size.

use crate::constants::CACHE_LINE_BYTES;
use crate::utility::{align_up, log2, words_for_bits};

/// Number of top levels whose coalescing is deferred to `merge()`.
pub(crate) const DEFERRED_MERGE_LEVELS: u32 = 3;

/// Bytes per retire-ring entry: `(ptr, size, epoch)`.
pub(crate) const RING_ENTRY_BYTES: u64 = 24;

/// Computed byte offsets of every metadata structure within a shelf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ZoneLayout {
    /// Total shelf size in bytes (a power of two).
    pub shelf_size: u64,
    /// Minimum allocation size in bytes (a power of two >= 64).
    pub min_alloc: u64,
    /// log2 of `min_alloc`.
    pub min_alloc_log2: u32,
    /// Number of buddy levels; level `i` holds blocks of `min_alloc << i`.
    pub levels: u32,
    /// Offset of the per-level cursor array (`levels` u64 words).
    pub cursors_off: u64,
    /// Offset of the retire-ring head word (own cache line).
    pub ring_head_off: u64,
    /// Offset of the retire-ring tail word (own cache line).
    pub ring_tail_off: u64,
    /// Offset of the retire-ring entry array.
    pub ring_entries_off: u64,
    /// Number of entries in the retire ring.
    pub ring_capacity: u64,
    /// Per-level offsets of the free bitmaps.
    pub free_off: Vec<u64>,
    /// Per-level offsets of the split bitmaps (index 0 is unused; level-0
    /// blocks have no children).
    pub split_off: Vec<u64>,
    /// Offsets of the merge-queue pair bitmaps for levels
    /// `levels-DEFERRED_MERGE_LEVELS ..= levels-2`, in ascending level order.
    pub merge_off: Vec<u64>,
    /// End of the metadata region; first user-allocatable byte.
    pub meta_end: u64,
}

impl ZoneLayout {
    /// Compute the layout for a shelf of `shelf_size` bytes with the given
    /// minimum allocation size.
    ///
    /// Requires both arguments to be powers of two with
    /// `shelf_size >= min_alloc * 64`, which guarantees at least seven
    /// levels and a metadata region smaller than the shelf.
    pub(crate) fn compute(shelf_size: u64, min_alloc: u64) -> Self {
        assert!(shelf_size.is_power_of_two());
        assert!(min_alloc.is_power_of_two());
        assert!(shelf_size >= min_alloc * 64);

        let min_alloc_log2 = log2(min_alloc);
        let levels = log2(shelf_size) - min_alloc_log2 + 1;
        let blocks = |level: u32| shelf_size >> (min_alloc_log2 + level);

        let mut cursor = 64u64; // header occupies the first cache line

        let cursors_off = cursor;
        cursor += levels as u64 * 8;
        cursor = align_up(cursor, CACHE_LINE_BYTES as u64);

        let ring_head_off = cursor;
        cursor += CACHE_LINE_BYTES as u64;
        let ring_tail_off = cursor;
        cursor += CACHE_LINE_BYTES as u64;

        let ring_capacity = (blocks(0) / 64).clamp(64, 1024);
        let ring_entries_off = cursor;
        cursor += ring_capacity * RING_ENTRY_BYTES;
        cursor = align_up(cursor, 8);

        let mut free_off = Vec::with_capacity(levels as usize);
        for level in 0..levels {
            free_off.push(cursor);
            cursor += words_for_bits(blocks(level)) * 8;
        }

        let mut split_off = Vec::with_capacity(levels as usize);
        split_off.push(0); // level 0 never splits
        for level in 1..levels {
            split_off.push(cursor);
            cursor += words_for_bits(blocks(level)) * 8;
        }

        let deferred_floor = levels - DEFERRED_MERGE_LEVELS;
        let mut merge_off = Vec::with_capacity(DEFERRED_MERGE_LEVELS as usize - 1);
        for level in deferred_floor..levels - 1 {
            merge_off.push(cursor);
            cursor += words_for_bits(blocks(level) / 2) * 8;
        }

        let meta_end = align_up(cursor, min_alloc);
        assert!(meta_end < shelf_size, "metadata does not fit in the shelf");

        Self {
            shelf_size,
            min_alloc,
            min_alloc_log2,
            levels,
            cursors_off,
            ring_head_off,
            ring_tail_off,
            ring_entries_off,
            ring_capacity,
            free_off,
            split_off,
            merge_off,
            meta_end,
        }
    }

    /// Number of blocks at `level`.
    #[inline]
    pub(crate) fn blocks(&self, level: u32) -> u64 {
        self.shelf_size >> (self.min_alloc_log2 + level)
    }

    /// Block size in bytes at `level`.
    #[inline]
    pub(crate) fn block_size(&self, level: u32) -> u64 {
        self.min_alloc << level
    }

    /// Right-shift that turns an offset into a block index at `level`.
    #[inline]
    pub(crate) fn shift(&self, level: u32) -> u32 {
        self.min_alloc_log2 + level
    }

    /// First level whose coalescing is deferred to `merge()`.
    #[inline]
    pub(crate) fn deferred_floor(&self) -> u32 {
        self.levels - DEFERRED_MERGE_LEVELS
    }

    /// Buddy level for an allocation of `size` bytes, or `None` when the
    /// request exceeds the largest block.
    #[inline]
    pub(crate) fn level_for_size(&self, size: u64) -> Option<u32> {
        if size > self.shelf_size {
            return None;
        }
        let rounded = size.max(self.min_alloc).next_power_of_two();
        let level = log2(rounded).checked_sub(self.min_alloc_log2)?;
        (level < self.levels).then_some(level)
    }
}
