//! Per-shelf buddy allocator
//!
//! A zone partitions one shelf into power-of-two blocks. Each level `i`
//! tracks blocks of `min_alloc << i` bytes in a persistent free bitmap;
//! split bitmaps record which blocks have been broken into children, which
//! is how a block's size is recovered from its bare offset. Coalescing is
//! eager below the top [`layout::DEFERRED_MERGE_LEVELS`] levels and deferred
//! to [`Zone::merge`] above, keeping the hot free path to a bounded number
//! of CAS steps.
//!
//! Every state transition is one CAS on one persistent word, persisted
//! before the next dependent step, so a shelf re-opened after a crash is
//! always structurally consistent.

pub(crate) mod bitmap;
pub(crate) mod layout;

use bytemuck::{Pod, Zeroable};
use tracing::warn;

use crate::constants::FORMAT_VERSION;
use crate::error::ErrorCode;
use crate::fam;
use bitmap::{BitmapView, FreeOutcome};
use layout::ZoneLayout;

/// Persistent shelf header. The magic word is written separately, last,
/// by the shelf-file layer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
struct ZoneHeader {
    magic: u64,
    version: u64,
    min_alloc: u64,
    shelf_size: u64,
    meta_end: u64,
    levels: u64,
    _reserved: [u64; 2],
}

/// Buddy allocator over one mapped shelf.
pub(crate) struct Zone {
    base: *mut u8,
    layout: ZoneLayout,
    free: Vec<BitmapView>,
    split: Vec<BitmapView>,
    merge_q: Vec<BitmapView>,
    cursors: *mut u64,
}

// SAFETY: all shared state lives in the mapping and is only touched through
// word-level atomics; the raw pointers themselves are never reassigned.
unsafe impl Send for Zone {}
unsafe impl Sync for Zone {}

impl Zone {
    /// Build the bitmap views for a known-good layout.
    ///
    /// # Safety
    /// `base` must point at a live registered mapping of at least
    /// `layout.shelf_size` bytes laid out per `layout`.
    unsafe fn from_parts(base: *mut u8, layout: ZoneLayout) -> Self {
        let view = |off: u64, bits: u64| unsafe { BitmapView::new(base.add(off as usize), bits) };

        let mut free = Vec::with_capacity(layout.levels as usize);
        for level in 0..layout.levels {
            free.push(view(layout.free_off[level as usize], layout.blocks(level)));
        }

        let mut split = Vec::with_capacity(layout.levels as usize);
        split.push(BitmapView::empty());
        for level in 1..layout.levels {
            split.push(view(layout.split_off[level as usize], layout.blocks(level)));
        }

        let mut merge_q = Vec::with_capacity(layout.merge_off.len());
        for (i, &off) in layout.merge_off.iter().enumerate() {
            let level = layout.deferred_floor() + i as u32;
            merge_q.push(view(off, layout.blocks(level) / 2));
        }

        let cursors = unsafe { base.add(layout.cursors_off as usize).cast::<u64>() };

        Self {
            base,
            layout,
            free,
            split,
            merge_q,
            cursors,
        }
    }

    /// Format a freshly created (zero-filled) shelf and return its zone.
    ///
    /// Writes the header (magic excepted), then releases the user region by
    /// carving the metadata prefix out of the buddy tree: blocks wholly
    /// inside the prefix stay allocated, blocks wholly outside become free,
    /// and straddling blocks are split.
    ///
    /// # Safety
    /// `base` must point at a live registered mapping of `shelf_size` bytes
    /// that is all zero and not yet shared with other threads.
    pub(crate) unsafe fn format(base: *mut u8, shelf_size: u64, min_alloc: u64) -> Self {
        let layout = ZoneLayout::compute(shelf_size, min_alloc);
        let header = ZoneHeader {
            magic: 0,
            version: FORMAT_VERSION,
            min_alloc,
            shelf_size,
            meta_end: layout.meta_end,
            levels: layout.levels as u64,
            _reserved: [0; 2],
        };
        // SAFETY: the mapping starts with a zeroed header-sized span.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytemuck::bytes_of(&header).as_ptr(),
                base,
                size_of::<ZoneHeader>(),
            );
            fam::persist(base, size_of::<ZoneHeader>());
        }

        let zone = unsafe { Self::from_parts(base, layout) };
        zone.carve(zone.layout.levels - 1, 0);
        zone
    }

    /// Open a zone over an already-verified shelf mapping.
    pub(crate) unsafe fn open(base: *mut u8, mapped_len: u64) -> Result<Self, ErrorCode> {
        // SAFETY: the caller mapped at least a header's worth of bytes.
        let header = unsafe { base.cast::<ZoneHeader>().read() };
        if header.version != FORMAT_VERSION
            || header.shelf_size != mapped_len
            || !header.min_alloc.is_power_of_two()
            || header.min_alloc < crate::constants::MIN_MIN_ALLOC
            || header.shelf_size < header.min_alloc * 64
        {
            warn!(
                version = header.version,
                shelf_size = header.shelf_size,
                min_alloc = header.min_alloc,
                "zone header failed verification"
            );
            return Err(ErrorCode::HeapOpenFailed);
        }
        let layout = ZoneLayout::compute(header.shelf_size, header.min_alloc);
        if layout.meta_end != header.meta_end || layout.levels as u64 != header.levels {
            warn!("zone header disagrees with computed layout");
            return Err(ErrorCode::HeapOpenFailed);
        }
        Ok(unsafe { Self::from_parts(base, layout) })
    }

    /// The layout of this zone's shelf.
    #[inline]
    pub(crate) fn layout(&self) -> &ZoneLayout {
        &self.layout
    }

    /// Minimum allocation size in bytes.
    #[inline]
    pub(crate) fn min_alloc(&self) -> u64 {
        self.layout.min_alloc
    }

    /// First user-allocatable byte.
    #[inline]
    pub(crate) fn meta_end(&self) -> u64 {
        self.layout.meta_end
    }

    /// Allocate a block of at least `size` bytes.
    ///
    /// Returns the block's byte offset, or 0 when the request cannot be
    /// satisfied (offset 0 is always metadata, never a valid block).
    /// Capacity stranded in the deferred top levels is only recovered by an
    /// explicit [`Zone::merge`]; callers needing top-level blocks merge and
    /// retry.
    pub(crate) fn alloc(&self, size: u64) -> u64 {
        let Some(level) = self.layout.level_for_size(size) else {
            return 0;
        };
        self.try_alloc(level).unwrap_or(0)
    }

    fn try_alloc(&self, level: u32) -> Option<u64> {
        if let Some(idx) = self.claim_at(level) {
            return Some(idx << self.layout.shift(level));
        }
        for upper in level + 1..self.layout.levels {
            if let Some(idx) = self.claim_at(upper) {
                let offset = idx << self.layout.shift(upper);
                self.split_down(upper, offset, level);
                return Some(offset);
            }
        }
        None
    }

    /// Claim (clear) one free bit at `level`, scanning from its cursor.
    fn claim_at(&self, level: u32) -> Option<u64> {
        let idx = self.free[level as usize].find_and_claim(self.load_cursor(level))?;
        self.store_cursor(level, idx / 64);
        Some(idx)
    }

    /// Split the claimed block at `from` down to `to`, keeping the left
    /// half at each step and publishing the right buddy as free.
    fn split_down(&self, from: u32, offset: u64, to: u32) {
        for child in (to..from).rev() {
            let parent_idx = offset >> self.layout.shift(child + 1);
            self.split[(child + 1) as usize].try_set(parent_idx);
            let buddy_idx = (offset >> self.layout.shift(child)) + 1;
            self.free[child as usize].try_set(buddy_idx);
        }
    }

    /// Free a block given its exact size class (retire-bag drain path).
    pub(crate) fn free_sized(&self, offset: u64, size: u64) -> Result<(), ErrorCode> {
        let level = self
            .layout
            .level_for_size(size)
            .ok_or(ErrorCode::InvalidArguments)?;
        self.check_offset(offset, level)?;
        self.release(level, offset >> self.layout.shift(level))
    }

    /// Free a block given only its offset; the level is inferred from the
    /// split bitmaps. Returns the size of the freed block.
    pub(crate) fn free_at(&self, offset: u64) -> Result<u64, ErrorCode> {
        let level = self.level_of(offset)?;
        self.release(level, offset >> self.layout.shift(level))?;
        Ok(self.layout.block_size(level))
    }

    /// Size of the allocated block starting at `offset`.
    pub(crate) fn block_size_at(&self, offset: u64) -> Result<u64, ErrorCode> {
        Ok(self.layout.block_size(self.level_of(offset)?))
    }

    /// Walk the buddy tree from the top; the allocation level of `offset`
    /// is the first unsplit block on the path down to it.
    fn level_of(&self, offset: u64) -> Result<u32, ErrorCode> {
        if offset < self.layout.meta_end
            || offset >= self.layout.shelf_size
            || offset % self.layout.min_alloc != 0
        {
            return Err(ErrorCode::InvalidPtr);
        }
        let mut level = self.layout.levels - 1;
        loop {
            let idx = offset >> self.layout.shift(level);
            let is_split = level > 0 && self.split[level as usize].test(idx);
            if !is_split {
                if offset != idx << self.layout.shift(level)
                    || self.free[level as usize].test(idx)
                {
                    return Err(ErrorCode::InvalidPtr);
                }
                return Ok(level);
            }
            level -= 1;
        }
    }

    fn check_offset(&self, offset: u64, level: u32) -> Result<(), ErrorCode> {
        let block = self.layout.block_size(level);
        if offset < self.layout.meta_end || offset >= self.layout.shelf_size || offset % block != 0
        {
            return Err(ErrorCode::InvalidPtr);
        }
        Ok(())
    }

    /// Release block `idx` at `level`, coalescing eagerly below the
    /// deferred floor and queueing the buddy pair above it.
    fn release(&self, mut level: u32, mut idx: u64) -> Result<(), ErrorCode> {
        let floor = self.layout.deferred_floor();
        loop {
            if level >= floor {
                if !self.free[level as usize].try_set(idx) {
                    return Err(ErrorCode::InvalidPtr);
                }
                if level < self.layout.levels - 1 {
                    self.merge_q[(level - floor) as usize].try_set(idx / 2);
                }
                return Ok(());
            }
            match self.free[level as usize].free_or_merge(idx) {
                FreeOutcome::Freed => return Ok(()),
                FreeOutcome::AlreadyFree => return Err(ErrorCode::InvalidPtr),
                FreeOutcome::Merged => {
                    // both halves gone; the pair's block continues one up
                    self.split[(level + 1) as usize].try_clear(idx / 2);
                    level += 1;
                    idx /= 2;
                }
            }
        }
    }

    /// Coalesce queued buddy pairs in the deferred top levels, cascading
    /// upward. Idempotent; safe to run concurrently with alloc and free.
    pub(crate) fn merge(&self) {
        let floor = self.layout.deferred_floor();
        for level in floor..self.layout.levels - 1 {
            let queue = &self.merge_q[(level - floor) as usize];
            let pairs: Vec<u64> = queue.set_bits().collect();
            for pair in pairs {
                if !queue.try_clear(pair) {
                    continue;
                }
                if self.free[level as usize].try_clear_pair(pair) {
                    self.split[(level + 1) as usize].try_clear(pair);
                    self.free[(level + 1) as usize].try_set(pair);
                    if level + 1 < self.layout.levels - 1 {
                        self.merge_q[(level + 1 - floor) as usize].try_set(pair / 2);
                    }
                }
            }
        }
    }

    /// Carve the metadata prefix `[0, meta_end)` out of the buddy tree.
    fn carve(&self, level: u32, idx: u64) {
        let offset = idx << self.layout.shift(level);
        let size = self.layout.block_size(level);
        let meta_end = self.layout.meta_end;
        if meta_end <= offset {
            self.free[level as usize].try_set(idx);
            return;
        }
        if meta_end >= offset + size {
            return;
        }
        // meta_end is min-alloc aligned, so a straddling block is never at
        // level 0
        self.split[level as usize].try_set(idx);
        self.carve(level - 1, idx * 2);
        self.carve(level - 1, idx * 2 + 1);
    }

    #[inline]
    fn load_cursor(&self, level: u32) -> u64 {
        // SAFETY: `cursors` has `levels` words per the layout.
        unsafe { fam::load64(self.cursors.add(level as usize)) }
    }

    #[inline]
    fn store_cursor(&self, level: u32, word: u64) {
        // SAFETY: see load_cursor; the cursor is a hint, torn updates are
        // harmless.
        unsafe { fam::store64(self.cursors.add(level as usize), word) };
    }
}
