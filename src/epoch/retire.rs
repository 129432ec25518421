//! Per-shelf persistent retire bag.
//!
//! A bounded ring inside the shelf's metadata region. Producers (user
//! threads retiring blocks) reserve a slot with a tail CAS and publish the
//! entry by storing its epoch word last; the consumer (the epoch advancer)
//! frees entries whose epoch has become quiescent and advances the head.
//! An entry's epoch word doubles as its state: zero means empty or
//! mid-write, anything else is a pending retirement. Draining is serialized
//! by a pid-stamped lock word so exactly one advancer at a time walks the
//! ring, across processes.

use std::time::Duration;

use tracing::warn;

use crate::fam;
use crate::zone::layout::{RING_ENTRY_BYTES, ZoneLayout};

/// One retired block: where it lives, how big it is, when it was retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetiredBlock {
    /// Byte offset of the block within its shelf.
    pub offset: u64,
    /// Size class of the block in bytes.
    pub size: u64,
    /// Global epoch at retirement.
    pub epoch: u64,
}

pub(crate) struct RetireRing {
    head: *mut u64,
    lock: *mut u64,
    tail: *mut u64,
    entries: *mut u64,
    capacity: u64,
}

// SAFETY: all shared words are accessed through the persistent atomics.
unsafe impl Send for RetireRing {}
unsafe impl Sync for RetireRing {}

impl RetireRing {
    /// Build the ring view for a shelf mapped at `base` with `layout`.
    ///
    /// # Safety
    /// `base` must point at a live registered mapping laid out per `layout`.
    pub(crate) unsafe fn new(base: *mut u8, layout: &ZoneLayout) -> Self {
        unsafe {
            Self {
                head: base.add(layout.ring_head_off as usize).cast(),
                // the drain lock shares the head's cache line
                lock: base.add(layout.ring_head_off as usize + 8).cast(),
                tail: base.add(layout.ring_tail_off as usize).cast(),
                entries: base.add(layout.ring_entries_off as usize).cast(),
                capacity: layout.ring_capacity,
            }
        }
    }

    #[inline]
    fn entry_ptr(&self, index: u64, word: usize) -> *mut u64 {
        let slot = index % self.capacity;
        // SAFETY: slot < capacity and each entry is RING_ENTRY_BYTES wide.
        unsafe {
            self.entries
                .add((slot * RING_ENTRY_BYTES / 8) as usize + word)
        }
    }

    /// Number of entries currently pending.
    pub(crate) fn len(&self) -> u64 {
        let tail = unsafe { fam::load64(self.tail) };
        let head = unsafe { fam::load64(self.head) };
        tail.saturating_sub(head)
    }

    /// Append a retirement. Lock-free in the common case; when the ring is
    /// full the producer waits for the advancer to drain.
    pub(crate) fn append(&self, block: RetiredBlock) {
        debug_assert!(block.epoch != 0);
        let mut warned = false;
        loop {
            let head = unsafe { fam::load64(self.head) };
            let tail = unsafe { fam::load64(self.tail) };
            if tail.wrapping_sub(head) >= self.capacity {
                if !warned {
                    warn!(capacity = self.capacity, "retire ring full; waiting for drain");
                    warned = true;
                }
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
            if unsafe { fam::cas64(self.tail, tail, tail.wrapping_add(1)) } == tail {
                unsafe {
                    fam::store64(self.entry_ptr(tail, 0), block.offset);
                    fam::store64(self.entry_ptr(tail, 1), block.size);
                    fam::persist(self.entry_ptr(tail, 0).cast(), 16);
                    // the epoch store publishes the entry
                    fam::store64(self.entry_ptr(tail, 2), block.epoch);
                    fam::persist(self.entry_ptr(tail, 2).cast(), 8);
                    fam::persist(self.tail.cast(), 8);
                }
                return;
            }
        }
    }

    /// Free every leading entry retired before `min_reported`, handing each
    /// to `free`. Returns the number of entries reclaimed.
    ///
    /// Entries are consumed in retirement order; the walk stops at the
    /// first entry that is still in flight or not yet quiescent.
    pub(crate) fn drain(&self, min_reported: u64, mut free: impl FnMut(u64, u64)) -> u64 {
        let pid = std::process::id() as u64;
        if unsafe { fam::cas64(self.lock, 0, pid) } != 0 {
            // another advancer owns this ring right now
            return 0;
        }

        let mut drained = 0;
        let tail = unsafe { fam::load64(self.tail) };
        let mut head = unsafe { fam::load64(self.head) };
        while head != tail {
            let epoch = unsafe { fam::load64(self.entry_ptr(head, 2)) };
            if epoch == 0 || epoch >= min_reported {
                break;
            }
            let offset = unsafe { fam::load64(self.entry_ptr(head, 0)) };
            let size = unsafe { fam::load64(self.entry_ptr(head, 1)) };
            free(offset, size);
            unsafe {
                // clear the slot before exposing it to producers via head
                fam::store64(self.entry_ptr(head, 2), 0);
                fam::persist(self.entry_ptr(head, 2).cast(), 8);
                fam::store64(self.head, head.wrapping_add(1));
                fam::persist(self.head.cast(), 8);
            }
            head = head.wrapping_add(1);
            drained += 1;
        }

        unsafe {
            fam::store64(self.lock, 0);
        }
        drained
    }

    /// Steal the drain lock of a crashed process.
    pub(crate) fn break_stale_lock(&self, pid_alive: impl Fn(u64) -> bool) {
        let owner = unsafe { fam::load64(self.lock) };
        if owner != 0 && !pid_alive(owner) {
            warn!(owner, "breaking retire-ring lock of dead process");
            unsafe {
                fam::cas64(self.lock, owner, 0);
            }
        }
    }
}
