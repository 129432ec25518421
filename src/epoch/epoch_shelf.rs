//! The epoch shelf: one file per backing store holding the global epoch
//! counter and the participant slots.
//!
//! Layout: the first cache line holds the magic, the format version, and
//! the global epoch word; each following cache line is one participant
//! slot, `(reported_epoch, owner_pid)`. The magic is written last during
//! creation so a crashed create fails verification.

use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::constants::{CACHE_LINE_BYTES, EPOCH_MAGIC, FORMAT_VERSION, MAX_PARTICIPANTS};
use crate::epoch::INACTIVE;
use crate::fam;
use crate::shelf::ShelfFile;
use crate::size::MIB;

/// Fixed size of the epoch shelf file.
const EPOCH_SHELF_SIZE: u64 = 1 * MIB;

/// Byte offset of the global epoch word (after magic and version).
const EPOCH_WORD_OFF: usize = 16;

/// Byte offset of the first participant slot.
const SLOTS_OFF: usize = CACHE_LINE_BYTES;

/// Initial value of the global epoch counter. Nonzero so that `INACTIVE`
/// can never collide with a real epoch.
const INITIAL_EPOCH: u64 = 1;

pub(crate) struct EpochShelf {
    file: ShelfFile,
}

impl EpochShelf {
    /// Path of the epoch shelf within a store root.
    pub(crate) fn path_in(root: &Path) -> PathBuf {
        root.join("epoch")
    }

    /// Open the store's epoch shelf, creating and formatting it first if it
    /// does not exist yet.
    pub(crate) fn open_or_create(root: &Path) -> io::Result<Self> {
        let path = Self::path_in(root);
        match ShelfFile::create(&path, EPOCH_SHELF_SIZE, 0o660) {
            Ok(file) => {
                // the file is born zeroed: all slots INACTIVE, epoch unset
                let shelf = Self { file };
                unsafe {
                    fam::store64(shelf.file.base().add(8).cast(), FORMAT_VERSION);
                    fam::store64(shelf.epoch_ptr(), INITIAL_EPOCH);
                    fam::persist(shelf.file.base(), SLOTS_OFF);
                }
                shelf.file.write_magic(EPOCH_MAGIC);
                debug!(path = %path.display(), "created epoch shelf");
                Ok(shelf)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // another process may still be formatting; give the magic a
                // moment to appear
                let mut last_err = None;
                for _ in 0..50 {
                    match ShelfFile::open(&path, EPOCH_MAGIC) {
                        Ok(file) => return Ok(Self { file }),
                        Err(e) => last_err = Some(e),
                    }
                    std::thread::sleep(std::time::Duration::from_millis(2));
                }
                Err(last_err.unwrap_or_else(|| io::Error::other("epoch shelf open failed")))
            }
            Err(e) => Err(e),
        }
    }

    #[inline]
    fn epoch_ptr(&self) -> *mut u64 {
        // SAFETY: EPOCH_WORD_OFF is inside the fixed-size mapping.
        unsafe { self.file.base().add(EPOCH_WORD_OFF).cast() }
    }

    #[inline]
    fn slot_ptr(&self, slot: usize, word: usize) -> *mut u64 {
        debug_assert!(slot < MAX_PARTICIPANTS);
        debug_assert!(word < CACHE_LINE_BYTES / 8);
        // SAFETY: MAX_PARTICIPANTS cache lines fit in the fixed-size mapping.
        unsafe {
            self.file
                .base()
                .add(SLOTS_OFF + slot * CACHE_LINE_BYTES + word * 8)
                .cast()
        }
    }

    /// Current global epoch (acquire).
    #[inline]
    pub(crate) fn load_epoch(&self) -> u64 {
        unsafe { fam::load64(self.epoch_ptr()) }
    }

    /// Advance the global epoch from `current` by one. Returns `true` if
    /// this call performed the increment.
    pub(crate) fn try_advance_epoch(&self, current: u64) -> bool {
        let won = unsafe { fam::cas64(self.epoch_ptr(), current, current.wrapping_add(1)) }
            == current;
        if won {
            unsafe { fam::persist(self.epoch_ptr().cast(), 8) };
        }
        won
    }

    /// Reported epoch of `slot` (acquire).
    #[inline]
    pub(crate) fn slot_epoch(&self, slot: usize) -> u64 {
        unsafe { fam::load64(self.slot_ptr(slot, 0)) }
    }

    /// Owner pid recorded in `slot`.
    #[inline]
    pub(crate) fn slot_pid(&self, slot: usize) -> u64 {
        unsafe { fam::load64(self.slot_ptr(slot, 1)) }
    }

    /// Try to claim an inactive slot, publishing `epoch` and `pid`.
    pub(crate) fn try_claim_slot(&self, slot: usize, epoch: u64, pid: u64) -> bool {
        let won = unsafe { fam::cas64(self.slot_ptr(slot, 0), INACTIVE, epoch) } == INACTIVE;
        if won {
            unsafe {
                fam::store64(self.slot_ptr(slot, 1), pid);
                fam::persist(self.slot_ptr(slot, 0).cast(), 16);
            }
        }
        won
    }

    /// Update the reported epoch of a slot owned by the caller.
    pub(crate) fn update_slot(&self, slot: usize, epoch: u64) {
        unsafe {
            fam::store64(self.slot_ptr(slot, 0), epoch);
            fam::persist(self.slot_ptr(slot, 0).cast(), 8);
        }
    }

    /// Release a slot owned by the caller.
    pub(crate) fn release_slot(&self, slot: usize) {
        self.update_slot(slot, INACTIVE);
    }

    /// Forcibly release a slot whose owner is known to be gone.
    pub(crate) fn reclaim_slot(&self, slot: usize, observed_epoch: u64) -> bool {
        unsafe { fam::cas64(self.slot_ptr(slot, 0), observed_epoch, INACTIVE) == observed_epoch }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_then_reopen() {
        let dir = TempDir::new().unwrap();

        let shelf = EpochShelf::open_or_create(dir.path()).unwrap();
        assert_eq!(shelf.load_epoch(), INITIAL_EPOCH);
        assert!(shelf.try_advance_epoch(INITIAL_EPOCH));
        drop(shelf);

        let shelf = EpochShelf::open_or_create(dir.path()).unwrap();
        assert_eq!(shelf.load_epoch(), INITIAL_EPOCH + 1);
    }

    #[test]
    fn test_advance_is_single_winner() {
        let dir = TempDir::new().unwrap();
        let shelf = EpochShelf::open_or_create(dir.path()).unwrap();

        let e = shelf.load_epoch();
        assert!(shelf.try_advance_epoch(e));
        assert!(!shelf.try_advance_epoch(e));
        assert_eq!(shelf.load_epoch(), e + 1);
    }

    #[test]
    fn test_slot_lifecycle() {
        let dir = TempDir::new().unwrap();
        let shelf = EpochShelf::open_or_create(dir.path()).unwrap();

        assert_eq!(shelf.slot_epoch(3), INACTIVE);
        assert!(shelf.try_claim_slot(3, 7, 1234));
        assert!(!shelf.try_claim_slot(3, 9, 99));
        assert_eq!(shelf.slot_epoch(3), 7);
        assert_eq!(shelf.slot_pid(3), 1234);

        shelf.update_slot(3, 8);
        assert_eq!(shelf.slot_epoch(3), 8);

        shelf.release_slot(3);
        assert_eq!(shelf.slot_epoch(3), INACTIVE);
        assert!(shelf.try_claim_slot(3, 10, 99));
    }

    #[test]
    fn test_reclaim_requires_observed_epoch() {
        let dir = TempDir::new().unwrap();
        let shelf = EpochShelf::open_or_create(dir.path()).unwrap();

        shelf.try_claim_slot(0, 5, 42);
        assert!(!shelf.reclaim_slot(0, 4));
        assert!(shelf.reclaim_slot(0, 5));
        assert_eq!(shelf.slot_epoch(0), INACTIVE);
    }
}
