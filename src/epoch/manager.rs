//! Epoch manager: global counter, participant slots, background advancer.
//!
//! One manager exists per backing-store root directory per process, created
//! lazily and shut down explicitly (or on last drop). The manager owns the
//! mapped epoch shelf and a timer-driven worker thread that advances the
//! global epoch when every participant has caught up and then drains the
//! retire bags of all registered heaps.

use std::cell::Cell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Sender, bounded, RecvTimeoutError};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::config::NvheapConfig;
use crate::constants::MAX_PARTICIPANTS;
use crate::epoch::INACTIVE;
use crate::epoch::epoch_shelf::EpochShelf;
use crate::error::ErrorCode;

/// A heap (or other owner of retire bags) the advancer drains on each pass.
pub(crate) trait RetireTarget: Send + Sync {
    /// Free retired blocks whose epoch is below `min_reported`.
    fn drain_retired(&self, min_reported: u64);
}

static MANAGERS: OnceLock<Mutex<HashMap<PathBuf, Weak<EpochManager>>>> = OnceLock::new();

fn managers() -> &'static Mutex<HashMap<PathBuf, Weak<EpochManager>>> {
    MANAGERS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Whether a process with `pid` still exists.
pub(crate) fn pid_alive(pid: u64) -> bool {
    if pid == 0 || pid > i32::MAX as u64 {
        return true; // malformed; never reclaim on bad data
    }
    // SAFETY: kill with signal 0 only probes for existence.
    let rc = unsafe { libc::kill(pid as i32, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

thread_local! {
    static SLOT_HINT: Cell<usize> = const { Cell::new(0) };
}

/// Process-wide epoch manager for one backing store.
pub struct EpochManager {
    shelf: EpochShelf,
    interval: Duration,
    targets: Mutex<Vec<Weak<dyn RetireTarget>>>,
    worker: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
}

impl EpochManager {
    /// Get (lazily creating) the manager for the store rooted at
    /// `config.root_dir`.
    pub fn instance(config: &NvheapConfig) -> Result<Arc<Self>, ErrorCode> {
        let mut map = managers().lock();
        if let Some(existing) = map.get(&config.root_dir).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let shelf = EpochShelf::open_or_create(&config.root_dir).map_err(|e| {
            error!(root = %config.root_dir.display(), %e, "failed to open epoch shelf");
            ErrorCode::HeapOpenFailed
        })?;
        let manager = Arc::new(Self {
            shelf,
            interval: config.epoch_advance_interval,
            targets: Mutex::new(Vec::new()),
            worker: Mutex::new(None),
        });
        manager.start_worker();
        map.insert(config.root_dir.clone(), Arc::downgrade(&manager));
        debug!(root = %config.root_dir.display(), "epoch manager started");
        Ok(manager)
    }

    fn start_worker(self: &Arc<Self>) {
        let (tx, rx) = bounded::<()>(1);
        let weak = Arc::downgrade(self);
        let interval = self.interval;
        let handle = std::thread::Builder::new()
            .name("nvheap-epoch".into())
            .spawn(move || {
                loop {
                    match rx.recv_timeout(interval) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    let Some(manager) = weak.upgrade() else { break };
                    manager.tick();
                }
            })
            .expect("failed to spawn epoch advancer");
        *self.worker.lock() = Some((tx, handle));
    }

    /// Stop the background advancer. Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        if let Some((tx, handle)) = self.worker.lock().take() {
            drop(tx);
            if handle.thread().id() == std::thread::current().id() {
                // the worker itself dropped the last reference; it is
                // already on its way out
                return;
            }
            if let Err(e) = handle.join() {
                warn!(?e, "epoch advancer panicked");
            }
        }
    }

    /// Current global epoch.
    pub fn current_epoch(&self) -> u64 {
        self.shelf.load_epoch()
    }

    /// Register a heap whose retire bags the advancer should drain.
    pub(crate) fn register_target(&self, target: Weak<dyn RetireTarget>) {
        let mut targets = self.targets.lock();
        targets.retain(|t| t.strong_count() > 0);
        targets.push(target);
    }

    /// Run one advancer pass synchronously: reclaim dead participant slots,
    /// advance the epoch if every participant has caught up, and drain the
    /// registered retire bags.
    pub fn tick(&self) {
        let current = self.shelf.load_epoch();
        let min_reported = self.min_reported(current);
        if min_reported == current {
            self.shelf.try_advance_epoch(current);
        }
        let mut targets = self.targets.lock();
        targets.retain(|weak| match weak.upgrade() {
            Some(target) => {
                target.drain_retired(min_reported);
                true
            }
            None => false,
        });
    }

    /// Minimum reported epoch over active slots, reclaiming slots whose
    /// owning process has died along the way. Returns `current` when no
    /// slot is active.
    fn min_reported(&self, current: u64) -> u64 {
        let mut min = current;
        for slot in 0..MAX_PARTICIPANTS {
            let mut epoch = self.shelf.slot_epoch(slot);
            if epoch == INACTIVE {
                continue;
            }
            let pid = self.shelf.slot_pid(slot);
            if pid != 0 && !pid_alive(pid) && self.shelf.reclaim_slot(slot, epoch) {
                warn!(slot, pid, "reclaimed epoch slot of dead process");
                continue;
            }
            epoch = self.shelf.slot_epoch(slot);
            if epoch != INACTIVE && epoch < min {
                min = epoch;
            }
        }
        min
    }

    fn claim_slot(&self) -> Result<(usize, u64), ErrorCode> {
        let pid = std::process::id() as u64;
        let hint = SLOT_HINT.with(Cell::get);
        let mut epoch = self.shelf.load_epoch();
        for i in 0..MAX_PARTICIPANTS {
            let slot = (hint + i) % MAX_PARTICIPANTS;
            if !self.shelf.try_claim_slot(slot, epoch, pid) {
                continue;
            }
            // revalidate: the advancer may have bumped the counter between
            // our read and the claim becoming visible
            loop {
                let current = self.shelf.load_epoch();
                if current == epoch {
                    break;
                }
                self.shelf.update_slot(slot, current);
                epoch = current;
            }
            SLOT_HINT.with(|h| h.set(slot));
            return Ok((slot, epoch));
        }
        Err(ErrorCode::HeapBusy)
    }

    fn release_slot(&self, slot: usize) {
        self.shelf.release_slot(slot);
    }
}

impl Drop for EpochManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A balanced epoch scope: enters on construction, exits on drop.
///
/// Frees issued through a scope are deferred; the blocks become
/// reallocatable only after every participant's reported epoch has passed
/// the epoch current at retirement.
pub struct EpochOp<'a> {
    manager: &'a EpochManager,
    slot: usize,
    epoch: u64,
}

impl<'a> EpochOp<'a> {
    /// Enter an epoch scope, claiming a participant slot.
    ///
    /// Fails with `HeapBusy` if every participant slot is taken.
    pub fn new(manager: &'a EpochManager) -> Result<Self, ErrorCode> {
        let (slot, epoch) = manager.claim_slot()?;
        Ok(Self {
            manager,
            slot,
            epoch,
        })
    }

    /// The epoch this scope entered under.
    pub fn reported_epoch(&self) -> u64 {
        self.epoch
    }

    /// The manager this scope belongs to.
    pub fn manager(&self) -> &EpochManager {
        self.manager
    }
}

impl Drop for EpochOp<'_> {
    fn drop(&mut self) {
        self.manager.release_slot(self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> NvheapConfig {
        NvheapConfig {
            root_dir: dir.path().to_path_buf(),
            log: None,
            // long interval: the tests drive ticks by hand
            epoch_advance_interval: Duration::from_secs(3600),
        }
    }

    #[test]
    fn test_instance_is_shared_per_root() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let a = EpochManager::instance(&config).unwrap();
        let b = EpochManager::instance(&config).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let other_dir = TempDir::new().unwrap();
        let c = EpochManager::instance(&test_config(&other_dir)).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_tick_advances_when_quiescent() {
        let dir = TempDir::new().unwrap();
        let manager = EpochManager::instance(&test_config(&dir)).unwrap();

        let before = manager.current_epoch();
        manager.tick();
        assert_eq!(manager.current_epoch(), before + 1);
    }

    #[test]
    fn test_lagging_scope_blocks_second_advance() {
        let dir = TempDir::new().unwrap();
        let manager = EpochManager::instance(&test_config(&dir)).unwrap();

        let op = EpochOp::new(&manager).unwrap();
        let entered = op.reported_epoch();
        assert_eq!(entered, manager.current_epoch());

        // the scope is at the current epoch, so one advance is allowed
        manager.tick();
        assert_eq!(manager.current_epoch(), entered + 1);
        // but the next one is blocked until the scope exits
        manager.tick();
        assert_eq!(manager.current_epoch(), entered + 1);

        drop(op);
        manager.tick();
        assert_eq!(manager.current_epoch(), entered + 2);
    }

    #[test]
    fn test_nested_scopes_use_distinct_slots() {
        let dir = TempDir::new().unwrap();
        let manager = EpochManager::instance(&test_config(&dir)).unwrap();

        let a = EpochOp::new(&manager).unwrap();
        let b = EpochOp::new(&manager).unwrap();
        assert_ne!(a.slot, b.slot);
        assert_eq!(a.reported_epoch(), b.reported_epoch());
    }

    #[test]
    fn test_drain_targets_called_with_min() {
        struct Recorder(AtomicU64);
        impl RetireTarget for Recorder {
            fn drain_retired(&self, min_reported: u64) {
                self.0.store(min_reported, Ordering::Release);
            }
        }

        let dir = TempDir::new().unwrap();
        let manager = EpochManager::instance(&test_config(&dir)).unwrap();
        let recorder = Arc::new(Recorder(AtomicU64::new(0)));
        let recorder_dyn: Arc<dyn RetireTarget> = recorder.clone();
        let weak: Weak<dyn RetireTarget> = Arc::downgrade(&recorder_dyn);
        drop(recorder_dyn);
        manager.register_target(weak);

        let op = EpochOp::new(&manager).unwrap();
        let entered = op.reported_epoch();
        manager.tick();
        // min reported is the lagging scope's epoch, not the new counter
        assert_eq!(recorder.0.load(Ordering::Acquire), entered);

        drop(op);
        manager.tick();
        assert_eq!(recorder.0.load(Ordering::Acquire), manager.current_epoch() - 1);
    }

    #[test]
    fn test_dead_targets_are_pruned() {
        struct Nop;
        impl RetireTarget for Nop {
            fn drain_retired(&self, _min: u64) {}
        }

        let dir = TempDir::new().unwrap();
        let manager = EpochManager::instance(&test_config(&dir)).unwrap();
        let target: Arc<dyn RetireTarget> = Arc::new(Nop);
        let weak: Weak<dyn RetireTarget> = Arc::downgrade(&target);
        manager.register_target(weak);
        drop(target);
        manager.tick();
        assert!(manager.targets.lock().is_empty());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let manager = EpochManager::instance(&test_config(&dir)).unwrap();
        manager.shutdown();
        manager.shutdown();
    }

    #[test]
    fn test_epoch_survives_manager_restart() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let manager = EpochManager::instance(&config).unwrap();
        manager.tick();
        manager.tick();
        let epoch = manager.current_epoch();
        manager.shutdown();
        drop(manager);

        let manager = EpochManager::instance(&config).unwrap();
        assert_eq!(manager.current_epoch(), epoch);
    }
}
