//! Multi-shelf heap
//!
//! An [`EpochZoneHeap`] routes allocations across a growable sequence of
//! shelves, each managed by its own zone. Shelf 1 is created with the heap;
//! `resize` appends further power-of-two shelves up to the shelf-count
//! ceiling. A small header shelf at index 0 holds the heap's persistent
//! identity: pool id, minimum allocation size, permission mode, and the
//! published shelf table that makes resizes visible to every open handle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::config::NvheapConfig;
use crate::constants::{
    DEFAULT_MIN_ALLOC, DEFAULT_MODE, FORMAT_VERSION, HEAP_MAGIC, MAX_POOL_ID, MAX_SHELF_COUNT,
    MIN_MIN_ALLOC, SHELF_MAGIC,
};
use crate::epoch::{EpochManager, EpochOp, RetireRing, RetireTarget};
use crate::epoch::manager::pid_alive;
use crate::error::ErrorCode;
use crate::fam;
use crate::global_ptr::{GlobalPtr, Offset, PoolId};
use crate::shelf::ShelfFile;
use crate::zone::Zone;
use crate::epoch::retire::RetiredBlock;

/// Size of the header shelf file at index 0.
const HEADER_SHELF_SIZE: u64 = 4096;

/// Largest single shelf: a `GlobalPtr` offset is 48 bits.
const MAX_SHELF_SIZE: u64 = 1 << 48;

// word offsets within the header shelf (bytes)
const HDR_VERSION: usize = 8;
const HDR_POOL_ID: usize = 16;
const HDR_MIN_ALLOC: usize = 24;
const HDR_MODE: usize = 32;
const HDR_SHELF_COUNT: usize = 40;
const HDR_SHELF_SIZES: usize = 64;

/// Heap creation options beyond pool id and size.
#[derive(Debug, Clone, Copy)]
pub struct HeapOptions {
    /// Minimum allocation size; a power of two >= 64.
    pub min_alloc: u64,
    /// Permission mode for the backing files.
    pub mode: u32,
}

impl Default for HeapOptions {
    fn default() -> Self {
        Self {
            min_alloc: DEFAULT_MIN_ALLOC,
            mode: DEFAULT_MODE,
        }
    }
}

// ---- process-local registry: open-handle counts and the metadata-op flag --

#[derive(Default)]
struct RegistryEntry {
    open_handles: usize,
    busy: bool,
}

static REGISTRY: OnceLock<Mutex<HashMap<(PathBuf, PoolId), RegistryEntry>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<(PathBuf, PoolId), RegistryEntry>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// RAII claim on a heap's metadata-operation flag.
struct BusyGuard {
    key: (PathBuf, PoolId),
}

impl BusyGuard {
    fn claim(key: (PathBuf, PoolId)) -> Result<Self, ErrorCode> {
        let mut map = registry().lock();
        let entry = map.entry(key.clone()).or_default();
        if entry.busy {
            return Err(ErrorCode::HeapBusy);
        }
        entry.busy = true;
        Ok(Self { key })
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let mut map = registry().lock();
        let drop_entry = match map.get_mut(&self.key) {
            Some(entry) => {
                entry.busy = false;
                entry.open_handles == 0
            }
            None => false,
        };
        if drop_entry {
            map.remove(&self.key);
        }
    }
}

// ---- shelves ---------------------------------------------------------------

/// One mapped data shelf: its file, its zone, and its retire bag.
struct DataShelf {
    index: u16,
    file: ShelfFile,
    zone: Zone,
    ring: RetireRing,
}

impl DataShelf {
    fn open(path: &Path, index: u16) -> Result<Self, ErrorCode> {
        let file = ShelfFile::open(path, SHELF_MAGIC).map_err(|_| ErrorCode::HeapOpenFailed)?;
        // SAFETY: the mapping is live and was formatted by `create_shelf`.
        let zone = unsafe { Zone::open(file.base(), file.len())? };
        let ring = unsafe { RetireRing::new(file.base(), zone.layout()) };
        Ok(Self {
            index,
            file,
            zone,
            ring,
        })
    }
}

/// Create and format a new data shelf file, leaving it closed.
fn create_shelf(path: &Path, size: u64, min_alloc: u64, mode: u32) -> Result<(), ErrorCode> {
    let file = ShelfFile::create(path, size, mode).map_err(|e| {
        error!(path = %path.display(), %e, "shelf creation failed");
        if e.kind() == std::io::ErrorKind::AlreadyExists {
            ErrorCode::HeapResizeFailed
        } else {
            ErrorCode::HeapCreateFailed
        }
    })?;
    // SAFETY: freshly created mapping, zero-filled, not yet shared.
    unsafe { Zone::format(file.base(), size, min_alloc) };
    file.write_magic(SHELF_MAGIC);
    Ok(())
}

// ---- heap ------------------------------------------------------------------

struct HeapInner {
    pool_id: PoolId,
    config: NvheapConfig,
    header: ShelfFile,
    shelves: RwLock<Vec<Arc<DataShelf>>>,
    em: Arc<EpochManager>,
}

impl HeapInner {
    #[inline]
    fn header_word(&self, off: usize) -> u64 {
        // SAFETY: all header offsets are inside the fixed-size mapping.
        unsafe { fam::load64(self.header.base().add(off).cast()) }
    }

    #[inline]
    fn store_header_word(&self, off: usize, value: u64) {
        // SAFETY: see header_word.
        unsafe {
            fam::store64(self.header.base().add(off).cast(), value);
            fam::persist(self.header.base().add(off), 8);
        }
    }

    fn shelf_count(&self) -> u64 {
        self.header_word(HDR_SHELF_COUNT)
    }

    fn publish_shelf(&self, index: u16, size: u64) -> Result<(), ErrorCode> {
        self.store_header_word(HDR_SHELF_SIZES + index as usize * 8, size);
        let old = index as u64 - 1;
        // SAFETY: the shelf-count word is inside the mapping.
        let prev = unsafe {
            fam::cas64(
                self.header.base().add(HDR_SHELF_COUNT).cast(),
                old,
                index as u64,
            )
        };
        if prev != old {
            error!(index, prev, "concurrent shelf publication clashed");
            return Err(ErrorCode::HeapResizeFailed);
        }
        unsafe { fam::persist(self.header.base().add(HDR_SHELF_COUNT), 8) };
        Ok(())
    }

    fn shelf_size(&self, index: u16) -> u64 {
        self.header_word(HDR_SHELF_SIZES + index as usize * 8)
    }

    fn min_alloc(&self) -> u64 {
        self.header_word(HDR_MIN_ALLOC)
    }

    fn mode(&self) -> u32 {
        self.header_word(HDR_MODE) as u32
    }

    fn total_size(&self) -> u64 {
        let count = self.shelf_count();
        (1..=count as u16).map(|i| self.shelf_size(i)).sum()
    }

    fn shelf_path(&self, index: u16) -> PathBuf {
        heap_file_path(&self.config.root_dir, self.pool_id, index)
    }

    /// Map any shelves published since this handle last looked.
    fn refresh_shelves(&self) -> Result<(), ErrorCode> {
        let count = self.shelf_count() as usize;
        if self.shelves.read().len() >= count {
            return Ok(());
        }
        let mut shelves = self.shelves.write();
        while shelves.len() < count {
            let index = shelves.len() as u16 + 1;
            let shelf = DataShelf::open(&self.shelf_path(index), index)?;
            shelves.push(Arc::new(shelf));
        }
        Ok(())
    }

    /// Find a mapped shelf by index, mapping fresh publications on demand.
    fn shelf(&self, index: u16) -> Result<Arc<DataShelf>, ErrorCode> {
        if index == 0 {
            return Err(ErrorCode::InvalidPtr);
        }
        {
            let shelves = self.shelves.read();
            if let Some(shelf) = shelves.get(index as usize - 1) {
                return Ok(Arc::clone(shelf));
            }
        }
        self.refresh_shelves()?;
        self.shelves
            .read()
            .get(index as usize - 1)
            .cloned()
            .ok_or(ErrorCode::InvalidPtr)
    }

    /// Allocate from the most recently added shelf first, walking backwards.
    fn alloc(&self, size: u64) -> GlobalPtr {
        if let Err(e) = self.refresh_shelves() {
            warn!(pool_id = self.pool_id, %e, "shelf refresh failed; allocating from known shelves");
        }
        let shelves = self.shelves.read();
        for shelf in shelves.iter().rev() {
            let offset = shelf.zone.alloc(size);
            if offset != 0 {
                return GlobalPtr::new(shelf.index, offset);
            }
        }
        GlobalPtr::NULL
    }
}

impl RetireTarget for HeapInner {
    fn drain_retired(&self, min_reported: u64) {
        let shelves: Vec<Arc<DataShelf>> = self.shelves.read().clone();
        for shelf in shelves {
            shelf.ring.break_stale_lock(pid_alive);
            shelf.ring.drain(min_reported, |offset, size| {
                if let Err(e) = shelf.zone.free_sized(offset, size) {
                    warn!(
                        shelf = shelf.index,
                        offset, size, %e,
                        "dropping corrupt retire entry"
                    );
                }
            });
        }
    }
}

fn heap_file_path(root: &Path, pool_id: PoolId, shelf_index: u16) -> PathBuf {
    root.join(format!("{pool_id}.{shelf_index}"))
}

fn validate_pool_id(pool_id: PoolId) -> Result<(), ErrorCode> {
    if pool_id == 0 || pool_id > MAX_POOL_ID {
        return Err(ErrorCode::InvalidArguments);
    }
    Ok(())
}

/// A handle to a persistent heap.
///
/// Handles move through `Closed <-> Opened`; every operation except
/// `open`/`close` and the associated create/destroy functions requires the
/// handle to be open. Multiple handles (in this or other processes) may
/// have the same heap open concurrently; they synchronize exclusively
/// through the persistent shelf state.
pub struct EpochZoneHeap {
    pool_id: PoolId,
    config: NvheapConfig,
    inner: Option<Arc<HeapInner>>,
}

impl EpochZoneHeap {
    /// Create a heap with default options (128-byte minimum allocation,
    /// mode 0660).
    pub fn create(pool_id: PoolId, size: u64, config: &NvheapConfig) -> Result<(), ErrorCode> {
        Self::create_with(pool_id, size, HeapOptions::default(), config)
    }

    /// Create a heap with explicit options.
    ///
    /// The initial shelf is `size` rounded up to a power of two of at least
    /// `min_alloc * 64` bytes. Fails with `IdFound` if the pool id is
    /// already in use in this root directory.
    pub fn create_with(
        pool_id: PoolId,
        size: u64,
        options: HeapOptions,
        config: &NvheapConfig,
    ) -> Result<(), ErrorCode> {
        validate_pool_id(pool_id)?;
        if !options.min_alloc.is_power_of_two()
            || options.min_alloc < MIN_MIN_ALLOC
            || options.min_alloc > MAX_SHELF_SIZE / 64
            || size == 0
            || size > MAX_SHELF_SIZE
        {
            return Err(ErrorCode::InvalidArguments);
        }

        let header_path = heap_file_path(&config.root_dir, pool_id, 0);
        if ShelfFile::exists(&header_path) {
            return Err(ErrorCode::IdFound);
        }

        let shelf_size = size.max(options.min_alloc * 64).next_power_of_two();

        let header = ShelfFile::create(&header_path, HEADER_SHELF_SIZE, options.mode)
            .map_err(|_| ErrorCode::HeapCreateFailed)?;
        // SAFETY: all header words are inside the fresh zeroed mapping.
        unsafe {
            let base = header.base();
            fam::store64(base.add(HDR_VERSION).cast(), FORMAT_VERSION);
            fam::store64(base.add(HDR_POOL_ID).cast(), pool_id as u64);
            fam::store64(base.add(HDR_MIN_ALLOC).cast(), options.min_alloc);
            fam::store64(base.add(HDR_MODE).cast(), options.mode as u64);
            fam::store64(base.add(HDR_SHELF_SIZES + 8).cast(), shelf_size);
            fam::store64(base.add(HDR_SHELF_COUNT).cast(), 1);
            fam::persist(base, HDR_SHELF_SIZES + 16);
        }

        let shelf_path = heap_file_path(&config.root_dir, pool_id, 1);
        if create_shelf(&shelf_path, shelf_size, options.min_alloc, options.mode).is_err() {
            let _ = ShelfFile::destroy(&header_path);
            return Err(ErrorCode::HeapCreateFailed);
        }

        // the header magic lands last: a crash before this point leaves a
        // heap that fails open and can be re-created
        header.write_magic(HEAP_MAGIC);
        debug!(pool_id, shelf_size, "created heap");
        Ok(())
    }

    /// Whether a heap with this pool id exists in the configured root.
    pub fn exists(pool_id: PoolId, config: &NvheapConfig) -> bool {
        ShelfFile::exists(heap_file_path(&config.root_dir, pool_id, 0))
    }

    /// Destroy a heap, removing all its backing files.
    ///
    /// Fails with `HeapIsOpen` while any handle in this process has the
    /// heap open; remote processes holding it open will see I/O errors on
    /// their next access.
    pub fn destroy(pool_id: PoolId, config: &NvheapConfig) -> Result<(), ErrorCode> {
        validate_pool_id(pool_id)?;
        let header_path = heap_file_path(&config.root_dir, pool_id, 0);
        if !ShelfFile::exists(&header_path) {
            return Err(ErrorCode::IdNotFound);
        }

        let key = (config.root_dir.clone(), pool_id);
        if registry().lock().get(&key).is_some_and(|e| e.open_handles > 0) {
            return Err(ErrorCode::HeapIsOpen);
        }
        let _busy = BusyGuard::claim(key)?;

        for index in 1..MAX_SHELF_COUNT as u16 {
            let path = heap_file_path(&config.root_dir, pool_id, index);
            if ShelfFile::exists(&path) {
                ShelfFile::destroy(&path).map_err(|_| ErrorCode::HeapDestroyFailed)?;
            }
        }
        ShelfFile::destroy(&header_path).map_err(|_| ErrorCode::HeapDestroyFailed)?;
        debug!(pool_id, "destroyed heap");
        Ok(())
    }

    /// Construct a closed handle for `pool_id`.
    pub fn new(pool_id: PoolId, config: NvheapConfig) -> Self {
        Self {
            pool_id,
            config,
            inner: None,
        }
    }

    /// The pool id this handle names.
    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    /// Whether this handle is open.
    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    /// Open the heap: map the header and every published shelf, and
    /// register with the epoch manager.
    pub fn open(&mut self) -> Result<(), ErrorCode> {
        if self.inner.is_some() {
            return Err(ErrorCode::HeapOpened);
        }
        validate_pool_id(self.pool_id)?;

        let header_path = heap_file_path(&self.config.root_dir, self.pool_id, 0);
        if !ShelfFile::exists(&header_path) {
            return Err(ErrorCode::IdNotFound);
        }
        let header =
            ShelfFile::open(&header_path, HEAP_MAGIC).map_err(|_| ErrorCode::HeapOpenFailed)?;

        let em = EpochManager::instance(&self.config)?;
        let inner = Arc::new(HeapInner {
            pool_id: self.pool_id,
            config: self.config.clone(),
            header,
            shelves: RwLock::new(Vec::new()),
            em,
        });
        if inner.header_word(HDR_POOL_ID) != self.pool_id as u64 {
            error!(pool_id = self.pool_id, "heap header names a different pool");
            return Err(ErrorCode::HeapOpenFailed);
        }
        inner.refresh_shelves()?;

        let inner_dyn: Arc<dyn RetireTarget> = inner.clone();
        let target: Weak<dyn RetireTarget> = Arc::downgrade(&inner_dyn);
        inner.em.register_target(target);

        registry()
            .lock()
            .entry((self.config.root_dir.clone(), self.pool_id))
            .or_default()
            .open_handles += 1;

        self.inner = Some(inner);
        Ok(())
    }

    /// Close the heap: unregister the atomic regions and unmap everything.
    pub fn close(&mut self) -> Result<(), ErrorCode> {
        if self.inner.take().is_none() {
            return Err(ErrorCode::HeapClosed);
        }
        let key = (self.config.root_dir.clone(), self.pool_id);
        let mut map = registry().lock();
        let drop_entry = match map.get_mut(&key) {
            Some(entry) => {
                entry.open_handles = entry.open_handles.saturating_sub(1);
                entry.open_handles == 0 && !entry.busy
            }
            None => false,
        };
        if drop_entry {
            map.remove(&key);
        }
        Ok(())
    }

    fn inner(&self) -> Result<&Arc<HeapInner>, ErrorCode> {
        self.inner.as_ref().ok_or(ErrorCode::HeapNotOpen)
    }

    /// Allocate at least `size` bytes. Returns the null pointer when the
    /// heap cannot satisfy the request (or the handle is closed).
    pub fn alloc(&self, size: u64) -> GlobalPtr {
        match self.inner() {
            Ok(inner) => inner.alloc(size),
            Err(_) => GlobalPtr::NULL,
        }
    }

    /// Allocate inside an epoch scope. Identical to [`EpochZoneHeap::alloc`]
    /// for the allocation itself; the scope matters only for frees.
    pub fn alloc_in(&self, _op: &EpochOp<'_>, size: u64) -> GlobalPtr {
        self.alloc(size)
    }

    /// Free a block immediately.
    pub fn free(&self, ptr: GlobalPtr) -> Result<(), ErrorCode> {
        let inner = self.inner()?;
        if ptr.is_null() {
            return Err(ErrorCode::InvalidArguments);
        }
        let shelf = inner.shelf(ptr.shelf_index())?;
        shelf.zone.free_at(ptr.offset())?;
        Ok(())
    }

    /// Retire a block under an epoch scope. The zone free happens in the
    /// background once every participant has moved past the current epoch.
    pub fn free_deferred(&self, op: &EpochOp<'_>, ptr: GlobalPtr) -> Result<(), ErrorCode> {
        let inner = self.inner()?;
        if ptr.is_null() {
            return Err(ErrorCode::InvalidArguments);
        }
        let shelf = inner.shelf(ptr.shelf_index())?;
        let size = shelf.zone.block_size_at(ptr.offset())?;
        shelf.ring.append(RetiredBlock {
            offset: ptr.offset(),
            size,
            epoch: op.manager().current_epoch(),
        });
        Ok(())
    }

    /// Allocate and return the block as a raw [`Offset`], the convention
    /// used by clients that treat the first data shelf as index 0. Returns
    /// 0 on exhaustion.
    pub fn alloc_offset(&self, size: u64) -> Offset {
        self.alloc(size).to_offset().unwrap_or(0)
    }

    /// Free a block previously returned by [`EpochZoneHeap::alloc_offset`].
    pub fn free_offset(&self, offset: Offset) -> Result<(), ErrorCode> {
        if offset == 0 || GlobalPtr::from_raw(offset).shelf_index() == u16::MAX {
            return Err(ErrorCode::InvalidArguments);
        }
        self.free(GlobalPtr::from_offset(offset))
    }

    /// Grow the heap to at least `new_size` bytes by appending shelves.
    ///
    /// A `new_size` at or below the current size is a no-op. Newly added
    /// shelves become visible to other open handles on their next
    /// allocation.
    pub fn resize(&self, new_size: u64) -> Result<(), ErrorCode> {
        let inner = self.inner()?;
        let _busy = BusyGuard::claim((self.config.root_dir.clone(), self.pool_id))?;

        inner.refresh_shelves()?;
        let min_alloc = inner.min_alloc();
        let mode = inner.mode();
        let mut total = inner.total_size();

        while total < new_size {
            let next_index = inner.shelf_count() + 1;
            if next_index >= MAX_SHELF_COUNT as u64 {
                warn!(pool_id = self.pool_id, "shelf-index space exhausted");
                return Err(ErrorCode::HeapResizeFailed);
            }
            let next_index = next_index as u16;
            let delta = (new_size - total)
                .max(min_alloc * 64)
                .checked_next_power_of_two()
                .unwrap_or(MAX_SHELF_SIZE)
                .min(MAX_SHELF_SIZE);

            if create_shelf(&inner.shelf_path(next_index), delta, min_alloc, mode).is_err() {
                // another process may have grabbed this index; if the heap
                // grew underneath us, fold that in and keep going
                let grown = inner.total_size();
                if grown > total {
                    total = grown;
                    continue;
                }
                return Err(ErrorCode::HeapResizeFailed);
            }
            inner.publish_shelf(next_index, delta)?;
            total += delta;
            debug!(pool_id = self.pool_id, shelf = next_index, size = delta, "appended shelf");
        }
        Ok(())
    }

    /// Coalesce deferred buddy pairs on every shelf.
    pub fn merge(&self) -> Result<(), ErrorCode> {
        let inner = self.inner()?;
        inner.refresh_shelves()?;
        for shelf in inner.shelves.read().iter() {
            shelf.zone.merge();
        }
        Ok(())
    }

    /// Total heap size: the sum of all published shelf sizes.
    pub fn size(&self) -> u64 {
        match self.inner() {
            Ok(inner) => inner.total_size(),
            Err(_) => 0,
        }
    }

    /// The heap's minimum allocation size.
    pub fn min_alloc_size(&self) -> Result<u64, ErrorCode> {
        Ok(self.inner()?.min_alloc())
    }

    /// Read the permission mode of the backing files.
    pub fn get_permission(&self) -> Result<u32, ErrorCode> {
        let inner = self.inner()?;
        inner
            .header
            .mode()
            .map_err(|_| ErrorCode::HeapGetPermissionFailed)
    }

    /// Set the permission mode on every backing file. Affects only future
    /// opens, not existing mappings.
    pub fn set_permission(&self, mode: u32) -> Result<(), ErrorCode> {
        let inner = self.inner()?;
        inner.refresh_shelves()?;

        inner
            .header
            .set_mode(mode)
            .map_err(|_| ErrorCode::HeapSetPermissionFailed)?;
        for shelf in inner.shelves.read().iter() {
            shelf
                .file
                .set_mode(mode)
                .map_err(|_| ErrorCode::HeapSetPermissionFailed)?;
        }
        inner.store_header_word(HDR_MODE, mode as u64);
        Ok(())
    }

    /// Size class actually backing an allocated pointer.
    pub fn usable_size(&self, ptr: GlobalPtr) -> Result<u64, ErrorCode> {
        let inner = self.inner()?;
        if ptr.is_null() {
            return Err(ErrorCode::InvalidArguments);
        }
        inner.shelf(ptr.shelf_index())?.zone.block_size_at(ptr.offset())
    }

    /// Translate a pointer owned by this heap into a local address.
    pub fn global_to_local(&self, ptr: GlobalPtr) -> Result<*mut u8, ErrorCode> {
        let inner = self.inner()?;
        if ptr.is_null() {
            return Err(ErrorCode::InvalidArguments);
        }
        let shelf = inner.shelf(ptr.shelf_index())?;
        if ptr.offset() >= shelf.file.len() {
            return Err(ErrorCode::InvalidPtr);
        }
        // SAFETY: offset is inside the shelf's mapping.
        Ok(unsafe { shelf.file.base().add(ptr.offset() as usize) })
    }

    /// The epoch manager governing this heap's deferred frees.
    pub fn epoch_manager(&self) -> Result<Arc<EpochManager>, ErrorCode> {
        Ok(Arc::clone(&self.inner()?.em))
    }
}

impl Drop for EpochZoneHeap {
    fn drop(&mut self) {
        if self.inner.is_some() {
            let _ = self.close();
        }
    }
}
