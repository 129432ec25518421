//! nvheap - a persistent-memory heap manager
//!
//! Applications request named heaps identified by a small integer pool id and
//! allocate variable-size regions within them, receiving [`GlobalPtr`]s that
//! stay valid across process restarts and are translatable to local addresses
//! through memory mapping. A heap spans one or more power-of-two-sized
//! backing files ("shelves"); each shelf is managed by a buddy allocator with
//! a persistent free-bit hierarchy, and frees issued inside an epoch scope
//! are deferred until every concurrent reader has moved past the epoch they
//! were issued under.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use nvheap::{EpochOp, EpochZoneHeap, NvheapConfig};
//!
//! let config = NvheapConfig::load_from_env()?;
//! EpochZoneHeap::create(1, 128 * nvheap::size::MIB, &config)?;
//!
//! let mut heap = EpochZoneHeap::new(1, config)?;
//! heap.open()?;
//!
//! let ptr = heap.alloc(64);
//! heap.free(ptr)?;
//!
//! // deferred free under an epoch scope
//! let em = heap.epoch_manager();
//! {
//!     let op = EpochOp::new(&em)?;
//!     let ptr = heap.alloc_in(&op, 64);
//!     heap.free_deferred(&op, ptr)?;
//! }
//! ```

#![warn(missing_docs)]
#![allow(dead_code)]

pub mod config;
pub mod epoch;
pub mod error;
pub mod fam;
pub mod global_ptr;
pub mod heap;
pub mod shelf;
pub mod zone;
mod utility;

// Re-exports for convenience
pub use config::NvheapConfig;
pub use epoch::{EpochManager, EpochOp};
pub use error::ErrorCode;
pub use global_ptr::{GlobalPtr, Offset, PoolId};
pub use heap::{EpochZoneHeap, HeapOptions};

/// Constants used throughout the library
pub mod constants {
    /// Size of a cache line in bytes
    pub const CACHE_LINE_BYTES: usize = 64;

    /// Shelf-format magic number ("NVMMSHEL")
    pub const SHELF_MAGIC: u64 = 0x4e56_4d4d_5348_454c;

    /// Epoch-shelf magic number ("NVMMEPOC")
    pub const EPOCH_MAGIC: u64 = 0x4e56_4d4d_4550_4f43;

    /// Heap-header magic number ("NVMMHEAP")
    pub const HEAP_MAGIC: u64 = 0x4e56_4d4d_4845_4150;

    /// Persistent format version
    pub const FORMAT_VERSION: u64 = 1;

    /// Maximum number of shelves per heap, including the reserved header
    /// shelf at index 0
    pub const MAX_SHELF_COUNT: usize = 128;

    /// Maximum number of concurrently registered epoch participants
    pub const MAX_PARTICIPANTS: usize = 1024;

    /// Largest valid pool id (pool ids are 14 bits on the wire)
    pub const MAX_POOL_ID: u16 = (1 << 14) - 1;

    /// Default minimum allocation size in bytes
    pub const DEFAULT_MIN_ALLOC: u64 = 128;

    /// Smallest permitted minimum allocation size (one cache line)
    pub const MIN_MIN_ALLOC: u64 = 64;

    /// Default permission mode for newly created backing files
    pub const DEFAULT_MODE: u32 = 0o660;
}

/// Utility for size literals (e.g., 1_GiB)
pub mod size {
    /// 1 KiB in bytes
    pub const KIB: u64 = 1024;
    /// 1 MiB in bytes
    pub const MIB: u64 = 1024 * KIB;
    /// 1 GiB in bytes
    pub const GIB: u64 = 1024 * MIB;
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::config::NvheapConfig;
    pub use crate::epoch::{EpochManager, EpochOp};
    pub use crate::error::ErrorCode;
    pub use crate::global_ptr::{GlobalPtr, Offset, PoolId};
    pub use crate::heap::{EpochZoneHeap, HeapOptions};
}
