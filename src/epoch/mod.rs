//! Epoch-based delayed reclamation
//!
//! Frees issued inside an epoch scope are not returned to the zone
//! immediately; they are retired into a per-shelf persistent bag tagged with
//! the epoch current at retirement, and a background advancer hands them
//! back to the allocator once every registered participant has reported an
//! epoch past that value.

pub(crate) mod epoch_shelf;
pub(crate) mod manager;
pub(crate) mod retire;

pub use manager::{EpochManager, EpochOp};
pub(crate) use manager::RetireTarget;
pub(crate) use retire::RetireRing;

/// Reported-epoch value meaning "no scope active in this slot".
pub(crate) const INACTIVE: u64 = 0;
