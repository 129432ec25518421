//! Shelf backing files
//!
//! A shelf is one power-of-two-sized backing file mapped shared into the
//! process. This module owns the file lifecycle (create / open / close /
//! destroy), the mapping, permission changes, and the magic-number
//! verification that guards against foreign or half-created files.

mod shelf_file;

pub(crate) use shelf_file::{Mapping, ShelfFile};
