//! Storage primitives for the quarry debug-information crates.
//!
//! Debug readers build large, heavily cross-referenced graphs out of many
//! small records. The containers in this crate are tuned for that shape:
//!
//! - [`BlockVec`]: a growable vector that stores elements in power-of-two
//!   buckets, so pushing never moves an element that has already been
//!   handed out.
//! - [`Arena`] and [`Handle`]: an append-only typed arena on top of
//!   [`BlockVec`]. Graph edges are plain [`Handle`] indices; the arena is
//!   the only owner and everything is released together when it drops.
//! - [`SparseArray`]: a sorted key → dense-index map with stable element
//!   storage, for sparsely populated id spaces.
//! - [`HashTable`]: a chained, string-keyed hash table that preserves
//!   insertion order among entries sharing a name, so shadowed symbols
//!   stay discoverable in declaration order.

mod arena;
mod hash;
mod sparse;

pub use arena::{Arena, BlockVec, Handle};
pub use hash::HashTable;
pub use sparse::SparseArray;
