//! Generational snapshot store for published content.
//!
//! - `map`: persistent hash trie the generation indexes are built from
//! - `generation`: immutable generations and reader snapshots
//! - `store`: the single-writer, lock-free-reader store

mod generation;
mod map;
mod store;

pub use generation::{Generation, Snapshot};
pub use map::{Iter, PersistentMap};
pub use store::{KitChange, SnapshotContentStore};
