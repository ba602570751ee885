//! Generations and the snapshots that pin them.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use uuid::Uuid;

use crate::domain::kits::ContentNodeKit;

use super::map::PersistentMap;

/// One immutable version of a whole content tree.
///
/// Built by the writer, published with a single pointer swap and never
/// mutated afterwards. Its memory is reclaimed when the last `Arc` goes away,
/// i.e. once it is no longer current and every snapshot on it was released.
pub struct Generation {
    number: u64,
    by_id: PersistentMap<i32, Arc<ContentNodeKit>>,
    by_key: PersistentMap<Uuid, i32>,
    readers: AtomicUsize,
    live: Arc<AtomicUsize>,
}

impl Generation {
    pub(super) fn new(
        number: u64,
        by_id: PersistentMap<i32, Arc<ContentNodeKit>>,
        by_key: PersistentMap<Uuid, i32>,
        live: Arc<AtomicUsize>,
    ) -> Self {
        live.fetch_add(1, Ordering::AcqRel);
        Self {
            number,
            by_id,
            by_key,
            readers: AtomicUsize::new(0),
            live,
        }
    }

    pub(super) fn empty(live: Arc<AtomicUsize>) -> Self {
        Self::new(0, PersistentMap::new(), PersistentMap::new(), live)
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Number of snapshots currently pinned to this generation.
    pub fn readers(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    pub fn get_by_id(&self, id: i32) -> Option<&Arc<ContentNodeKit>> {
        self.by_id.get(&id)
    }

    pub fn get_by_key(&self, key: Uuid) -> Option<&Arc<ContentNodeKit>> {
        let id = self.by_key.get(&key)?;
        self.by_id.get(id)
    }

    pub fn kits(&self) -> impl Iterator<Item = &Arc<ContentNodeKit>> {
        self.by_id.values()
    }

    pub(super) fn indexes(
        &self,
    ) -> (
        PersistentMap<i32, Arc<ContentNodeKit>>,
        PersistentMap<Uuid, i32>,
    ) {
        (self.by_id.clone(), self.by_key.clone())
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generation")
            .field("number", &self.number)
            .field("len", &self.by_id.len())
            .field("readers", &self.readers())
            .finish()
    }
}

/// A reader's pinned view of one generation.
///
/// Every read through a snapshot sees the generation that was current when
/// the snapshot was created, however many deltas are applied afterwards.
/// Dropping the snapshot releases it.
pub struct Snapshot {
    generation: Arc<Generation>,
}

impl Snapshot {
    pub(super) fn pin(generation: Arc<Generation>) -> Self {
        generation.readers.fetch_add(1, Ordering::AcqRel);
        Self { generation }
    }

    pub fn generation(&self) -> u64 {
        self.generation.number
    }

    pub fn get_by_id(&self, id: i32) -> Option<Arc<ContentNodeKit>> {
        self.generation.get_by_id(id).cloned()
    }

    pub fn get_by_key(&self, key: Uuid) -> Option<Arc<ContentNodeKit>> {
        self.generation.get_by_key(key).cloned()
    }

    pub fn has_id(&self, id: i32) -> bool {
        self.generation.by_id.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.generation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generation.is_empty()
    }

    pub fn kits(&self) -> impl Iterator<Item = &Arc<ContentNodeKit>> {
        self.generation.kits()
    }

    /// Kits whose path runs through `ancestor_id`, the ancestor included.
    pub fn branch(&self, ancestor_id: i32) -> Vec<Arc<ContentNodeKit>> {
        self.kits()
            .filter(|kit| kit.node.is_in_branch(ancestor_id))
            .cloned()
            .collect()
    }
}

impl Clone for Snapshot {
    fn clone(&self) -> Self {
        Self::pin(Arc::clone(&self.generation))
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.generation.readers.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Snapshot")
            .field(&self.generation.number)
            .finish()
    }
}
