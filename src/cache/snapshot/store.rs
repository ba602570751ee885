//! MVCC content store.
//!
//! Readers load the current generation with a single atomic pointer read and
//! never take a lock. Writers are serialized by a mutex, build the next
//! generation as a structural copy of the current one plus a delta, then
//! publish it with one pointer swap.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use arc_swap::ArcSwap;
use metrics::{gauge, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::config::CacheConfig;
use crate::cache::error::SeedError;
use crate::cache::lock::mutex_lock;
use crate::domain::kits::ContentNodeKit;
use crate::domain::types::ContentKind;

use super::generation::{Generation, Snapshot};
use super::map::PersistentMap;

const SOURCE: &str = "cache::snapshot::store";
const METRIC_GENERATIONS_LIVE: &str = "pubcache_snapshot_generations_live";
const METRIC_APPLY_MS: &str = "pubcache_snapshot_apply_ms";

/// One entry of a delta applied to the store.
#[derive(Debug, Clone)]
pub enum KitChange {
    /// Insert or replace the kit under its id.
    Upsert(Arc<ContentNodeKit>),
    /// Tombstone: drop the kit with this id, if present.
    Remove(i32),
}

impl KitChange {
    /// Insert or replace `kit`, taking ownership.
    ///
    /// Readers share the kit through the store, so it is wrapped in an `Arc`
    /// once here.
    pub fn upsert(kit: ContentNodeKit) -> Self {
        Self::Upsert(Arc::new(kit))
    }

    /// Node id the change applies to.
    pub fn id(&self) -> i32 {
        match self {
            Self::Upsert(kit) => kit.id(),
            Self::Remove(id) => *id,
        }
    }
}

/// In-memory published cache for one content tree.
pub struct SnapshotContentStore {
    kind: ContentKind,
    current: ArcSwap<Generation>,
    writer: Mutex<()>,
    seeded: AtomicBool,
    live: Arc<AtomicUsize>,
    generation_warn_threshold: usize,
    seed_cancel_check_every: usize,
}

impl SnapshotContentStore {
    /// An empty, unseeded store.
    ///
    /// Readers get nothing until `seed` publishes the first generation.
    pub fn new(kind: ContentKind, config: &CacheConfig) -> Self {
        let live = Arc::new(AtomicUsize::new(0));
        let current = ArcSwap::from_pointee(Generation::empty(Arc::clone(&live)));
        Self {
            kind,
            current,
            writer: Mutex::new(()),
            seeded: AtomicBool::new(false),
            live,
            generation_warn_threshold: config.generation_warn_threshold,
            seed_cancel_check_every: config.seed_cancel_check_every_non_zero().get(),
        }
    }

    pub fn kind(&self) -> ContentKind {
        self.kind
    }

    /// Whether a seed completed since the store was created or last reset.
    pub fn is_seeded(&self) -> bool {
        self.seeded.load(Ordering::Acquire)
    }

    /// Number of the current generation.
    pub fn generation(&self) -> u64 {
        self.current.load().number()
    }

    /// Generations still alive in memory, the current one included.
    pub fn live_generations(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.load().is_empty()
    }

    /// Pin the caller to the current generation.
    pub fn create_snapshot(&self) -> Snapshot {
        Snapshot::pin(self.current.load_full())
    }

    /// Release a snapshot. Equivalent to dropping it.
    pub fn release(&self, snapshot: Snapshot) {
        drop(snapshot);
    }

    /// Read against the current generation without pinning it.
    pub fn get_by_id(&self, id: i32) -> Option<Arc<ContentNodeKit>> {
        self.current.load().get_by_id(id).cloned()
    }

    /// Like `get_by_id`, by node key.
    pub fn get_by_key(&self, key: Uuid) -> Option<Arc<ContentNodeKit>> {
        self.current.load().get_by_key(key).cloned()
    }

    /// Replace the whole tree with `kits`.
    ///
    /// Publishes a fresh generation only when the iterator is fully consumed.
    /// On cancellation nothing is published and the store stays unseeded, so
    /// callers fall through to the primary source. Seeding again with the same
    /// kits yields the same contents.
    pub fn seed<I>(&self, kits: I, cancel: &CancellationToken) -> Result<usize, SeedError>
    where
        I: IntoIterator<Item = ContentNodeKit>,
    {
        let _writer = mutex_lock(&self.writer, SOURCE, "seed");
        self.seeded.store(false, Ordering::Release);

        let mut by_id = PersistentMap::new();
        let mut by_key = PersistentMap::new();
        for (loaded, kit) in kits.into_iter().enumerate() {
            if loaded % self.seed_cancel_check_every == 0 && cancel.is_cancelled() {
                info!(kind = %self.kind, loaded, "Seed cancelled; store left unseeded");
                return Err(SeedError::Cancelled);
            }
            by_key.insert(kit.key(), kit.id());
            by_id.insert(kit.id(), Arc::new(kit));
        }
        if cancel.is_cancelled() {
            info!(kind = %self.kind, "Seed cancelled; store left unseeded");
            return Err(SeedError::Cancelled);
        }

        let count = by_id.len();
        let number = self.current.load().number() + 1;
        self.publish(Generation::new(number, by_id, by_key, Arc::clone(&self.live)));
        self.seeded.store(true, Ordering::Release);
        info!(kind = %self.kind, generation = number, count, "Snapshot store seeded");
        Ok(count)
    }

    /// Apply a delta and publish the resulting generation.
    ///
    /// Returns the number of the generation now current. An empty delta
    /// publishes nothing.
    pub fn apply_delta(&self, changes: Vec<KitChange>) -> u64 {
        let started_at = Instant::now();
        let _writer = mutex_lock(&self.writer, SOURCE, "apply_delta");

        let base = self.current.load_full();
        if changes.is_empty() {
            return base.number();
        }
        let (mut by_id, mut by_key) = base.indexes();
        let mut upserted = 0usize;
        let mut removed = 0usize;
        for change in changes {
            match change {
                KitChange::Upsert(kit) => {
                    if let Some(previous) = by_id.insert(kit.id(), Arc::clone(&kit))
                        && previous.key() != kit.key()
                    {
                        by_key.remove(&previous.key());
                    }
                    by_key.insert(kit.key(), kit.id());
                    upserted += 1;
                }
                KitChange::Remove(id) => {
                    if let Some(previous) = by_id.remove(&id) {
                        by_key.remove(&previous.key());
                        removed += 1;
                    }
                }
            }
        }

        let number = base.number() + 1;
        drop(base);
        self.publish(Generation::new(number, by_id, by_key, Arc::clone(&self.live)));

        histogram!(METRIC_APPLY_MS, "kind" => self.kind.as_str())
            .record(started_at.elapsed().as_secs_f64() * 1000.0);
        debug!(
            kind = %self.kind,
            generation = number,
            upserted,
            removed,
            "Published generation"
        );
        number
    }

    /// Drop every kit and mark the store unseeded.
    pub fn reset(&self) {
        let _writer = mutex_lock(&self.writer, SOURCE, "reset");
        self.seeded.store(false, Ordering::Release);
        let number = self.current.load().number() + 1;
        self.publish(Generation::new(
            number,
            PersistentMap::new(),
            PersistentMap::new(),
            Arc::clone(&self.live),
        ));
    }

    fn publish(&self, next: Generation) {
        self.current.store(Arc::new(next));
        let live = self.live_generations();
        gauge!(METRIC_GENERATIONS_LIVE, "kind" => self.kind.as_str()).set(live as f64);
        if live > self.generation_warn_threshold {
            warn!(
                kind = %self.kind,
                live,
                threshold = self.generation_warn_threshold,
                "Live generation count above threshold; long-lived snapshots are pinning memory"
            );
        }
    }
}
