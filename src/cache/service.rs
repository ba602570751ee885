//! Document and media cache services.
//!
//! `PublishedCacheService` owns one tree: its snapshot store, its optional
//! local store and the primary source it falls back to. The document and
//! media services wrap it and hand out `PublishedContent` read views.
//!
//! Cache work only happens at runtime levels `Run` and `Upgrade`. Until a
//! seed completes, reads fall through to the primary source.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::application::repos::ContentSource;
use crate::domain::entities::ContentEntity;
use crate::domain::kits::ContentNodeKit;
use crate::domain::types::{ContentKind, RuntimeLevel, RuntimeState};

use super::elements::ElementsCache;
use super::error::{CacheServiceError, SeedError, StoreError};
use super::persistent::PersistentKeyStore;
use super::published::{ContentTypeCache, PropertyValueResolver, PublishedContent};
use super::snapshot::{KitChange, Snapshot, SnapshotContentStore};

const METRIC_SEED_MS: &str = "pubcache_seed_ms";

/// How a seed or rebuild ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOutcome {
    /// The runtime level does not allow cache work.
    Skipped { level: RuntimeLevel },
    FromLocalStore { count: usize },
    FromSource { count: usize },
    /// Cancelled before completion; the store is left unseeded.
    Cancelled,
}

/// Cache service for one content tree.
pub struct PublishedCacheService {
    kind: ContentKind,
    store: Arc<SnapshotContentStore>,
    local: Option<Arc<PersistentKeyStore>>,
    source: Arc<dyn ContentSource>,
    runtime: Arc<RuntimeState>,
    // Serializes seeds and rebuilds.
    seeding: Mutex<()>,
    // Keeps local store writes in generation order.
    writes: Mutex<()>,
}

impl PublishedCacheService {
    pub fn new(
        store: Arc<SnapshotContentStore>,
        local: Option<Arc<PersistentKeyStore>>,
        source: Arc<dyn ContentSource>,
        runtime: Arc<RuntimeState>,
    ) -> Self {
        Self {
            kind: store.kind(),
            store,
            local,
            source,
            runtime,
            seeding: Mutex::new(()),
            writes: Mutex::new(()),
        }
    }

    pub fn kind(&self) -> ContentKind {
        self.kind
    }

    pub fn store(&self) -> &Arc<SnapshotContentStore> {
        &self.store
    }

    pub fn is_seeded(&self) -> bool {
        self.store.is_seeded()
    }

    fn cache_enabled(&self) -> bool {
        self.runtime.level().allows_cache_work()
    }

    fn serves_from_cache(&self) -> bool {
        self.cache_enabled() && self.store.is_seeded()
    }

    /// Pin the caller to the current generation.
    pub fn snapshot(&self) -> Snapshot {
        self.store.create_snapshot()
    }

    /// Load the tree from the local store, or from the primary source when
    /// the local store is missing or unusable.
    #[instrument(skip(self, cancel), fields(kind = %self.kind))]
    pub async fn seed(&self, cancel: &CancellationToken) -> Result<SeedOutcome, CacheServiceError> {
        let level = self.runtime.level();
        if !level.allows_cache_work() {
            info!(?level, "Skipping cache seed at this runtime level");
            return Ok(SeedOutcome::Skipped { level });
        }
        let _seeding = self.seeding.lock().await;
        let started_at = Instant::now();

        if let Some(local) = &self.local {
            let local = Arc::clone(local);
            let store = Arc::clone(&self.store);
            let token = cancel.clone();
            let loaded = tokio::task::spawn_blocking(move || -> Result<usize, SeedError> {
                let kits = local.load()?;
                store.seed(kits, &token)
            })
            .await?;

            match loaded {
                Ok(count) => {
                    record_seed(self.kind, "local", started_at);
                    info!(count, "Seeded from local store");
                    return Ok(SeedOutcome::FromLocalStore { count });
                }
                Err(SeedError::Cancelled) => return Ok(SeedOutcome::Cancelled),
                Err(SeedError::Store(err)) if !err.requires_rebuild() => {
                    warn!(error = %err, "Local store unreadable; rebuilding from primary source");
                }
                Err(SeedError::Store(StoreError::Missing { .. })) => {
                    info!("No local store yet; seeding from primary source");
                }
                Err(err) => {
                    warn!(error = %err, "Local store rejected; rebuilding from primary source");
                }
            }
        }

        self.seed_from_source(cancel, started_at).await
    }

    /// Reload the whole tree from the primary source.
    #[instrument(skip(self, cancel), fields(kind = %self.kind))]
    pub async fn rebuild(&self, cancel: &CancellationToken) -> Result<SeedOutcome, CacheServiceError> {
        let level = self.runtime.level();
        if !level.allows_cache_work() {
            return Ok(SeedOutcome::Skipped { level });
        }
        let _seeding = self.seeding.lock().await;
        self.seed_from_source(cancel, Instant::now()).await
    }

    async fn seed_from_source(
        &self,
        cancel: &CancellationToken,
        started_at: Instant,
    ) -> Result<SeedOutcome, CacheServiceError> {
        let kits = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Seed cancelled while loading from primary source");
                return Ok(SeedOutcome::Cancelled);
            }
            kits = self.source.get_all(self.kind) => kits?,
        };

        let store = Arc::clone(&self.store);
        let token = cancel.clone();
        let seeded = tokio::task::spawn_blocking(move || store.seed(kits, &token)).await?;
        let count = match seeded {
            Ok(count) => count,
            Err(SeedError::Cancelled) => return Ok(SeedOutcome::Cancelled),
            Err(err) => return Err(err.into()),
        };
        record_seed(self.kind, "source", started_at);
        info!(count, "Seeded from primary source");

        if let Some(local) = &self.local {
            let _writes = self.writes.lock().await;
            let local = Arc::clone(local);
            let snapshot = self.store.create_snapshot();
            let written = tokio::task::spawn_blocking(move || {
                local.create()?;
                let mut txn = local.begin_transaction()?;
                for kit in snapshot.kits() {
                    txn.set(Arc::clone(kit));
                }
                txn.commit()
            })
            .await?;
            if let Err(err) = written {
                self.discard_local(&err.to_string()).await;
            }
        }
        Ok(SeedOutcome::FromSource { count })
    }

    /// The kit with `id`, from the current generation once seeded.
    ///
    /// Before seeding, or at a runtime level without cache work, the primary
    /// source answers instead.
    pub async fn get_kit_by_id(
        &self,
        id: i32,
    ) -> Result<Option<Arc<ContentNodeKit>>, CacheServiceError> {
        if self.serves_from_cache() {
            return Ok(self.store.get_by_id(id));
        }
        debug!(kind = %self.kind, id, "Cache not seeded; reading from primary source");
        Ok(self.source.get_kit(self.kind, id).await?.map(Arc::new))
    }

    /// Like `get_kit_by_id`, by node key.
    pub async fn get_kit_by_key(
        &self,
        key: Uuid,
    ) -> Result<Option<Arc<ContentNodeKit>>, CacheServiceError> {
        if self.serves_from_cache() {
            return Ok(self.store.get_by_key(key));
        }
        Ok(self
            .source
            .get_kit_by_key(self.kind, key)
            .await?
            .map(Arc::new))
    }

    /// Whether the node exists with data visible in the given mode.
    pub async fn has_content_by_id(&self, id: i32, preview: bool) -> Result<bool, CacheServiceError> {
        Ok(self
            .get_kit_by_id(id)
            .await?
            .is_some_and(|kit| kit.data(preview).is_some()))
    }

    /// Apply an edited entity.
    pub async fn refresh_content(&self, entity: &ContentEntity) -> Result<(), CacheServiceError> {
        self.refresh_kit(entity.to_kit()).await
    }

    /// Upsert `kit` and persist it to the local store, if any.
    pub async fn refresh_kit(&self, kit: ContentNodeKit) -> Result<(), CacheServiceError> {
        self.apply(vec![KitChange::upsert(kit)]).await;
        Ok(())
    }

    /// Reload one node from the primary source; a node that is gone is deleted.
    pub async fn refresh_from_source(&self, id: i32) -> Result<(), CacheServiceError> {
        match self.source.get_kit(self.kind, id).await? {
            Some(kit) => self.refresh_kit(kit).await,
            None => self.delete_item(id).await.map(|_| ()),
        }
    }

    /// Reload a node and its descendants from the primary source.
    pub async fn refresh_branch(&self, id: i32) -> Result<Vec<i32>, CacheServiceError> {
        let kits = self.source.get_branch(self.kind, id).await?;
        Ok(self.apply_branch(id, kits).await)
    }

    /// Replace the cached branch under `root_id` with `kits`.
    ///
    /// Cached descendants missing from `kits` are tombstoned. Returns the ids
    /// of every node touched.
    pub async fn apply_branch(&self, root_id: i32, kits: Vec<ContentNodeKit>) -> Vec<i32> {
        let fresh: BTreeSet<i32> = kits.iter().map(ContentNodeKit::id).collect();
        let stale: Vec<i32> = self
            .store
            .create_snapshot()
            .branch(root_id)
            .iter()
            .map(|kit| kit.id())
            .filter(|id| !fresh.contains(id))
            .collect();

        let mut changes: Vec<KitChange> = kits.into_iter().map(KitChange::upsert).collect();
        changes.extend(stale.iter().copied().map(KitChange::Remove));
        let touched = changes.iter().map(KitChange::id).collect();
        self.apply(changes).await;
        touched
    }

    /// Remove a node and its cached descendants.
    ///
    /// Returns every removed kit, the node itself first and then its
    /// descendants by depth. Deleting an absent id is a no-op returning an
    /// empty list.
    pub async fn delete_item(
        &self,
        id: i32,
    ) -> Result<Vec<Arc<ContentNodeKit>>, CacheServiceError> {
        let snapshot = self.store.create_snapshot();
        if snapshot.get_by_id(id).is_none() {
            return Ok(Vec::new());
        }
        let mut removed = snapshot.branch(id);
        drop(snapshot);
        removed.sort_by_key(|kit| (kit.node.level, kit.id()));
        let changes = removed
            .iter()
            .map(|kit| KitChange::Remove(kit.id()))
            .collect();
        self.apply(changes).await;
        Ok(removed)
    }

    async fn apply(&self, changes: Vec<KitChange>) {
        if !self.cache_enabled() || changes.is_empty() {
            return;
        }
        let _writes = self.writes.lock().await;
        let generation = self.store.apply_delta(changes.clone());
        debug!(kind = %self.kind, generation, changes = changes.len(), "Applied cache changes");

        let Some(local) = &self.local else {
            return;
        };
        let local = Arc::clone(local);
        let written = tokio::task::spawn_blocking(move || {
            let mut txn = local.begin_transaction()?;
            for change in changes {
                match change {
                    KitChange::Upsert(kit) => txn.set(kit),
                    KitChange::Remove(id) => txn.remove(id),
                }
            }
            txn.commit()
        })
        .await;
        match written {
            Ok(Ok(_)) => {}
            // Nothing to keep in step until a seed from source creates it.
            Ok(Err(StoreError::Missing { .. })) => {}
            Ok(Err(err)) => self.discard_local(&err.to_string()).await,
            Err(err) => self.discard_local(&err.to_string()).await,
        }
    }

    /// A local store that missed a write can no longer seed a correct cache.
    async fn discard_local(&self, reason: &str) {
        let Some(local) = &self.local else {
            return;
        };
        warn!(
            kind = %self.kind,
            reason,
            "Local store write failed; deleting it so the next start rebuilds"
        );
        let local = Arc::clone(local);
        match tokio::task::spawn_blocking(move || local.delete_local_files()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(kind = %self.kind, error = %err, "Failed to delete local store"),
            Err(err) => warn!(kind = %self.kind, error = %err, "Failed to delete local store"),
        }
    }
}

impl fmt::Debug for PublishedCacheService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishedCacheService")
            .field("kind", &self.kind)
            .field("seeded", &self.store.is_seeded())
            .field("generation", &self.store.generation())
            .field("local_store", &self.local.as_ref().map(|l| l.path().to_path_buf()))
            .finish()
    }
}

fn record_seed(kind: ContentKind, from: &'static str, started_at: Instant) {
    histogram!(METRIC_SEED_MS, "kind" => kind.as_str(), "from" => from)
        .record(started_at.elapsed().as_secs_f64() * 1000.0);
}

/// Builds read views over kits.
#[derive(Clone)]
pub struct ViewFactory {
    content_types: Arc<ContentTypeCache>,
    elements: Arc<ElementsCache>,
    resolver: Arc<dyn PropertyValueResolver>,
}

impl ViewFactory {
    pub fn new(
        content_types: Arc<ContentTypeCache>,
        elements: Arc<ElementsCache>,
        resolver: Arc<dyn PropertyValueResolver>,
    ) -> Self {
        Self {
            content_types,
            elements,
            resolver,
        }
    }

    /// A view over `kit`, or `None` when it has no data for the mode.
    pub fn view(&self, kit: Arc<ContentNodeKit>, preview: bool) -> Option<PublishedContent> {
        let content_type = self.content_types.get(kit.content_type_id());
        PublishedContent::from_kit(
            kit,
            content_type,
            preview,
            Arc::clone(&self.elements),
            Arc::clone(&self.resolver),
        )
    }
}

/// Read and refresh entry points for documents.
#[derive(Clone)]
pub struct DocumentCacheService {
    core: Arc<PublishedCacheService>,
    views: ViewFactory,
}

impl DocumentCacheService {
    pub fn new(core: Arc<PublishedCacheService>, views: ViewFactory) -> Self {
        Self { core, views }
    }

    pub fn core(&self) -> &Arc<PublishedCacheService> {
        &self.core
    }

    pub async fn seed(&self, cancel: &CancellationToken) -> Result<SeedOutcome, CacheServiceError> {
        self.core.seed(cancel).await
    }

    /// The published view of node `id`, if it has published data.
    pub async fn get_by_id(&self, id: i32) -> Result<Option<PublishedContent>, CacheServiceError> {
        let kit = self.core.get_kit_by_id(id).await?;
        Ok(kit.and_then(|kit| self.views.view(kit, false)))
    }

    pub async fn get_by_key(&self, key: Uuid) -> Result<Option<PublishedContent>, CacheServiceError> {
        let kit = self.core.get_kit_by_key(key).await?;
        Ok(kit.and_then(|kit| self.views.view(kit, false)))
    }

    /// The draft version, for preview.
    pub async fn get_draft_by_id(
        &self,
        id: i32,
    ) -> Result<Option<PublishedContent>, CacheServiceError> {
        let kit = self.core.get_kit_by_id(id).await?;
        Ok(kit.and_then(|kit| self.views.view(kit, true)))
    }

    pub async fn has_content_by_id(&self, id: i32) -> Result<bool, CacheServiceError> {
        self.core.has_content_by_id(id, false).await
    }

    /// Apply an edited entity to the cache.
    pub async fn refresh_content(&self, entity: &ContentEntity) -> Result<(), CacheServiceError> {
        self.core.refresh_content(entity).await
    }

    /// Drop the node and its descendants from the cache.
    ///
    /// Elements-level values are not invalidated here; go through
    /// `CacheNotificationHandler` for that.
    pub async fn delete_item(&self, id: i32) -> Result<(), CacheServiceError> {
        self.core.delete_item(id).await.map(|_| ())
    }

    pub async fn rebuild(&self, cancel: &CancellationToken) -> Result<SeedOutcome, CacheServiceError> {
        self.core.rebuild(cancel).await
    }

    pub fn snapshot(&self) -> Snapshot {
        self.core.snapshot()
    }

    pub fn is_seeded(&self) -> bool {
        self.core.is_seeded()
    }
}

/// Read and refresh entry points for media. Media has no drafts.
#[derive(Clone)]
pub struct MediaCacheService {
    core: Arc<PublishedCacheService>,
    views: ViewFactory,
}

impl MediaCacheService {
    pub fn new(core: Arc<PublishedCacheService>, views: ViewFactory) -> Self {
        Self { core, views }
    }

    pub fn core(&self) -> &Arc<PublishedCacheService> {
        &self.core
    }

    pub async fn seed(&self, cancel: &CancellationToken) -> Result<SeedOutcome, CacheServiceError> {
        self.core.seed(cancel).await
    }

    /// The published view of node `id`, if it has published data.
    pub async fn get_by_id(&self, id: i32) -> Result<Option<PublishedContent>, CacheServiceError> {
        let kit = self.core.get_kit_by_id(id).await?;
        Ok(kit.and_then(|kit| self.views.view(kit, false)))
    }

    pub async fn get_by_key(&self, key: Uuid) -> Result<Option<PublishedContent>, CacheServiceError> {
        let kit = self.core.get_kit_by_key(key).await?;
        Ok(kit.and_then(|kit| self.views.view(kit, false)))
    }

    pub async fn has_content_by_id(&self, id: i32) -> Result<bool, CacheServiceError> {
        self.core.has_content_by_id(id, false).await
    }

    /// Apply an edited entity to the cache.
    pub async fn refresh_content(&self, entity: &ContentEntity) -> Result<(), CacheServiceError> {
        self.core.refresh_content(entity).await
    }

    /// Drop the node and its descendants from the cache.
    ///
    /// Elements-level values are not invalidated here; go through
    /// `CacheNotificationHandler` for that.
    pub async fn delete_item(&self, id: i32) -> Result<(), CacheServiceError> {
        self.core.delete_item(id).await.map(|_| ())
    }

    pub async fn rebuild(&self, cancel: &CancellationToken) -> Result<SeedOutcome, CacheServiceError> {
        self.core.rebuild(cancel).await
    }

    pub fn snapshot(&self) -> Snapshot {
        self.core.snapshot()
    }

    pub fn is_seeded(&self) -> bool {
        self.core.is_seeded()
    }
}
