//! Composition root of the cache.
//!
//! `CacheContext` owns every cache component for the life of the process.
//! It is built once from settings and collaborators, started once, and
//! shared by reference.

use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::application::repos::{ContentSource, ContentTypeSource, RelationService};
use crate::config::Settings;
use crate::domain::types::{ContentKind, RuntimeState};

use super::config::{CacheConfig, FarmConfig};
use super::elements::ElementsCache;
use super::error::RefreshError;
use super::invalidation::ElementsInvalidator;
use super::messenger::{DistributedCache, FarmTransport, NoopTransport, ServerMessenger};
use super::notifications::CacheNotificationHandler;
use super::persistent::PersistentKeyStore;
use super::published::{ContentTypeCache, PassThroughResolver, PropertyValueResolver};
use super::refresher::{
    CacheRefresher, CacheUpdated, ContentTypeCacheRefresher, RefresherRegistry,
    TreeCacheRefresher,
};
use super::service::{
    DocumentCacheService, MediaCacheService, PublishedCacheService, SeedOutcome, ViewFactory,
};
use super::snapshot::SnapshotContentStore;

const DOCUMENT_STORE_FILE: &str = "documents.kits";
const MEDIA_STORE_FILE: &str = "media.kits";

/// External systems the cache reads from.
#[derive(Clone)]
pub struct Collaborators {
    pub content: Arc<dyn ContentSource>,
    pub relations: Arc<dyn RelationService>,
    pub content_types: Arc<dyn ContentTypeSource>,
}

pub struct CacheContextBuilder {
    cache: CacheConfig,
    farm: FarmConfig,
    collaborators: Collaborators,
    runtime: Arc<RuntimeState>,
    resolver: Arc<dyn PropertyValueResolver>,
    transport: Arc<dyn FarmTransport>,
    refreshers: Vec<Arc<dyn CacheRefresher>>,
}

impl CacheContextBuilder {
    /// Start with pass-through value resolving and no farm transport.
    pub fn new(cache: CacheConfig, farm: FarmConfig, collaborators: Collaborators) -> Self {
        Self {
            cache,
            farm,
            collaborators,
            runtime: Arc::new(RuntimeState::default()),
            resolver: Arc::new(PassThroughResolver),
            transport: Arc::new(NoopTransport),
            refreshers: Vec::new(),
        }
    }

    pub fn runtime(mut self, runtime: Arc<RuntimeState>) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn PropertyValueResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Send farm instructions through `transport` instead of dropping them.
    pub fn transport(mut self, transport: Arc<dyn FarmTransport>) -> Self {
        self.transport = transport;
        self
    }

    /// Register an application refresher next to the built-in ones.
    pub fn refresher(mut self, refresher: Arc<dyn CacheRefresher>) -> Self {
        self.refreshers.push(refresher);
        self
    }

    /// Wire every component. Fails only when two refreshers share an id.
    pub fn build(self) -> Result<CacheContext, RefreshError> {
        let Self {
            cache,
            farm,
            collaborators,
            runtime,
            resolver,
            transport,
            refreshers,
        } = self;

        let content_types = Arc::new(ContentTypeCache::new());
        let elements = Arc::new(ElementsCache::new(&cache));
        let document_store = Arc::new(SnapshotContentStore::new(ContentKind::Document, &cache));
        let media_store = Arc::new(SnapshotContentStore::new(ContentKind::Media, &cache));

        let local_store = |file_name: &str| {
            cache.enable_local_store.then(|| {
                Arc::new(PersistentKeyStore::open(
                    cache.local_store_path(file_name),
                    cache.serializer_version,
                ))
            })
        };
        let document_core = Arc::new(PublishedCacheService::new(
            Arc::clone(&document_store),
            local_store(DOCUMENT_STORE_FILE),
            Arc::clone(&collaborators.content),
            Arc::clone(&runtime),
        ));
        let media_core = Arc::new(PublishedCacheService::new(
            Arc::clone(&media_store),
            local_store(MEDIA_STORE_FILE),
            Arc::clone(&collaborators.content),
            Arc::clone(&runtime),
        ));

        let invalidator = Arc::new(ElementsInvalidator::new(
            Arc::clone(&collaborators.relations),
            Arc::clone(&elements),
            Arc::clone(&content_types),
            vec![document_store, media_store],
        ));
        let notifications = Arc::new(CacheNotificationHandler::new(
            Arc::clone(&document_core),
            Arc::clone(&media_core),
            Arc::clone(&invalidator),
        ));

        let mut registry = RefresherRegistry::builder()
            .register(Arc::new(TreeCacheRefresher::content(
                Arc::clone(&collaborators.content),
                Arc::clone(&notifications),
            )))
            .register(Arc::new(TreeCacheRefresher::media(
                Arc::clone(&collaborators.content),
                Arc::clone(&notifications),
            )))
            .register(Arc::new(ContentTypeCacheRefresher::new(
                Arc::clone(&collaborators.content_types),
                Arc::clone(&content_types),
                Arc::clone(&invalidator),
            )));
        for refresher in refreshers {
            registry = registry.register(refresher);
        }
        let registry = Arc::new(registry.build()?);

        let messenger = Arc::new(ServerMessenger::new(&farm, Arc::clone(&registry), transport));
        let distributed = DistributedCache::new(Arc::clone(&messenger));

        let views = ViewFactory::new(Arc::clone(&content_types), Arc::clone(&elements), resolver);
        Ok(CacheContext {
            documents: DocumentCacheService::new(document_core, views.clone()),
            media: MediaCacheService::new(media_core, views),
            cache,
            farm,
            content_type_source: collaborators.content_types,
            runtime,
            content_types,
            elements,
            invalidator,
            notifications,
            registry,
            messenger,
            distributed,
        })
    }
}

/// What `CacheContext::start` did.
///
/// A `None` entry failed and was logged; that part of the cache stays cold
/// and reads fall through to the primary source.
#[derive(Debug)]
pub struct StartReport {
    pub content_types: Option<usize>,
    pub documents: Option<SeedOutcome>,
    pub media: Option<SeedOutcome>,
    /// Background sync loop; finishes after the start token is cancelled.
    pub sync_task: JoinHandle<()>,
}

pub struct CacheContext {
    cache: CacheConfig,
    farm: FarmConfig,
    content_type_source: Arc<dyn ContentTypeSource>,
    runtime: Arc<RuntimeState>,
    content_types: Arc<ContentTypeCache>,
    elements: Arc<ElementsCache>,
    invalidator: Arc<ElementsInvalidator>,
    notifications: Arc<CacheNotificationHandler>,
    registry: Arc<RefresherRegistry>,
    messenger: Arc<ServerMessenger>,
    distributed: DistributedCache,
    documents: DocumentCacheService,
    media: MediaCacheService,
}

impl CacheContext {
    pub fn builder(settings: &Settings, collaborators: Collaborators) -> CacheContextBuilder {
        CacheContextBuilder::new(
            CacheConfig::from(&settings.cache),
            FarmConfig::from(&settings.farm),
            collaborators,
        )
    }

    /// Load content types, seed both trees and start the sync loop.
    ///
    /// Never fails: every step that cannot complete is logged and leaves its
    /// part of the cache cold.
    pub async fn start(&self, cancel: CancellationToken) -> StartReport {
        let content_types = match self.content_type_source.get_all().await {
            Ok(types) => {
                let count = types.len();
                self.content_types.replace_all(types);
                Some(count)
            }
            Err(err) => {
                warn!(error = %err, "Content types could not be loaded; values resolve untyped");
                None
            }
        };

        let (documents, media) =
            futures::join!(self.documents.seed(&cancel), self.media.seed(&cancel));
        let documents = documents
            .inspect_err(|err| warn!(kind = "document", error = %err, "Cache seed failed"))
            .ok();
        let media = media
            .inspect_err(|err| warn!(kind = "media", error = %err, "Cache seed failed"))
            .ok();

        let sync_task = self
            .messenger
            .spawn_sync_loop(self.farm.sync_interval, cancel);
        info!(
            identity = %self.messenger.identity(),
            ?documents,
            ?media,
            "Cache started"
        );
        StartReport {
            content_types,
            documents,
            media,
            sync_task,
        }
    }

    pub fn documents(&self) -> &DocumentCacheService {
        &self.documents
    }

    pub fn media(&self) -> &MediaCacheService {
        &self.media
    }

    pub fn distributed(&self) -> &DistributedCache {
        &self.distributed
    }

    pub fn messenger(&self) -> &Arc<ServerMessenger> {
        &self.messenger
    }

    pub fn registry(&self) -> &Arc<RefresherRegistry> {
        &self.registry
    }

    pub fn notifications(&self) -> &Arc<CacheNotificationHandler> {
        &self.notifications
    }

    pub fn invalidator(&self) -> &Arc<ElementsInvalidator> {
        &self.invalidator
    }

    pub fn elements(&self) -> &Arc<ElementsCache> {
        &self.elements
    }

    pub fn content_types(&self) -> &Arc<ContentTypeCache> {
        &self.content_types
    }

    pub fn runtime(&self) -> &Arc<RuntimeState> {
        &self.runtime
    }

    pub fn cache_config(&self) -> &CacheConfig {
        &self.cache
    }

    pub fn farm_config(&self) -> &FarmConfig {
        &self.farm
    }

    /// `CacheUpdated` for every refresher message applied on this node.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheUpdated> {
        self.registry.subscribe()
    }
}

impl fmt::Debug for CacheContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheContext")
            .field("identity", &self.messenger.identity())
            .field("runtime", &self.runtime.level())
            .field("refreshers", &self.registry.len())
            .field("content_types", &self.content_types.len())
            .field("elements", &self.elements.len())
            .finish()
    }
}
