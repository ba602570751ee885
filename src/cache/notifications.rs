//! Domain change notifications and their cache handling.
//!
//! Each notification first updates the owning snapshot store through the
//! façade, then runs relation invalidation of the elements cache. Both steps
//! finish before `handle` returns. Document and media notifications are
//! independent and `handle_all` runs the two chains concurrently.

use std::sync::Arc;

use futures::future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::domain::entities::ContentEntity;
use crate::domain::kits::ContentNodeKit;
use crate::domain::types::ContentKind;

use super::error::CacheServiceError;
use super::invalidation::{ElementsInvalidator, InvalidationOutcome};
use super::service::{PublishedCacheService, SeedOutcome};

/// A change to one node of a published tree.
#[derive(Debug, Clone)]
pub enum CacheNotification {
    /// A node was saved or published; carries its new kit.
    Refreshed(ContentNodeKit),
    /// A node and its descendants were reloaded.
    BranchRefreshed {
        kind: ContentKind,
        root_id: i32,
        kits: Vec<ContentNodeKit>,
    },
    /// A node was deleted.
    Deleted { kind: ContentKind, id: i32 },
}

impl CacheNotification {
    /// A saved or published document.
    pub fn content_refreshed(entity: &ContentEntity) -> Self {
        Self::Refreshed(entity.to_kit())
    }

    pub fn media_refreshed(entity: &ContentEntity) -> Self {
        Self::Refreshed(entity.to_kit())
    }

    /// A deleted document. Its descendants go with it.
    pub fn content_deleted(id: i32) -> Self {
        Self::Deleted {
            kind: ContentKind::Document,
            id,
        }
    }

    /// A deleted media item. Its descendants go with it.
    pub fn media_deleted(id: i32) -> Self {
        Self::Deleted {
            kind: ContentKind::Media,
            id,
        }
    }

    pub fn kind(&self) -> ContentKind {
        match self {
            Self::Refreshed(kit) => kit.kind,
            Self::BranchRefreshed { kind, .. } | Self::Deleted { kind, .. } => *kind,
        }
    }

    pub fn id(&self) -> i32 {
        match self {
            Self::Refreshed(kit) => kit.id(),
            Self::BranchRefreshed { root_id, .. } => *root_id,
            Self::Deleted { id, .. } => *id,
        }
    }
}

pub struct CacheNotificationHandler {
    documents: Arc<PublishedCacheService>,
    media: Arc<PublishedCacheService>,
    invalidator: Arc<ElementsInvalidator>,
}

impl CacheNotificationHandler {
    /// Route document and media changes to their services, then through
    /// `invalidator`.
    pub fn new(
        documents: Arc<PublishedCacheService>,
        media: Arc<PublishedCacheService>,
        invalidator: Arc<ElementsInvalidator>,
    ) -> Self {
        Self {
            documents,
            media,
            invalidator,
        }
    }

    fn service(&self, kind: ContentKind) -> &Arc<PublishedCacheService> {
        match kind {
            ContentKind::Document => &self.documents,
            ContentKind::Media => &self.media,
        }
    }

    /// Apply one notification: store update first, then invalidation.
    #[instrument(skip(self, notification), fields(kind = %notification.kind(), content_id = notification.id()))]
    pub async fn handle(
        &self,
        notification: CacheNotification,
    ) -> Result<InvalidationOutcome, CacheServiceError> {
        let service = self.service(notification.kind());
        match notification {
            CacheNotification::Refreshed(kit) => {
                let id = kit.id();
                service.refresh_kit(kit.clone()).await?;
                Ok(self.invalidator.invalidate(id, Some(&kit)).await)
            }
            CacheNotification::BranchRefreshed { root_id, kits, .. } => {
                let touched = service.apply_branch(root_id, kits).await;
                let mut total = InvalidationOutcome::default();
                for id in touched {
                    let kit = service.store().get_by_id(id);
                    total += self.invalidator.invalidate(id, kit.as_deref()).await;
                }
                Ok(total)
            }
            CacheNotification::Deleted { id, .. } => {
                let removed = service.delete_item(id).await?;
                if removed.is_empty() {
                    debug!("Deleted node was not cached");
                    return Ok(self.invalidator.invalidate(id, None).await);
                }
                let mut total = InvalidationOutcome::default();
                for kit in &removed {
                    total += self.invalidator.invalidate(kit.id(), Some(kit.as_ref())).await;
                }
                Ok(total)
            }
        }
    }

    /// Apply a batch. Each tree's notifications run in order; the two trees
    /// run concurrently. The first error of either chain is returned after
    /// both finish.
    pub async fn handle_all(
        &self,
        notifications: Vec<CacheNotification>,
    ) -> Result<(), CacheServiceError> {
        let (documents, media): (Vec<_>, Vec<_>) = notifications
            .into_iter()
            .partition(|n| n.kind() == ContentKind::Document);

        let (documents, media) = future::join(self.chain(documents), self.chain(media)).await;
        documents.and(media)
    }

    async fn chain(&self, notifications: Vec<CacheNotification>) -> Result<(), CacheServiceError> {
        for notification in notifications {
            self.handle(notification).await?;
        }
        Ok(())
    }

    /// Reload a whole tree from the primary source and drop every
    /// elements-level value.
    pub async fn rebuild(&self, kind: ContentKind) -> Result<SeedOutcome, CacheServiceError> {
        let outcome = self.service(kind).rebuild(&CancellationToken::new()).await?;
        self.invalidator.clear_all();
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::application::repos::{ContentSource, RelationService};
    use crate::cache::config::CacheConfig;
    use crate::cache::elements::ElementsCache;
    use crate::cache::keys::ValueCacheKey;
    use crate::cache::published::ContentTypeCache;
    use crate::cache::snapshot::SnapshotContentStore;
    use crate::domain::kits::test_kit;
    use crate::domain::relations::Relation;
    use crate::domain::types::{ContentType, PropertyCacheLevel, PropertyType, RuntimeState};
    use crate::infra::memory::{MemoryContentSource, MemoryRelationService};

    struct Fixture {
        handler: CacheNotificationHandler,
        documents: Arc<PublishedCacheService>,
        media: Arc<PublishedCacheService>,
        elements: Arc<ElementsCache>,
        relations: Arc<MemoryRelationService>,
    }

    async fn fixture() -> Fixture {
        let config = CacheConfig::default();
        let source: Arc<dyn ContentSource> = Arc::new(MemoryContentSource::new());
        let runtime = Arc::new(RuntimeState::default());
        let documents = Arc::new(PublishedCacheService::new(
            Arc::new(SnapshotContentStore::new(ContentKind::Document, &config)),
            None,
            Arc::clone(&source),
            Arc::clone(&runtime),
        ));
        let media = Arc::new(PublishedCacheService::new(
            Arc::new(SnapshotContentStore::new(ContentKind::Media, &config)),
            None,
            source,
            runtime,
        ));
        documents
            .store()
            .seed(vec![test_kit(ContentKind::Document, 1, "A")], &CancellationToken::new())
            .expect("seed documents");
        media
            .store()
            .seed(vec![test_kit(ContentKind::Media, 2, "B")], &CancellationToken::new())
            .expect("seed media");

        let content_types = Arc::new(ContentTypeCache::new());
        content_types.set(ContentType {
            id: 1,
            alias: "article".to_string(),
            kind: ContentKind::Document,
            property_types: vec![
                PropertyType::new("related", "picker", PropertyCacheLevel::Elements),
                PropertyType::new("title", "text", PropertyCacheLevel::Elements)
                    .varying_by_culture(),
            ],
        });
        let elements = Arc::new(ElementsCache::new(&config));
        let relations = Arc::new(MemoryRelationService::with_relations([Relation::new(
            1, 2, "umbMedia",
        )]));
        let invalidator = Arc::new(ElementsInvalidator::new(
            Arc::clone(&relations) as Arc<dyn RelationService>,
            Arc::clone(&elements),
            content_types,
            vec![Arc::clone(documents.store()), Arc::clone(media.store())],
        ));

        Fixture {
            handler: CacheNotificationHandler::new(
                Arc::clone(&documents),
                Arc::clone(&media),
                invalidator,
            ),
            documents,
            media,
            elements,
            relations,
        }
    }

    fn related_key(id: i32) -> ValueCacheKey {
        ValueCacheKey::new(Uuid::from_u128(id as u128), "related", None, false)
    }

    fn media_child(parent: &ContentNodeKit, id: i32) -> ContentNodeKit {
        let mut kit = test_kit(ContentKind::Media, id, "child");
        kit.node.parent_id = parent.id();
        kit.node.level = parent.node.level + 1;
        kit.node.path = format!("{},{id}", parent.node.path);
        kit
    }

    #[tokio::test]
    async fn media_refresh_clears_referencing_document_value() {
        let fx = fixture().await;
        fx.elements.insert(related_key(1), json!("B v1"));

        let outcome = fx
            .handler
            .handle(CacheNotification::Refreshed(test_kit(ContentKind::Media, 2, "B v2")))
            .await
            .expect("handle");

        assert_eq!(outcome.resident, 1);
        assert!(fx.elements.get(&related_key(1)).is_none());
        let media = fx.media.store().get_by_id(2).expect("media cached");
        assert_eq!(media.published.as_ref().map(|d| d.name.as_str()), Some("B v2"));
    }

    #[tokio::test]
    async fn delete_twice_leaves_same_state() {
        let fx = fixture().await;

        fx.handler
            .handle(CacheNotification::content_deleted(1))
            .await
            .expect("first delete");
        let generation = fx.documents.store().generation();
        fx.handler
            .handle(CacheNotification::content_deleted(1))
            .await
            .expect("second delete");

        assert!(fx.documents.store().get_by_id(1).is_none());
        assert_eq!(fx.documents.store().generation(), generation);
    }

    #[tokio::test]
    async fn batch_applies_both_trees() {
        let fx = fixture().await;
        fx.elements.insert(related_key(1), json!("B v1"));

        fx.handler
            .handle_all(vec![
                CacheNotification::Refreshed(test_kit(ContentKind::Document, 3, "C")),
                CacheNotification::media_deleted(2),
                CacheNotification::Refreshed(test_kit(ContentKind::Document, 4, "D")),
            ])
            .await
            .expect("batch");

        assert!(fx.documents.store().get_by_id(3).is_some());
        assert!(fx.documents.store().get_by_id(4).is_some());
        assert!(fx.media.store().get_by_id(2).is_none());
        assert!(fx.elements.get(&related_key(1)).is_none());
    }

    #[tokio::test]
    async fn refresh_that_drops_a_culture_clears_its_cached_value() {
        let fx = fixture().await;
        let title = |culture: Option<&str>| {
            ValueCacheKey::new(Uuid::from_u128(1), "title", culture, false)
        };
        fx.elements.insert(title(Some("fr-FR")), json!("Bonjour"));
        fx.elements.insert(title(None), json!("Hello"));

        // The new kit carries no fr-FR data at all.
        fx.handler
            .handle(CacheNotification::Refreshed(test_kit(
                ContentKind::Document,
                1,
                "A v2",
            )))
            .await
            .expect("handle");

        assert!(!fx.elements.contains(&title(Some("fr-FR"))));
        assert!(!fx.elements.contains(&title(None)));
    }

    #[tokio::test]
    async fn deleting_a_branch_invalidates_values_related_to_descendants() {
        let fx = fixture().await;
        let folder = test_kit(ContentKind::Media, 10, "Folder");
        let image = media_child(&folder, 11);
        for kit in [folder, image] {
            fx.handler
                .handle(CacheNotification::Refreshed(kit))
                .await
                .expect("cache media");
        }
        fx.relations.forget(2);
        fx.relations.relate(Relation::new(1, 11, "umbMedia"));
        fx.elements.insert(related_key(1), json!("image 11"));

        let outcome = fx
            .handler
            .handle(CacheNotification::media_deleted(10))
            .await
            .expect("delete folder");

        assert!(fx.media.store().get_by_id(10).is_none());
        assert!(fx.media.store().get_by_id(11).is_none());
        assert_eq!(outcome.resident, 1);
        assert!(!fx.elements.contains(&related_key(1)));
    }
}
