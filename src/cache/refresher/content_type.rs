//! Content type refresher.
//!
//! A changed type can move a property between cache levels, so every change
//! drops the whole elements cache.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::application::repos::ContentTypeSource;
use crate::cache::error::RefreshError;
use crate::cache::invalidation::ElementsInvalidator;
use crate::cache::published::ContentTypeCache;

use super::CacheRefresher;

pub const CONTENT_TYPE_REFRESHER_ID: Uuid =
    Uuid::from_u128(0x6902E22C_9C10_483C_91F3_66B7CAE9E2F5);

pub struct ContentTypeCacheRefresher {
    source: Arc<dyn ContentTypeSource>,
    content_types: Arc<ContentTypeCache>,
    invalidator: Arc<ElementsInvalidator>,
}

impl ContentTypeCacheRefresher {
    pub fn new(
        source: Arc<dyn ContentTypeSource>,
        content_types: Arc<ContentTypeCache>,
        invalidator: Arc<ElementsInvalidator>,
    ) -> Self {
        Self {
            source,
            content_types,
            invalidator,
        }
    }
}

#[async_trait]
impl CacheRefresher for ContentTypeCacheRefresher {
    fn unique_id(&self) -> Uuid {
        CONTENT_TYPE_REFRESHER_ID
    }

    fn name(&self) -> &str {
        "ContentTypeCacheRefresher"
    }

    async fn refresh_all(&self) -> Result<(), RefreshError> {
        let types = self.source.get_all().await?;
        debug!(count = types.len(), "Reloading all content types");
        self.content_types.replace_all(types);
        self.invalidator.clear_all();
        Ok(())
    }

    async fn refresh(&self, id: i32) -> Result<(), RefreshError> {
        match self.source.get_content_type(id).await? {
            Some(content_type) => self.content_types.set(content_type),
            None => {
                self.content_types.remove(id);
            }
        }
        self.invalidator.clear_all();
        Ok(())
    }

    async fn remove(&self, id: i32) -> Result<(), RefreshError> {
        self.content_types.remove(id);
        self.invalidator.clear_all();
        Ok(())
    }
}
