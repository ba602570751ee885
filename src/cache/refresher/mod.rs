//! Cache refreshers.
//!
//! A refresher turns an invalidation instruction into local cache work. Each
//! one carries an id that is identical on every node of the farm, so a
//! message built on one node is routed to the same refresher everywhere.
//!
//! - `message`: `RefreshMessage`, `MessageType` and payload encoding
//! - `registry`: the immutable dispatch table and `CacheUpdated` events
//! - `tree`: document and media refreshers
//! - `content_type`: content type refresher

mod content_type;
mod message;
mod registry;
mod tree;

use async_trait::async_trait;
use uuid::Uuid;

use super::error::RefreshError;

pub use content_type::{CONTENT_TYPE_REFRESHER_ID, ContentTypeCacheRefresher};
pub use message::{MessageType, RefreshMessage, deserialize_payload, serialize_payload};
pub use registry::{CacheUpdated, DispatchOutcome, RefresherRegistry, RefresherRegistryBuilder};
pub use tree::{
    CONTENT_REFRESHER_ID, ChangeType, MEDIA_REFRESHER_ID, TreeCacheRefresher, TreeChangePayload,
};

/// The operations a refresher offers to the dispatcher.
#[async_trait]
pub trait CacheRefresher: Send + Sync {
    fn unique_id(&self) -> Uuid;

    fn name(&self) -> &str;

    async fn refresh_all(&self) -> Result<(), RefreshError>;

    async fn refresh(&self, id: i32) -> Result<(), RefreshError>;

    async fn remove(&self, id: i32) -> Result<(), RefreshError>;

    /// Apply a JSON array of refresher-specific payloads.
    async fn refresh_from_payload(&self, payload: &[u8]) -> Result<(), RefreshError> {
        let _ = payload;
        Err(RefreshError::Unsupported {
            refresher_id: self.unique_id(),
            message_type: MessageType::RefreshByPayload,
        })
    }
}
