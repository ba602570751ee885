//! Origin side of the refresher protocol.
//!
//! Callers name a refresher and what changed; the message is applied on this
//! node right away and queued for the rest of the farm.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::cache::error::RefreshError;
use crate::cache::refresher::{MessageType, RefreshMessage, RefresherRegistry};
use crate::domain::entities::ContentEntity;
use crate::domain::kits::ContentNodeKit;
use crate::domain::types::ContentType;

use super::server::ServerMessenger;

/// An entity that can be named in an instance message.
///
/// Instances never cross the wire; only their id does.
pub trait CacheInstance {
    fn instance_id(&self) -> i32;
}

impl CacheInstance for ContentEntity {
    fn instance_id(&self) -> i32 {
        self.id()
    }
}

impl CacheInstance for ContentNodeKit {
    fn instance_id(&self) -> i32 {
        self.id()
    }
}

impl CacheInstance for ContentType {
    fn instance_id(&self) -> i32 {
        self.id
    }
}

impl<T: CacheInstance + ?Sized> CacheInstance for &T {
    fn instance_id(&self) -> i32 {
        (**self).instance_id()
    }
}

#[derive(Debug, Clone)]
pub struct DistributedCache {
    registry: Arc<RefresherRegistry>,
    messenger: Arc<ServerMessenger>,
}

impl DistributedCache {
    /// Wrap `messenger`, checking refresher ids against its registry.
    pub fn new(messenger: Arc<ServerMessenger>) -> Self {
        Self {
            registry: Arc::clone(messenger.registry()),
            messenger,
        }
    }

    pub fn messenger(&self) -> &Arc<ServerMessenger> {
        &self.messenger
    }

    /// Refresh `ids` on this node and queue the instruction for the farm.
    ///
    /// Unknown refresher ids fail with `RefreshError::UnknownRefresher`.
    /// An empty id list is accepted and sends nothing.
    pub async fn refresh(&self, refresher_id: Uuid, ids: &[i32]) -> Result<(), RefreshError> {
        self.send_ids(refresher_id, MessageType::RefreshById, ids)
            .await
    }

    /// Remove `ids` on this node and queue the instruction for the farm.
    ///
    /// Validation matches `refresh`.
    pub async fn remove(&self, refresher_id: Uuid, ids: &[i32]) -> Result<(), RefreshError> {
        self.send_ids(refresher_id, MessageType::RemoveById, ids)
            .await
    }

    /// Rebuild everything the refresher owns on every node.
    pub async fn refresh_all(&self, refresher_id: Uuid) -> Result<(), RefreshError> {
        self.ensure_registered(refresher_id)?;
        self.messenger.queue_refresh_all(refresher_id).await?;
        Ok(())
    }

    /// Refresh with typed payloads, such as tree change records.
    ///
    /// An empty payload list sends nothing. The refresher decodes the
    /// payloads on each node, so local decode failures are not distributed.
    pub async fn refresh_payload<T: Serialize>(
        &self,
        refresher_id: Uuid,
        payloads: &[T],
    ) -> Result<(), RefreshError> {
        self.ensure_registered(refresher_id)?;
        if payloads.is_empty() {
            return Ok(());
        }
        self.messenger
            .queue_refresh_payload(refresher_id, payloads)
            .await?;
        Ok(())
    }

    /// Refresh by instance. Only the instance ids travel.
    pub async fn refresh_instance<I: CacheInstance>(
        &self,
        refresher_id: Uuid,
        instances: &[I],
    ) -> Result<(), RefreshError> {
        let ids: Vec<i32> = instances.iter().map(CacheInstance::instance_id).collect();
        self.send_ids(refresher_id, MessageType::RefreshByInstance, &ids)
            .await
    }

    /// Remove by instance. Only the instance ids travel.
    pub async fn remove_instance<I: CacheInstance>(
        &self,
        refresher_id: Uuid,
        instances: &[I],
    ) -> Result<(), RefreshError> {
        let ids: Vec<i32> = instances.iter().map(CacheInstance::instance_id).collect();
        self.send_ids(refresher_id, MessageType::RemoveByInstance, &ids)
            .await
    }

    async fn send_ids(
        &self,
        refresher_id: Uuid,
        message_type: MessageType,
        ids: &[i32],
    ) -> Result<(), RefreshError> {
        self.ensure_registered(refresher_id)?;
        if ids.is_empty() {
            debug!(%refresher_id, %message_type, "Nothing to send");
            return Ok(());
        }
        let message = RefreshMessage::by_ids(refresher_id, message_type, ids).map_err(
            |source| RefreshError::Payload {
                refresher_id,
                source,
            },
        )?;
        self.messenger.deliver(message).await?;
        Ok(())
    }

    fn ensure_registered(&self, refresher_id: Uuid) -> Result<(), RefreshError> {
        if self.registry.contains(refresher_id) {
            Ok(())
        } else {
            Err(RefreshError::UnknownRefresher(refresher_id))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::cache::config::FarmConfig;
    use crate::cache::messenger::NoopTransport;
    use crate::cache::refresher::CacheRefresher;
    use crate::domain::types::ContentKind;

    const SPY_ID: Uuid = Uuid::from_u128(0xD1);

    #[derive(Default)]
    struct Spy {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CacheRefresher for Spy {
        fn unique_id(&self) -> Uuid {
            SPY_ID
        }

        fn name(&self) -> &str {
            "spy"
        }

        async fn refresh_all(&self) -> Result<(), RefreshError> {
            self.calls.lock().expect("calls").push("all".into());
            Ok(())
        }

        async fn refresh(&self, id: i32) -> Result<(), RefreshError> {
            self.calls.lock().expect("calls").push(format!("refresh:{id}"));
            Ok(())
        }

        async fn remove(&self, id: i32) -> Result<(), RefreshError> {
            self.calls.lock().expect("calls").push(format!("remove:{id}"));
            Ok(())
        }
    }

    fn distributed() -> (Arc<Spy>, DistributedCache) {
        let spy = Arc::new(Spy::default());
        let registry = RefresherRegistry::builder()
            .register(Arc::clone(&spy) as Arc<dyn CacheRefresher>)
            .build()
            .expect("registry");
        let messenger = ServerMessenger::new(
            &FarmConfig::single_server("solo"),
            Arc::new(registry),
            Arc::new(NoopTransport),
        );
        (spy, DistributedCache::new(Arc::new(messenger)))
    }

    #[tokio::test]
    async fn instances_travel_as_ids_and_raise_events() {
        let (spy, cache) = distributed();
        let mut events = cache.messenger().registry().subscribe();
        let entity = ContentEntity::new(
            ContentKind::Document,
            12,
            Uuid::from_u128(12),
            -1,
            "-1,12",
            1,
            "Home",
        )
        .expect("entity");

        cache
            .refresh_instance(SPY_ID, &[&entity])
            .await
            .expect("refresh");
        cache
            .remove_instance(SPY_ID, &[&entity])
            .await
            .expect("remove");

        assert_eq!(
            *spy.calls.lock().expect("calls"),
            vec!["refresh:12", "remove:12"]
        );
        let first = events.try_recv().expect("event");
        assert_eq!(first.message_type, MessageType::RefreshByInstance);
        assert_eq!(first.payload, "[12]");
        assert_eq!(cache.messenger().queue_len(), 2);
    }

    #[tokio::test]
    async fn unknown_refresher_is_an_error_at_the_origin() {
        let (spy, cache) = distributed();
        let unknown = Uuid::from_u128(0xBAD);

        let err = cache.refresh(unknown, &[1]).await.expect_err("unknown");
        assert!(matches!(err, RefreshError::UnknownRefresher(id) if id == unknown));
        assert!(spy.calls.lock().expect("calls").is_empty());
        assert_eq!(cache.messenger().queue_len(), 0);
    }

    #[tokio::test]
    async fn empty_id_lists_send_nothing() {
        let (spy, cache) = distributed();
        cache.refresh(SPY_ID, &[]).await.expect("noop");
        cache
            .refresh_payload::<serde_json::Value>(SPY_ID, &[])
            .await
            .expect("noop");
        assert!(spy.calls.lock().expect("calls").is_empty());
        assert_eq!(cache.messenger().queue_len(), 0);
    }

    #[tokio::test]
    async fn payload_for_a_refresher_without_payload_support_is_not_queued() {
        let (_spy, cache) = distributed();
        let err = cache
            .refresh_payload(SPY_ID, &[serde_json::json!({"id": 1})])
            .await
            .expect_err("unsupported");
        assert!(matches!(err, RefreshError::Unsupported { .. }));
        assert_eq!(cache.messenger().queue_len(), 0);
    }
}
