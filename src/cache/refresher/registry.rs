//! Refresher dispatch table.
//!
//! Built once at startup and immutable afterwards. Inbound messages are routed
//! by refresher id; ids with no local registration are ignored, since a node
//! may run fewer features than the one that sent the message.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use metrics::counter;
use tokio::sync::broadcast;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::cache::error::RefreshError;

use super::CacheRefresher;
use super::message::{MessageType, RefreshMessage};

const METRIC_UNKNOWN: &str = "pubcache_refresher_unknown_total";
const METRIC_PAYLOAD_REJECTED: &str = "pubcache_payload_rejected_total";
const EVENT_CAPACITY: usize = 256;

/// Raised after a refresher applied a message on this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheUpdated {
    pub refresher_id: Uuid,
    pub refresher_name: String,
    pub message_type: MessageType,
    pub payload: String,
}

impl CacheUpdated {
    pub fn new(refresher: &dyn CacheRefresher, message: &RefreshMessage) -> Self {
        Self {
            refresher_id: refresher.unique_id(),
            refresher_name: refresher.name().to_owned(),
            message_type: message.message_type,
            payload: message.payload.clone(),
        }
    }
}

/// Result of routing one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Applied,
    /// No refresher with that id is registered here.
    Ignored,
}

#[derive(Default)]
pub struct RefresherRegistryBuilder {
    refreshers: Vec<Arc<dyn CacheRefresher>>,
}

impl RefresherRegistryBuilder {
    /// Add a refresher. Duplicate ids are reported by `build`.
    pub fn register(mut self, refresher: Arc<dyn CacheRefresher>) -> Self {
        self.refreshers.push(refresher);
        self
    }

    /// Fails when two refreshers share an id.
    pub fn build(self) -> Result<RefresherRegistry, RefreshError> {
        let mut refreshers = HashMap::with_capacity(self.refreshers.len());
        for refresher in self.refreshers {
            let id = refresher.unique_id();
            if refreshers.contains_key(&id) {
                return Err(RefreshError::DuplicateRefresher {
                    id,
                    name: refresher.name().to_owned(),
                });
            }
            refreshers.insert(id, refresher);
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(RefresherRegistry { refreshers, events })
    }
}

pub struct RefresherRegistry {
    refreshers: HashMap<Uuid, Arc<dyn CacheRefresher>>,
    events: broadcast::Sender<CacheUpdated>,
}

impl RefresherRegistry {
    pub fn builder() -> RefresherRegistryBuilder {
        RefresherRegistryBuilder::default()
    }

    pub fn get(&self, id: Uuid) -> Option<&Arc<dyn CacheRefresher>> {
        self.refreshers.get(&id)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.refreshers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.refreshers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refreshers.is_empty()
    }

    /// Receive a `CacheUpdated` event for every message applied from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheUpdated> {
        self.events.subscribe()
    }

    /// Route a message to its refresher.
    #[instrument(
        skip(self, message),
        fields(refresher_id = %message.refresher_id, message_type = %message.message_type)
    )]
    pub async fn dispatch(&self, message: &RefreshMessage) -> Result<DispatchOutcome, RefreshError> {
        let Some(refresher) = self.refreshers.get(&message.refresher_id) else {
            counter!(METRIC_UNKNOWN).increment(1);
            debug!("Ignoring message for unregistered refresher");
            return Ok(DispatchOutcome::Ignored);
        };

        let result = match message.message_type {
            MessageType::RefreshAll => refresher.refresh_all().await,
            MessageType::RefreshById | MessageType::RefreshByInstance => {
                apply_ids(refresher.as_ref(), message, IdAction::Refresh).await
            }
            MessageType::RemoveById | MessageType::RemoveByInstance => {
                apply_ids(refresher.as_ref(), message, IdAction::Remove).await
            }
            MessageType::RefreshByPayload => {
                refresher
                    .refresh_from_payload(message.payload.as_bytes())
                    .await
            }
        };

        if let Err(RefreshError::Payload { .. }) = &result {
            counter!(METRIC_PAYLOAD_REJECTED).increment(1);
        }
        result?;

        // No subscribers is fine.
        let _ = self
            .events
            .send(CacheUpdated::new(refresher.as_ref(), message));
        Ok(DispatchOutcome::Applied)
    }
}

#[derive(Clone, Copy)]
enum IdAction {
    Refresh,
    Remove,
}

async fn apply_ids(
    refresher: &dyn CacheRefresher,
    message: &RefreshMessage,
    action: IdAction,
) -> Result<(), RefreshError> {
    for id in message.ids()? {
        match action {
            IdAction::Refresh => refresher.refresh(id).await?,
            IdAction::Remove => refresher.remove(id).await?,
        }
    }
    Ok(())
}

impl fmt::Debug for RefresherRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.refreshers.values().map(|r| r.name()).collect();
        names.sort_unstable();
        f.debug_struct("RefresherRegistry")
            .field("refreshers", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde::Deserialize;

    use super::*;
    use crate::cache::refresher::deserialize_payload;

    const SPY_ID: Uuid = Uuid::from_u128(0xE285DF34_0000_4000_8000_000000000001);

    #[derive(Debug, Deserialize)]
    struct SpyPayload {
        id: i32,
    }

    #[derive(Default)]
    struct SpyRefresher {
        calls: Mutex<Vec<String>>,
    }

    impl SpyRefresher {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls").clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().expect("calls").push(call);
        }
    }

    #[async_trait]
    impl CacheRefresher for SpyRefresher {
        fn unique_id(&self) -> Uuid {
            SPY_ID
        }

        fn name(&self) -> &str {
            "spy"
        }

        async fn refresh_all(&self) -> Result<(), RefreshError> {
            self.record("all".to_string());
            Ok(())
        }

        async fn refresh(&self, id: i32) -> Result<(), RefreshError> {
            self.record(format!("refresh:{id}"));
            Ok(())
        }

        async fn remove(&self, id: i32) -> Result<(), RefreshError> {
            self.record(format!("remove:{id}"));
            Ok(())
        }

        async fn refresh_from_payload(&self, payload: &[u8]) -> Result<(), RefreshError> {
            let payloads: Vec<SpyPayload> = deserialize_payload(SPY_ID, payload)?;
            let ids: Vec<String> = payloads.iter().map(|p| p.id.to_string()).collect();
            self.record(format!("payload:{}", ids.join(",")));
            Ok(())
        }
    }

    fn registry() -> (Arc<SpyRefresher>, RefresherRegistry) {
        let spy = Arc::new(SpyRefresher::default());
        let registry = RefresherRegistry::builder()
            .register(Arc::clone(&spy) as Arc<dyn CacheRefresher>)
            .build()
            .expect("registry");
        (spy, registry)
    }

    #[tokio::test]
    async fn payload_message_reaches_refresher() {
        let (spy, registry) = registry();
        let mut events = registry.subscribe();
        let message = RefreshMessage {
            refresher_id: SPY_ID,
            message_type: MessageType::RefreshByPayload,
            payload: r#"[{"id":7}]"#.to_string(),
        };

        let outcome = registry.dispatch(&message).await.expect("dispatch");

        assert_eq!(outcome, DispatchOutcome::Applied);
        assert_eq!(spy.calls(), vec!["payload:7"]);
        let event = events.recv().await.expect("event");
        assert_eq!(event.refresher_name, "spy");
        assert_eq!(event.message_type, MessageType::RefreshByPayload);
    }

    #[tokio::test]
    async fn unknown_refresher_is_ignored() {
        let (spy, registry) = registry();
        let message = RefreshMessage::refresh_all(Uuid::nil());

        let outcome = registry.dispatch(&message).await.expect("dispatch");

        assert_eq!(outcome, DispatchOutcome::Ignored);
        assert!(spy.calls().is_empty());
    }

    #[tokio::test]
    async fn id_messages_fan_out_per_id() {
        let (spy, registry) = registry();
        let refresh = RefreshMessage::by_ids(SPY_ID, MessageType::RefreshById, &[1, 2])
            .expect("encode");
        let remove = RefreshMessage::by_ids(SPY_ID, MessageType::RemoveByInstance, &[3])
            .expect("encode");

        registry.dispatch(&refresh).await.expect("refresh");
        registry.dispatch(&remove).await.expect("remove");
        registry
            .dispatch(&RefreshMessage::refresh_all(SPY_ID))
            .await
            .expect("all");

        assert_eq!(spy.calls(), vec!["refresh:1", "refresh:2", "remove:3", "all"]);
    }

    #[tokio::test]
    async fn malformed_payload_is_rejected_without_side_effects() {
        let (spy, registry) = registry();
        let mut events = registry.subscribe();
        let message = RefreshMessage {
            refresher_id: SPY_ID,
            message_type: MessageType::RefreshByPayload,
            payload: "[{\"id\":".to_string(),
        };

        let err = registry.dispatch(&message).await.expect_err("malformed");

        assert!(matches!(err, RefreshError::Payload { .. }));
        assert!(spy.calls().is_empty());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let result = RefresherRegistry::builder()
            .register(Arc::new(SpyRefresher::default()))
            .register(Arc::new(SpyRefresher::default()))
            .build();
        assert!(matches!(
            result,
            Err(RefreshError::DuplicateRefresher { id, .. }) if id == SPY_ID
        ));
    }
}
