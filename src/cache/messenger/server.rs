//! Farm messenger.
//!
//! Every instruction is applied on this node first, through the refresher
//! registry, and queued. `sync` merges the queue and sends it to the other
//! nodes. Inbound envelopes are routed through the same registry.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use metrics::counter;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cache::config::FarmConfig;
use crate::cache::error::RefreshError;
use crate::cache::lock::mutex_lock;
use crate::cache::refresher::{DispatchOutcome, MessageType, RefreshMessage, RefresherRegistry};

use super::envelope::MessageEnvelope;
use super::planner::SyncPlan;
use super::queue::InstructionQueue;
use super::transport::FarmTransport;

const SOURCE: &str = "cache::messenger::server";
const METRIC_SENT: &str = "pubcache_messenger_sent_total";

/// What one `sync` did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Queued messages drained.
    pub drained: usize,
    /// Messages left after merging.
    pub planned: usize,
    pub envelopes_sent: usize,
    pub envelopes_failed: usize,
}

/// What happened to an inbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Processed {
        applied: usize,
        ignored: usize,
        rejected: usize,
    },
    /// Sent by this node.
    FromSelf,
    /// Already processed.
    Duplicate,
}

pub struct ServerMessenger {
    identity: String,
    registry: Arc<RefresherRegistry>,
    queue: InstructionQueue,
    transport: Arc<dyn FarmTransport>,
    batch_limit: usize,
    seen: Mutex<LruCache<Uuid, ()>>,
    syncing: tokio::sync::Mutex<()>,
}

impl ServerMessenger {
    /// Build a messenger for this node.
    ///
    /// The queue starts empty. `config.batch_limit` caps the messages per
    /// envelope and `seen_message_limit` bounds the duplicate filter.
    pub fn new(
        config: &FarmConfig,
        registry: Arc<RefresherRegistry>,
        transport: Arc<dyn FarmTransport>,
    ) -> Self {
        Self {
            identity: config.server_identity.clone(),
            registry,
            queue: InstructionQueue::new(),
            transport,
            batch_limit: config.batch_limit.max(1),
            seen: Mutex::new(LruCache::new(config.seen_message_limit_non_zero())),
            syncing: tokio::sync::Mutex::new(()),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn registry(&self) -> &Arc<RefresherRegistry> {
        &self.registry
    }

    /// Messages waiting for the next sync.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Apply locally, then queue for the farm.
    ///
    /// A message the local refresher could not decode is not distributed.
    #[instrument(
        skip(self, message),
        fields(refresher_id = %message.refresher_id, message_type = %message.message_type)
    )]
    pub async fn deliver(&self, message: RefreshMessage) -> Result<DispatchOutcome, RefreshError> {
        let local = self.registry.dispatch(&message).await;
        match &local {
            Err(RefreshError::Payload { .. } | RefreshError::Unsupported { .. }) => {}
            Err(err) => {
                warn!(error = %err, "Local refresh failed; distributing anyway");
                self.queue.publish(message);
            }
            Ok(_) => self.queue.publish(message),
        }
        local
    }

    /// Refresh `ids` through `refresher_id` here and on every peer.
    ///
    /// The local refresh runs before this returns; the farm copy waits for
    /// the next `sync`.
    pub async fn queue_refresh(
        &self,
        refresher_id: Uuid,
        ids: &[i32],
    ) -> Result<DispatchOutcome, RefreshError> {
        self.deliver(id_message(refresher_id, MessageType::RefreshById, ids)?)
            .await
    }

    /// Remove `ids` through `refresher_id` here and on every peer.
    ///
    /// Same delivery rules as `queue_refresh`.
    pub async fn queue_remove(
        &self,
        refresher_id: Uuid,
        ids: &[i32],
    ) -> Result<DispatchOutcome, RefreshError> {
        self.deliver(id_message(refresher_id, MessageType::RemoveById, ids)?)
            .await
    }

    /// Rebuild everything `refresher_id` owns, locally and farm-wide.
    ///
    /// Once planned, this also replaces any earlier queued message for the
    /// same refresher.
    pub async fn queue_refresh_all(
        &self,
        refresher_id: Uuid,
    ) -> Result<DispatchOutcome, RefreshError> {
        self.deliver(RefreshMessage::refresh_all(refresher_id)).await
    }

    /// Refresh through `refresher_id` with refresher-specific payloads.
    ///
    /// Fails with `RefreshError::Payload` before anything runs if the
    /// payloads do not serialize.
    pub async fn queue_refresh_payload<T: Serialize>(
        &self,
        refresher_id: Uuid,
        payloads: &[T],
    ) -> Result<DispatchOutcome, RefreshError> {
        let message = RefreshMessage::by_payload(refresher_id, payloads).map_err(|source| {
            RefreshError::Payload {
                refresher_id,
                source,
            }
        })?;
        self.deliver(message).await
    }

    /// Merge the queue and send it to every peer.
    ///
    /// Failed sends are logged and dropped; a peer that misses an envelope
    /// stays stale until its next rebuild.
    #[instrument(skip(self), fields(identity = %self.identity))]
    pub async fn sync(&self) -> SyncReport {
        let _syncing = self.syncing.lock().await;
        let drained = self.queue.drain(usize::MAX);
        if drained.is_empty() {
            return SyncReport::default();
        }
        let mut report = SyncReport {
            drained: drained.len(),
            ..SyncReport::default()
        };
        if !self.transport.has_peers() {
            debug!(drained = report.drained, "No peers; dropping queued instructions");
            return report;
        }

        let plan = SyncPlan::from_messages(drained);
        report.planned = plan.messages.len();
        debug!(%plan, "Sync plan built");

        for batch in plan.batches(self.batch_limit) {
            let envelope = MessageEnvelope::new(self.identity.clone(), batch.to_vec());
            match self.transport.send(&envelope).await {
                Ok(peers) => {
                    report.envelopes_sent += 1;
                    counter!(METRIC_SENT).increment(batch.len() as u64);
                    debug!(envelope_id = %envelope.id, messages = batch.len(), peers, "Envelope sent");
                }
                Err(err) => {
                    report.envelopes_failed += 1;
                    warn!(
                        envelope_id = %envelope.id,
                        messages = batch.len(),
                        error = %err,
                        "Envelope send failed; peers stay stale until their next rebuild"
                    );
                }
            }
        }
        info!(
            drained = report.drained,
            planned = report.planned,
            sent = report.envelopes_sent,
            failed = report.envelopes_failed,
            "Cache instructions synced"
        );
        report
    }

    /// Apply an envelope from another node.
    ///
    /// Rejected messages are logged and skipped; the rest still apply.
    #[instrument(skip(self, envelope), fields(envelope_id = %envelope.id, origin = %envelope.origin))]
    pub async fn receive(&self, envelope: MessageEnvelope) -> ReceiveOutcome {
        if envelope.origin == self.identity {
            debug!("Ignoring envelope sent by this node");
            return ReceiveOutcome::FromSelf;
        }
        {
            let mut seen = mutex_lock(&self.seen, SOURCE, "receive");
            if seen.contains(&envelope.id) {
                debug!("Ignoring duplicate envelope");
                return ReceiveOutcome::Duplicate;
            }
            seen.put(envelope.id, ());
        }

        let (mut applied, mut ignored, mut rejected) = (0, 0, 0);
        for message in &envelope.messages {
            match self.registry.dispatch(message).await {
                Ok(DispatchOutcome::Applied) => applied += 1,
                Ok(DispatchOutcome::Ignored) => ignored += 1,
                Err(err) => {
                    rejected += 1;
                    warn!(
                        refresher_id = %message.refresher_id,
                        message_type = %message.message_type,
                        error = %err,
                        "Inbound cache instruction dropped"
                    );
                }
            }
        }
        ReceiveOutcome::Processed {
            applied,
            ignored,
            rejected,
        }
    }

    /// Sync every `interval` until `cancel` fires, then flush once more.
    pub fn spawn_sync_loop(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let messenger = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        messenger.sync().await;
                    }
                }
            }
            messenger.sync().await;
            info!(identity = %messenger.identity, "Cache sync loop stopped");
        })
    }
}

impl fmt::Debug for ServerMessenger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerMessenger")
            .field("identity", &self.identity)
            .field("queued", &self.queue.len())
            .field("batch_limit", &self.batch_limit)
            .field("has_peers", &self.transport.has_peers())
            .finish()
    }
}

fn id_message(
    refresher_id: Uuid,
    message_type: MessageType,
    ids: &[i32],
) -> Result<RefreshMessage, RefreshError> {
    RefreshMessage::by_ids(refresher_id, message_type, ids).map_err(|source| {
        RefreshError::Payload {
            refresher_id,
            source,
        }
    })
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::cache::error::TransportError;

    const SPY_ID: Uuid = Uuid::from_u128(0x51);

    #[derive(Default)]
    struct Spy {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl crate::cache::refresher::CacheRefresher for Spy {
        fn unique_id(&self) -> Uuid {
            SPY_ID
        }

        fn name(&self) -> &str {
            "spy"
        }

        async fn refresh_all(&self) -> Result<(), RefreshError> {
            self.calls.lock().expect("calls").push("all".to_string());
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

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<MessageEnvelope>>,
        fail: bool,
    }

    #[async_trait]
    impl FarmTransport for Recording {
        async fn send(&self, envelope: &MessageEnvelope) -> Result<usize, TransportError> {
            if self.fail {
                return Err(TransportError::request("http://peer", "connection refused"));
            }
            self.sent.lock().expect("sent").push(envelope.clone());
            Ok(1)
        }

        fn has_peers(&self) -> bool {
            true
        }
    }

    fn messenger(transport: Arc<Recording>, batch_limit: usize) -> (Arc<Spy>, ServerMessenger) {
        let spy = Arc::new(Spy::default());
        let registry = RefresherRegistry::builder()
            .register(Arc::clone(&spy) as Arc<dyn crate::cache::refresher::CacheRefresher>)
            .build()
            .expect("registry");
        let config = FarmConfig {
            batch_limit,
            ..FarmConfig::single_server("web-1")
        };
        let messenger = ServerMessenger::new(&config, Arc::new(registry), transport);
        (spy, messenger)
    }

    #[tokio::test]
    async fn queued_instructions_apply_locally_then_sync_merged() {
        let transport = Arc::new(Recording::default());
        let (spy, messenger) = messenger(Arc::clone(&transport), 10);

        messenger.queue_refresh(SPY_ID, &[1]).await.expect("refresh");
        messenger.queue_refresh(SPY_ID, &[2]).await.expect("refresh");
        messenger.queue_remove(SPY_ID, &[1]).await.expect("remove");

        assert_eq!(
            *spy.calls.lock().expect("calls"),
            vec!["refresh:1", "refresh:2", "remove:1"]
        );
        assert_eq!(messenger.queue_len(), 3);

        let report = messenger.sync().await;
        assert_eq!(report.drained, 3);
        assert_eq!(report.planned, 2);
        assert_eq!(report.envelopes_sent, 1);
        assert_eq!(messenger.queue_len(), 0);

        let sent = transport.sent.lock().expect("sent");
        assert_eq!(sent[0].origin, "web-1");
        let types: Vec<MessageType> = sent[0].messages.iter().map(|m| m.message_type).collect();
        assert_eq!(
            sent[0].messages[0],
            RefreshMessage::by_ids(SPY_ID, MessageType::RefreshById, &[1, 2]).expect("encode")
        );
        assert_eq!(types, vec![MessageType::RefreshById, MessageType::RemoveById]);
    }

    #[tokio::test]
    async fn failed_send_is_dropped_not_retried() {
        let transport = Arc::new(Recording {
            fail: true,
            ..Recording::default()
        });
        let (_spy, messenger) = messenger(transport, 1);
        messenger.queue_refresh_all(SPY_ID).await.expect("all");
        messenger
            .queue_refresh_all(Uuid::from_u128(0x99))
            .await
            .expect("unknown refresher is ignored locally");

        let report = messenger.sync().await;
        assert_eq!(report.envelopes_failed, 2);
        assert_eq!(messenger.queue_len(), 0);
        assert_eq!(messenger.sync().await, SyncReport::default());
    }

    #[tokio::test]
    async fn receive_filters_own_and_duplicate_envelopes() {
        let (spy, messenger) = messenger(Arc::new(Recording::default()), 10);
        let message =
            RefreshMessage::by_ids(SPY_ID, MessageType::RefreshById, &[7]).expect("encode");

        let own = MessageEnvelope::new("web-1", vec![message.clone()]);
        assert_eq!(messenger.receive(own).await, ReceiveOutcome::FromSelf);

        let remote = MessageEnvelope::new("web-2", vec![message]);
        assert_eq!(
            messenger.receive(remote.clone()).await,
            ReceiveOutcome::Processed {
                applied: 1,
                ignored: 0,
                rejected: 0
            }
        );
        assert_eq!(messenger.receive(remote).await, ReceiveOutcome::Duplicate);
        assert_eq!(*spy.calls.lock().expect("calls"), vec!["refresh:7"]);
        // Inbound messages are never re-queued.
        assert_eq!(messenger.queue_len(), 0);
    }

    #[tokio::test]
    async fn rejected_inbound_message_does_not_block_the_rest() {
        let (spy, messenger) = messenger(Arc::new(Recording::default()), 10);
        let envelope = MessageEnvelope::new(
            "web-2",
            vec![
                RefreshMessage {
                    refresher_id: SPY_ID,
                    message_type: MessageType::RefreshById,
                    payload: "not json".to_string(),
                },
                RefreshMessage::refresh_all(Uuid::nil()),
                RefreshMessage::by_ids(SPY_ID, MessageType::RemoveById, &[3]).expect("encode"),
            ],
        );

        assert_eq!(
            messenger.receive(envelope).await,
            ReceiveOutcome::Processed {
                applied: 1,
                ignored: 1,
                rejected: 1
            }
        );
        assert_eq!(*spy.calls.lock().expect("calls"), vec!["remove:3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_loop_flushes_on_tick_and_on_cancel() {
        let transport = Arc::new(Recording::default());
        let (_spy, messenger) = messenger(Arc::clone(&transport), 10);
        let messenger = Arc::new(messenger);
        let cancel = CancellationToken::new();
        let handle = messenger.spawn_sync_loop(Duration::from_secs(1), cancel.clone());

        messenger.queue_refresh(SPY_ID, &[1]).await.expect("refresh");
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(transport.sent.lock().expect("sent").len(), 1);

        messenger.queue_refresh(SPY_ID, &[2]).await.expect("refresh");
        cancel.cancel();
        handle.await.expect("loop exits");
        assert_eq!(transport.sent.lock().expect("sent").len(), 2);
    }
}
