//! Outbound instruction queue.
//!
//! Messages applied on this node wait here until the next sync sends them to
//! the rest of the farm.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::gauge;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::cache::lock::mutex_lock;
use crate::cache::refresher::RefreshMessage;

const SOURCE: &str = "cache::messenger::queue";
const METRIC_QUEUE_LEN: &str = "pubcache_messenger_queue_len";

/// Monotonic position of a message in the queue.
pub type Epoch = u64;

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub id: Uuid,
    pub epoch: Epoch,
    pub message: RefreshMessage,
    pub queued_at: OffsetDateTime,
}

impl QueuedMessage {
    pub fn new(message: RefreshMessage, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            message,
            queued_at: OffsetDateTime::now_utc(),
        }
    }
}

pub struct InstructionQueue {
    queue: Mutex<VecDeque<QueuedMessage>>,
    epoch_counter: AtomicU64,
}

impl InstructionQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            epoch_counter: AtomicU64::new(0),
        }
    }

    fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Append `message` with the next epoch.
    pub fn publish(&self, message: RefreshMessage) {
        let queued = QueuedMessage::new(message, self.next_epoch());
        debug!(
            queued_id = %queued.id,
            epoch = queued.epoch,
            refresher_id = %queued.message.refresher_id,
            message_type = %queued.message.message_type,
            "Cache instruction queued"
        );
        let mut queue = mutex_lock(&self.queue, SOURCE, "publish");
        queue.push_back(queued);
        gauge!(METRIC_QUEUE_LEN).set(queue.len() as f64);
    }

    /// Drain up to `limit` messages in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<QueuedMessage> {
        let mut queue = mutex_lock(&self.queue, SOURCE, "drain");
        let count = limit.min(queue.len());
        let drained = queue.drain(..count).collect();
        gauge!(METRIC_QUEUE_LEN).set(queue.len() as f64);
        drained
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.queue, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything queued without sending it.
    pub fn clear(&self) {
        let mut queue = mutex_lock(&self.queue, SOURCE, "clear");
        queue.clear();
        gauge!(METRIC_QUEUE_LEN).set(0.0);
    }
}

impl Default for InstructionQueue {
    fn default() -> Self {
        Self::new()
    }
}
