//! Sync plan generation.
//!
//! Merges queued instructions into the smallest equivalent set of messages
//! before they are sent to the farm.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde_json::Value;
use uuid::Uuid;

use crate::cache::refresher::{MessageType, RefreshMessage};

use super::queue::QueuedMessage;

/// How adjacent messages may be folded together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeKind {
    Refresh,
    Remove,
    Payload,
}

/// Run of adjacent, mergeable messages for one refresher.
struct Run {
    refresher_id: Uuid,
    kind: MergeKind,
    ids: Vec<i32>,
    seen: HashSet<i32>,
    items: Vec<Value>,
}

impl Run {
    fn new(refresher_id: Uuid, kind: MergeKind) -> Self {
        Self {
            refresher_id,
            kind,
            ids: Vec::new(),
            seen: HashSet::new(),
            items: Vec::new(),
        }
    }

    fn accepts(&self, refresher_id: Uuid, kind: MergeKind) -> bool {
        self.refresher_id == refresher_id && self.kind == kind
    }

    fn push_ids(&mut self, ids: Vec<i32>) {
        for id in ids {
            if self.seen.insert(id) {
                self.ids.push(id);
            }
        }
    }

    fn into_message(self) -> RefreshMessage {
        let (message_type, payload) = match self.kind {
            MergeKind::Refresh => (MessageType::RefreshById, Value::from(self.ids)),
            MergeKind::Remove => (MessageType::RemoveById, Value::from(self.ids)),
            MergeKind::Payload => (MessageType::RefreshByPayload, Value::Array(self.items)),
        };
        RefreshMessage {
            refresher_id: self.refresher_id,
            message_type,
            payload: payload.to_string(),
        }
    }
}

/// Messages to send, in queue order.
///
/// - a `RefreshAll` drops every earlier message for its refresher
/// - adjacent id messages of one refresher and one action are unioned
/// - adjacent payload messages of one refresher are concatenated
///
/// Messages are never reordered, so a receiver applies the same sequence the
/// origin applied. A message whose payload cannot be parsed is passed on
/// unchanged and the receiver rejects it.
#[derive(Debug, Default)]
pub struct SyncPlan {
    pub messages: Vec<RefreshMessage>,
    /// Queued messages that went into the plan.
    pub received: usize,
    /// Messages dropped because a later `RefreshAll` covers them.
    pub superseded: usize,
}

impl fmt::Display for SyncPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SyncPlan {{ received: {}, messages: {}, superseded: {} }}",
            self.received,
            self.messages.len(),
            self.superseded,
        )
    }
}

impl SyncPlan {
    /// Plan a drained queue for sending.
    ///
    /// Messages keep their queue order. Adjacent id messages of one refresher
    /// and kind are merged, as are adjacent payload messages. A `RefreshAll`
    /// replaces every earlier message for its refresher.
    pub fn from_messages(queued: Vec<QueuedMessage>) -> Self {
        let mut plan = Self::default();
        let mut seen_ids = HashSet::new();

        let mut queued: Vec<_> = queued
            .into_iter()
            .filter(|q| seen_ids.insert(q.id))
            .collect();
        queued.sort_by_key(|q| q.epoch);
        plan.received = queued.len();

        let mut last_refresh_all: HashMap<Uuid, usize> = HashMap::new();
        for (position, q) in queued.iter().enumerate() {
            if q.message.message_type == MessageType::RefreshAll {
                last_refresh_all.insert(q.message.refresher_id, position);
            }
        }

        let mut run: Option<Run> = None;
        for (position, q) in queued.into_iter().enumerate() {
            let message = q.message;
            let refresher_id = message.refresher_id;
            if last_refresh_all
                .get(&refresher_id)
                .is_some_and(|&last| position < last)
            {
                plan.superseded += 1;
                continue;
            }

            let parsed = match message.message_type {
                MessageType::RefreshAll => None,
                MessageType::RefreshById | MessageType::RefreshByInstance => message
                    .ids()
                    .ok()
                    .map(|ids| (MergeKind::Refresh, ids, Vec::new())),
                MessageType::RemoveById | MessageType::RemoveByInstance => message
                    .ids()
                    .ok()
                    .map(|ids| (MergeKind::Remove, ids, Vec::new())),
                MessageType::RefreshByPayload => {
                    serde_json::from_str::<Vec<Value>>(&message.payload)
                        .ok()
                        .map(|items| (MergeKind::Payload, Vec::new(), items))
                }
            };

            let Some((kind, ids, items)) = parsed else {
                plan.flush(run.take());
                plan.messages.push(message);
                continue;
            };
            if !run
                .as_ref()
                .is_some_and(|current| current.accepts(refresher_id, kind))
            {
                plan.flush(run.replace(Run::new(refresher_id, kind)));
            }
            if let Some(current) = run.as_mut() {
                current.push_ids(ids);
                current.items.extend(items);
            }
        }
        plan.flush(run);
        plan
    }

    fn flush(&mut self, run: Option<Run>) {
        if let Some(run) = run {
            self.messages.push(run.into_message());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Split into envelopes of at most `limit` messages.
    pub fn batches(&self, limit: usize) -> impl Iterator<Item = &[RefreshMessage]> {
        self.messages.chunks(limit.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: Uuid = Uuid::from_u128(0xA);
    const B: Uuid = Uuid::from_u128(0xB);

    fn queued(messages: Vec<RefreshMessage>) -> Vec<QueuedMessage> {
        messages
            .into_iter()
            .enumerate()
            .map(|(epoch, message)| QueuedMessage::new(message, epoch as u64))
            .collect()
    }

    fn ids(refresher_id: Uuid, message_type: MessageType, ids: &[i32]) -> RefreshMessage {
        RefreshMessage::by_ids(refresher_id, message_type, ids).expect("encode")
    }

    fn payload(refresher_id: Uuid, json: &str) -> RefreshMessage {
        RefreshMessage {
            refresher_id,
            message_type: MessageType::RefreshByPayload,
            payload: json.to_string(),
        }
    }

    #[test]
    fn adjacent_id_messages_are_unioned() {
        let plan = SyncPlan::from_messages(queued(vec![
            ids(A, MessageType::RefreshById, &[1, 2]),
            ids(A, MessageType::RefreshByInstance, &[2, 3]),
            ids(B, MessageType::RefreshById, &[9]),
            ids(A, MessageType::RefreshById, &[4]),
        ]));

        assert_eq!(plan.received, 4);
        assert_eq!(
            plan.messages,
            vec![
                ids(A, MessageType::RefreshById, &[1, 2, 3]),
                ids(B, MessageType::RefreshById, &[9]),
                ids(A, MessageType::RefreshById, &[4]),
            ]
        );
    }

    #[test]
    fn refresh_and_remove_keep_their_order() {
        let plan = SyncPlan::from_messages(queued(vec![
            ids(A, MessageType::RemoveById, &[5]),
            ids(A, MessageType::RefreshById, &[5, 6]),
            ids(A, MessageType::RemoveById, &[6]),
        ]));

        assert_eq!(
            plan.messages,
            vec![
                ids(A, MessageType::RemoveById, &[5]),
                ids(A, MessageType::RefreshById, &[5, 6]),
                ids(A, MessageType::RemoveById, &[6]),
            ]
        );
    }

    #[test]
    fn payload_and_id_messages_for_one_node_keep_their_order() {
        let plan = SyncPlan::from_messages(queued(vec![
            payload(A, r#"[{"id":5,"changeTypes":"remove"}]"#),
            ids(A, MessageType::RefreshById, &[5]),
            payload(A, r#"[{"id":5,"changeTypes":"remove"}]"#),
            ids(A, MessageType::RefreshById, &[5]),
        ]));

        assert_eq!(
            plan.messages,
            vec![
                payload(A, r#"[{"id":5,"changeTypes":"remove"}]"#),
                ids(A, MessageType::RefreshById, &[5]),
                payload(A, r#"[{"id":5,"changeTypes":"remove"}]"#),
                ids(A, MessageType::RefreshById, &[5]),
            ]
        );
    }

    #[test]
    fn refresh_all_supersedes_earlier_messages_only() {
        let plan = SyncPlan::from_messages(queued(vec![
            ids(A, MessageType::RefreshById, &[1]),
            payload(A, r#"[{"id":2}]"#),
            ids(B, MessageType::RemoveById, &[4]),
            RefreshMessage::refresh_all(A),
            ids(A, MessageType::RemoveById, &[3]),
        ]));

        assert_eq!(plan.superseded, 2);
        assert_eq!(
            plan.messages,
            vec![
                ids(B, MessageType::RemoveById, &[4]),
                RefreshMessage::refresh_all(A),
                ids(A, MessageType::RemoveById, &[3]),
            ]
        );
        assert_eq!(
            plan.to_string(),
            "SyncPlan { received: 5, messages: 3, superseded: 2 }"
        );
    }

    #[test]
    fn adjacent_payloads_are_concatenated_and_bad_ones_split_the_run() {
        let plan = SyncPlan::from_messages(queued(vec![
            payload(A, r#"[{"id":1}]"#),
            payload(A, r#"[{"id":2},{"id":3}]"#),
            payload(A, "[{\"id\":"),
            payload(A, r#"[{"id":4}]"#),
        ]));

        assert_eq!(
            plan.messages,
            vec![
                payload(A, r#"[{"id":1},{"id":2},{"id":3}]"#),
                payload(A, "[{\"id\":"),
                payload(A, r#"[{"id":4}]"#),
            ]
        );
    }

    #[test]
    fn duplicate_queue_entries_are_dropped() {
        let entry = QueuedMessage::new(ids(A, MessageType::RefreshById, &[1]), 0);
        let plan = SyncPlan::from_messages(vec![entry.clone(), entry]);
        assert_eq!(plan.received, 1);
        assert_eq!(plan.messages.len(), 1);
    }

    #[test]
    fn batches_respect_limit() {
        let plan = SyncPlan::from_messages(queued(
            (0..5u128)
                .map(|n| RefreshMessage::refresh_all(Uuid::from_u128(n)))
                .collect(),
        ));
        let sizes: Vec<usize> = plan.batches(2).map(<[RefreshMessage]>::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(plan.batches(0).count(), 5);
    }
}
