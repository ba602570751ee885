use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cache::refresher::RefreshMessage;

/// One batch of instructions as it travels between farm nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub id: Uuid,
    /// Identity of the sending node.
    pub origin: String,
    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: OffsetDateTime,
    pub messages: Vec<RefreshMessage>,
}

impl MessageEnvelope {
    /// A fresh envelope with a new id, stamped now.
    pub fn new(origin: impl Into<String>, messages: Vec<RefreshMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin: origin.into(),
            sent_at: OffsetDateTime::now_utc(),
            messages,
        }
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::cache::refresher::MessageType;

    #[test]
    fn envelope_wire_shape() {
        let envelope = MessageEnvelope {
            id: Uuid::from_u128(1),
            origin: "web-1".to_string(),
            sent_at: datetime!(2024-05-01 12:00:00 UTC),
            messages: vec![
                RefreshMessage::by_ids(Uuid::nil(), MessageType::RemoveById, &[4])
                    .expect("encode"),
            ],
        };
        insta::assert_snapshot!(
            serde_json::to_string(&envelope).expect("json"),
            @r#"{"id":"00000000-0000-0000-0000-000000000001","origin":"web-1","sentAt":"2024-05-01T12:00:00Z","messages":[{"refresherId":"00000000-0000-0000-0000-000000000000","messageType":"RemoveById","payload":"[4]"}]}"#
        );
    }
}
