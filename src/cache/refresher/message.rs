//! Refresh instructions and their JSON payload encoding.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::error::RefreshError;

/// What a refresh message asks the target refresher to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    RefreshByInstance,
    RemoveByInstance,
    RefreshByPayload,
    RefreshById,
    RemoveById,
    RefreshAll,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RefreshByInstance => "RefreshByInstance",
            Self::RemoveByInstance => "RemoveByInstance",
            Self::RefreshByPayload => "RefreshByPayload",
            Self::RefreshById => "RefreshById",
            Self::RemoveById => "RemoveById",
            Self::RefreshAll => "RefreshAll",
        }
    }

    /// Whether the payload is a JSON array of node ids.
    pub fn carries_ids(self) -> bool {
        matches!(
            self,
            Self::RefreshById | Self::RemoveById | Self::RefreshByInstance | Self::RemoveByInstance
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One instruction for one refresher, identical on every node of the farm.
///
/// `payload` is the JSON text of an array: node ids for the id and instance
/// message types, the refresher's DTOs for `RefreshByPayload`, and `[]` for
/// `RefreshAll`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshMessage {
    pub refresher_id: Uuid,
    pub message_type: MessageType,
    pub payload: String,
}

impl RefreshMessage {
    /// Rebuild everything the refresher owns. The payload is `[]`.
    pub fn refresh_all(refresher_id: Uuid) -> Self {
        Self {
            refresher_id,
            message_type: MessageType::RefreshAll,
            payload: "[]".to_string(),
        }
    }

    /// An id or instance message carrying `ids` as a JSON array.
    ///
    /// `message_type` should be one for which `carries_ids` holds.
    pub fn by_ids(
        refresher_id: Uuid,
        message_type: MessageType,
        ids: &[i32],
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            refresher_id,
            message_type,
            payload: serialize_payload(ids)?,
        })
    }

    /// A `RefreshByPayload` message carrying the serialized `payloads`.
    pub fn by_payload<T: Serialize>(
        refresher_id: Uuid,
        payloads: &[T],
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            refresher_id,
            message_type: MessageType::RefreshByPayload,
            payload: serialize_payload(payloads)?,
        })
    }

    /// Node ids carried by an id or instance message.
    pub fn ids(&self) -> Result<Vec<i32>, RefreshError> {
        deserialize_payload(self.refresher_id, self.payload.as_bytes())
    }
}

/// Encode payloads as the JSON array sent on the wire.
pub fn serialize_payload<T: Serialize>(payloads: &[T]) -> Result<String, serde_json::Error> {
    serde_json::to_string(payloads)
}

/// Decode a JSON array of payloads addressed to `refresher_id`.
pub fn deserialize_payload<T: DeserializeOwned>(
    refresher_id: Uuid,
    payload: &[u8],
) -> Result<Vec<T>, RefreshError> {
    serde_json::from_slice(payload).map_err(|source| RefreshError::Payload {
        refresher_id,
        source,
    })
}
