use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::application::repos::RepoError;

use super::refresher::MessageType;

/// Failures of the local fast-restart store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("local store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("local store record could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("local store `{path}` is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("local store serializer version {found} does not match {expected}")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("local store `{path}` does not exist")]
    Missing { path: PathBuf },
    #[error("a transaction is already open on the local store")]
    TransactionActive,
}

impl StoreError {
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether the store should be discarded and rebuilt from the primary source.
    pub fn requires_rebuild(&self) -> bool {
        matches!(
            self,
            Self::Corrupt { .. } | Self::VersionMismatch { .. } | Self::Missing { .. }
        )
    }
}

/// Failures while seeding a snapshot store.
#[derive(Debug, Error)]
pub enum SeedError {
    #[error("seeding was cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("primary source failed during seed: {0}")]
    Source(#[from] RepoError),
    #[error("seed task failed: {0}")]
    Task(String),
}

/// Failures of the refresher framework.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("no refresher registered for {0}")]
    UnknownRefresher(Uuid),
    #[error("refresher `{name}` ({id}) is registered twice")]
    DuplicateRefresher { id: Uuid, name: String },
    #[error("payload for refresher {refresher_id} could not be deserialized: {source}")]
    Payload {
        refresher_id: Uuid,
        #[source]
        source: serde_json::Error,
    },
    #[error("refresher {refresher_id} does not handle {message_type}")]
    Unsupported {
        refresher_id: Uuid,
        message_type: MessageType,
    },
    #[error("primary source failed during refresh: {0}")]
    Source(#[from] RepoError),
    #[error(transparent)]
    Service(#[from] CacheServiceError),
}

/// Failures of a farm transport send.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("envelope could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("request to {peer} failed: {message}")]
    Request { peer: String, message: String },
    #[error("peer {peer} answered with status {status}")]
    Status { peer: String, status: u16 },
}

impl TransportError {
    pub fn request(peer: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Request {
            peer: peer.into(),
            message: message.to_string(),
        }
    }
}

/// Failures surfaced by the document and media cache services.
#[derive(Debug, Error)]
pub enum CacheServiceError {
    #[error("primary source failed: {0}")]
    Source(#[from] RepoError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Seed(#[from] SeedError),
    #[error("background task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for CacheServiceError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

impl From<tokio::task::JoinError> for SeedError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}
