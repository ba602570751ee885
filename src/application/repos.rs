//! Repository traits describing the collaborators the cache reads from.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::kits::ContentNodeKit;
use crate::domain::relations::Relation;
use crate::domain::types::{ContentKind, ContentType};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("resource not found")]
    NotFound,
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// The primary (relational) store that holds the authoritative content.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Load one node, or `None` when it no longer exists.
    async fn get_kit(&self, kind: ContentKind, id: i32)
    -> Result<Option<ContentNodeKit>, RepoError>;

    async fn get_kit_by_key(
        &self,
        kind: ContentKind,
        key: Uuid,
    ) -> Result<Option<ContentNodeKit>, RepoError>;

    /// Load a node and all its descendants.
    async fn get_branch(
        &self,
        kind: ContentKind,
        id: i32,
    ) -> Result<Vec<ContentNodeKit>, RepoError>;

    /// Load every node of a tree, used for seeding and full rebuilds.
    async fn get_all(&self, kind: ContentKind) -> Result<Vec<ContentNodeKit>, RepoError>;
}

/// Lookup of dependency relations between entities.
#[async_trait]
pub trait RelationService: Send + Sync {
    async fn get_by_parent_id(&self, id: i32) -> Result<Vec<Relation>, RepoError>;

    async fn get_by_child_id(&self, id: i32) -> Result<Vec<Relation>, RepoError>;
}

/// Source of document and media type definitions.
#[async_trait]
pub trait ContentTypeSource: Send + Sync {
    async fn get_content_type(&self, id: i32) -> Result<Option<ContentType>, RepoError>;

    async fn get_all(&self) -> Result<Vec<ContentType>, RepoError>;
}
