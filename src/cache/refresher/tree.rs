//! Document and media refreshers.
//!
//! Both trees share one implementation; they differ only in id, name and the
//! tree they reload. Node data is always re-read from the primary source, so
//! a message carries ids and change flags, never content.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::application::repos::ContentSource;
use crate::cache::error::RefreshError;
use crate::cache::notifications::{CacheNotification, CacheNotificationHandler};
use crate::domain::types::ContentKind;

use super::{CacheRefresher, deserialize_payload};

pub const CONTENT_REFRESHER_ID: Uuid = Uuid::from_u128(0x900A4FBE_DF3C_41E6_BB77_BE896CD158EA);
pub const MEDIA_REFRESHER_ID: Uuid = Uuid::from_u128(0xB29286DD_2D40_4DDB_B325_681226589FEC);

/// What happened to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    RefreshNode,
    RefreshBranch,
    RefreshAll,
    Remove,
}

/// One entry of a tree refresher payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeChangePayload {
    pub id: i32,
    #[serde(default)]
    pub key: Uuid,
    pub change_types: ChangeType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub published_cultures: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unpublished_cultures: Vec<String>,
}

impl TreeChangePayload {
    pub fn new(id: i32, key: Uuid, change_types: ChangeType) -> Self {
        Self {
            id,
            key,
            change_types,
            published_cultures: Vec::new(),
            unpublished_cultures: Vec::new(),
        }
    }

    /// Record which cultures the change published and unpublished.
    pub fn with_cultures(mut self, published: Vec<String>, unpublished: Vec<String>) -> Self {
        self.published_cultures = published;
        self.unpublished_cultures = unpublished;
        self
    }
}

pub struct TreeCacheRefresher {
    id: Uuid,
    name: &'static str,
    kind: ContentKind,
    source: Arc<dyn ContentSource>,
    notifications: Arc<CacheNotificationHandler>,
}

impl TreeCacheRefresher {
    /// The document tree refresher, registered under `CONTENT_REFRESHER_ID`.
    pub fn content(
        source: Arc<dyn ContentSource>,
        notifications: Arc<CacheNotificationHandler>,
    ) -> Self {
        Self {
            id: CONTENT_REFRESHER_ID,
            name: "ContentCacheRefresher",
            kind: ContentKind::Document,
            source,
            notifications,
        }
    }

    /// The media tree refresher, registered under `MEDIA_REFRESHER_ID`.
    pub fn media(
        source: Arc<dyn ContentSource>,
        notifications: Arc<CacheNotificationHandler>,
    ) -> Self {
        Self {
            id: MEDIA_REFRESHER_ID,
            name: "MediaCacheRefresher",
            kind: ContentKind::Media,
            source,
            notifications,
        }
    }

    pub fn kind(&self) -> ContentKind {
        self.kind
    }

    async fn refresh_branch(&self, id: i32) -> Result<(), RefreshError> {
        let kits = self.source.get_branch(self.kind, id).await?;
        if kits.is_empty() {
            debug!(kind = %self.kind, id, "Branch root is gone; removing");
            return self.remove(id).await;
        }
        self.notifications
            .handle(CacheNotification::BranchRefreshed {
                kind: self.kind,
                root_id: id,
                kits,
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CacheRefresher for TreeCacheRefresher {
    fn unique_id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> &str {
        self.name
    }

    async fn refresh_all(&self) -> Result<(), RefreshError> {
        let outcome = self.notifications.rebuild(self.kind).await?;
        info!(kind = %self.kind, ?outcome, "Tree rebuilt");
        Ok(())
    }

    async fn refresh(&self, id: i32) -> Result<(), RefreshError> {
        let notification = match self.source.get_kit(self.kind, id).await? {
            Some(kit) => CacheNotification::Refreshed(kit),
            None => CacheNotification::Deleted {
                kind: self.kind,
                id,
            },
        };
        self.notifications.handle(notification).await?;
        Ok(())
    }

    async fn remove(&self, id: i32) -> Result<(), RefreshError> {
        self.notifications
            .handle(CacheNotification::Deleted {
                kind: self.kind,
                id,
            })
            .await?;
        Ok(())
    }

    /// A `refresh_all` entry supersedes every other entry of the payload.
    async fn refresh_from_payload(&self, payload: &[u8]) -> Result<(), RefreshError> {
        let changes: Vec<TreeChangePayload> = deserialize_payload(self.id, payload)?;
        if changes
            .iter()
            .any(|change| change.change_types == ChangeType::RefreshAll)
        {
            return self.refresh_all().await;
        }
        for change in changes {
            match change.change_types {
                ChangeType::RefreshNode => self.refresh(change.id).await?,
                ChangeType::RefreshBranch => self.refresh_branch(change.id).await?,
                ChangeType::Remove => self.remove(change.id).await?,
                ChangeType::RefreshAll => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::refresher::serialize_payload;

    #[test]
    fn payload_wire_shape() {
        let payloads = vec![
            TreeChangePayload::new(5, Uuid::nil(), ChangeType::RefreshBranch)
                .with_cultures(vec!["da-DK".to_string()], Vec::new()),
            TreeChangePayload::new(6, Uuid::nil(), ChangeType::Remove),
        ];
        insta::assert_snapshot!(
            serialize_payload(&payloads).expect("serialize"),
            @r#"[{"id":5,"key":"00000000-0000-0000-0000-000000000000","changeTypes":"refresh_branch","publishedCultures":["da-DK"]},{"id":6,"key":"00000000-0000-0000-0000-000000000000","changeTypes":"remove"}]"#
        );
    }

    #[test]
    fn minimal_payload_defaults_key_and_cultures() {
        let parsed: Vec<TreeChangePayload> = deserialize_payload(
            CONTENT_REFRESHER_ID,
            br#"[{"id":7,"changeTypes":"refresh_node"}]"#,
        )
        .expect("parse");
        assert_eq!(
            parsed,
            vec![TreeChangePayload::new(7, Uuid::nil(), ChangeType::RefreshNode)]
        );
    }

    #[test]
    fn unknown_change_type_is_rejected() {
        let err = deserialize_payload::<TreeChangePayload>(
            MEDIA_REFRESHER_ID,
            br#"[{"id":7,"changeTypes":"explode"}]"#,
        )
        .expect_err("unknown change type");
        assert!(matches!(
            err,
            RefreshError::Payload { refresher_id, .. } if refresher_id == MEDIA_REFRESHER_ID
        ));
    }
}
