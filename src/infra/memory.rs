//! In-process collaborators.
//!
//! Back the cache with plain maps for single-process installs, demos and
//! tests. Each can be switched offline to exercise the degraded paths.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::application::repos::{ContentSource, ContentTypeSource, RelationService, RepoError};
use crate::cache::TransportError;
use crate::cache::lock::{rw_read, rw_write};
use crate::cache::messenger::{FarmTransport, MessageEnvelope, ReceiveOutcome, ServerMessenger};
use crate::domain::kits::ContentNodeKit;
use crate::domain::relations::Relation;
use crate::domain::types::{ContentKind, ContentType};

const SOURCE: &str = "infra::memory";

fn check_online(offline: &AtomicBool, what: &str) -> Result<(), RepoError> {
    if offline.load(Ordering::Acquire) {
        return Err(RepoError::Unavailable(format!("{what} is offline")));
    }
    Ok(())
}

/// Kits ordered parents first, then by sort order.
fn ordered(mut kits: Vec<ContentNodeKit>) -> Vec<ContentNodeKit> {
    kits.sort_by_key(|kit| (kit.node.level, kit.node.sort_order, kit.id()));
    kits
}

#[derive(Debug, Default)]
pub struct MemoryContentSource {
    kits: DashMap<(ContentKind, i32), ContentNodeKit>,
    offline: AtomicBool,
}

impl MemoryContentSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kits(kits: impl IntoIterator<Item = ContentNodeKit>) -> Self {
        let source = Self::new();
        for kit in kits {
            source.upsert(kit);
        }
        source
    }

    pub fn upsert(&self, kit: ContentNodeKit) {
        self.kits.insert((kit.kind, kit.id()), kit);
    }

    pub fn remove(&self, kind: ContentKind, id: i32) -> Option<ContentNodeKit> {
        self.kits.remove(&(kind, id)).map(|(_, kit)| kit)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.kits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kits.is_empty()
    }

    fn collect(&self, keep: impl Fn(&ContentNodeKit) -> bool) -> Vec<ContentNodeKit> {
        ordered(
            self.kits
                .iter()
                .filter(|entry| keep(entry.value()))
                .map(|entry| entry.value().clone())
                .collect(),
        )
    }
}

#[async_trait]
impl ContentSource for MemoryContentSource {
    async fn get_kit(&self, kind: ContentKind, id: i32) -> Result<Option<ContentNodeKit>, RepoError> {
        check_online(&self.offline, "content source")?;
        Ok(self.kits.get(&(kind, id)).map(|entry| entry.value().clone()))
    }

    async fn get_kit_by_key(
        &self,
        kind: ContentKind,
        key: Uuid,
    ) -> Result<Option<ContentNodeKit>, RepoError> {
        check_online(&self.offline, "content source")?;
        Ok(self
            .kits
            .iter()
            .find(|entry| entry.value().kind == kind && entry.value().key() == key)
            .map(|entry| entry.value().clone()))
    }

    async fn get_branch(&self, kind: ContentKind, id: i32) -> Result<Vec<ContentNodeKit>, RepoError> {
        check_online(&self.offline, "content source")?;
        Ok(self.collect(|kit| kit.kind == kind && kit.node.is_in_branch(id)))
    }

    async fn get_all(&self, kind: ContentKind) -> Result<Vec<ContentNodeKit>, RepoError> {
        check_online(&self.offline, "content source")?;
        Ok(self.collect(|kit| kit.kind == kind))
    }
}

#[derive(Debug, Default)]
pub struct MemoryRelationService {
    relations: RwLock<Vec<Relation>>,
    offline: AtomicBool,
}

impl MemoryRelationService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_relations(relations: impl IntoIterator<Item = Relation>) -> Self {
        Self {
            relations: RwLock::new(relations.into_iter().collect()),
            offline: AtomicBool::new(false),
        }
    }

    /// Record a relation; duplicates are ignored.
    pub fn relate(&self, relation: Relation) {
        let mut relations = rw_write(&self.relations, SOURCE, "relate");
        if !relations.contains(&relation) {
            relations.push(relation);
        }
    }

    /// Drop every relation touching `id`.
    pub fn forget(&self, id: i32) {
        rw_write(&self.relations, SOURCE, "forget")
            .retain(|r| r.parent_id != id && r.child_id != id);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }
}

#[async_trait]
impl RelationService for MemoryRelationService {
    async fn get_by_parent_id(&self, id: i32) -> Result<Vec<Relation>, RepoError> {
        check_online(&self.offline, "relation service")?;
        Ok(rw_read(&self.relations, SOURCE, "get_by_parent_id")
            .iter()
            .filter(|r| r.parent_id == id)
            .cloned()
            .collect())
    }

    async fn get_by_child_id(&self, id: i32) -> Result<Vec<Relation>, RepoError> {
        check_online(&self.offline, "relation service")?;
        Ok(rw_read(&self.relations, SOURCE, "get_by_child_id")
            .iter()
            .filter(|r| r.child_id == id)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct MemoryContentTypeSource {
    types: DashMap<i32, ContentType>,
}

impl MemoryContentTypeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_types(types: impl IntoIterator<Item = ContentType>) -> Self {
        let source = Self::new();
        for content_type in types {
            source.upsert(content_type);
        }
        source
    }

    pub fn upsert(&self, content_type: ContentType) {
        self.types.insert(content_type.id, content_type);
    }

    pub fn remove(&self, id: i32) -> Option<ContentType> {
        self.types.remove(&id).map(|(_, content_type)| content_type)
    }
}

#[async_trait]
impl ContentTypeSource for MemoryContentTypeSource {
    async fn get_content_type(&self, id: i32) -> Result<Option<ContentType>, RepoError> {
        Ok(self.types.get(&id).map(|entry| entry.value().clone()))
    }

    async fn get_all(&self) -> Result<Vec<ContentType>, RepoError> {
        let mut types: Vec<ContentType> =
            self.types.iter().map(|entry| entry.value().clone()).collect();
        types.sort_by_key(|t| t.id);
        Ok(types)
    }
}

/// Loopback transport connecting messengers that live in one process.
///
/// Every node shares one farm as its transport. Dropped messengers are
/// skipped.
#[derive(Debug, Default)]
pub struct MemoryFarm {
    nodes: RwLock<Vec<Weak<ServerMessenger>>>,
}

impl MemoryFarm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, messenger: &Arc<ServerMessenger>) {
        rw_write(&self.nodes, SOURCE, "farm_register").push(Arc::downgrade(messenger));
    }

    fn live_nodes(&self) -> Vec<Arc<ServerMessenger>> {
        rw_read(&self.nodes, SOURCE, "farm_nodes")
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

#[async_trait]
impl FarmTransport for MemoryFarm {
    async fn send(&self, envelope: &MessageEnvelope) -> Result<usize, TransportError> {
        let mut accepted = 0;
        for node in self.live_nodes() {
            if node.identity() == envelope.origin {
                continue;
            }
            if let ReceiveOutcome::Processed { .. } = node.receive(envelope.clone()).await {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    fn has_peers(&self) -> bool {
        self.live_nodes().len() > 1
    }
}
