//! Mutable domain entities handed to the cache by the editing side.
//!
//! `ContentEntity` is the full entity with mutation methods; the cache never
//! stores it. It is converted into an immutable `ContentNodeKit` on refresh.

use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use super::error::DomainError;
use super::kits::{
    ContentData, ContentNode, ContentNodeKit, CultureVariation, PropertyValue, ROOT_ID,
};
use super::types::ContentKind;

/// A document or media item as edited in the back office.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentEntity {
    kind: ContentKind,
    id: i32,
    key: Uuid,
    parent_id: i32,
    path: String,
    sort_order: i32,
    trashed: bool,
    content_type_id: i32,
    created_at: OffsetDateTime,
    edited: ContentData,
    published: Option<ContentData>,
}

impl ContentEntity {
    /// Create a new, unpublished entity.
    ///
    /// `path` must be the comma separated ancestor chain ending with `id`.
    pub fn new(
        kind: ContentKind,
        id: i32,
        key: Uuid,
        parent_id: i32,
        path: impl Into<String>,
        content_type_id: i32,
        name: impl Into<String>,
    ) -> Result<Self, DomainError> {
        if id <= 0 {
            return Err(DomainError::validation("content id must be positive"));
        }
        let path = path.into();
        let last = path
            .rsplit(',')
            .next()
            .and_then(|segment| segment.trim().parse::<i32>().ok());
        if last != Some(id) {
            return Err(DomainError::validation(format!(
                "path `{path}` must end with the node id {id}"
            )));
        }

        Ok(Self {
            kind,
            id,
            key,
            parent_id,
            path,
            sort_order: 0,
            trashed: false,
            content_type_id,
            created_at: OffsetDateTime::now_utc(),
            edited: ContentData::new(name, 1),
            published: None,
        })
    }

    pub fn kind(&self) -> ContentKind {
        self.kind
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn key(&self) -> Uuid {
        self.key
    }

    pub fn is_published(&self) -> bool {
        self.published.is_some()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.edited.name = name.into();
        self.touch();
    }

    pub fn set_sort_order(&mut self, sort_order: i32) {
        self.sort_order = sort_order;
    }

    pub fn set_trashed(&mut self, trashed: bool) {
        self.trashed = trashed;
    }

    pub fn set_culture_name(&mut self, culture: impl Into<String>, name: impl Into<String>) {
        self.edited.culture_infos.insert(
            culture.into(),
            CultureVariation {
                name: name.into(),
                url_segment: None,
                date: OffsetDateTime::now_utc(),
                is_draft: true,
            },
        );
        self.touch();
    }

    /// Set a property value, replacing any value for the same culture.
    pub fn set_value(&mut self, alias: impl Into<String>, culture: Option<&str>, value: Value) {
        let values = self.edited.properties.entry(alias.into()).or_default();
        values.retain(|v| v.culture.as_deref() != culture || v.segment.is_some());
        values.push(PropertyValue {
            culture: culture.map(str::to_string),
            segment: None,
            value,
        });
        self.touch();
    }

    /// Copy the edited version into the published slot.
    pub fn publish(&mut self) {
        let mut published = self.edited.clone();
        for info in published.culture_infos.values_mut() {
            info.is_draft = false;
        }
        self.published = Some(published);
    }

    pub fn unpublish(&mut self) {
        self.published = None;
    }

    /// Build the immutable kit the cache stores for this entity.
    pub fn to_kit(&self) -> ContentNodeKit {
        let level = self
            .path
            .split(',')
            .filter_map(|segment| segment.trim().parse::<i32>().ok())
            .filter(|id| *id != ROOT_ID)
            .count();

        // Media has no draft/published split: the edited data is what readers see.
        let published = match self.kind {
            ContentKind::Document => self.published.clone(),
            ContentKind::Media => Some(self.edited.clone()),
        };

        ContentNodeKit {
            kind: self.kind,
            node: ContentNode {
                id: self.id,
                key: self.key,
                parent_id: self.parent_id,
                level: i32::try_from(level).unwrap_or(i32::MAX),
                path: self.path.clone(),
                sort_order: self.sort_order,
                trashed: self.trashed,
                content_type_id: self.content_type_id,
                created_at: self.created_at,
            },
            draft: Some(self.edited.clone()),
            published,
        }
    }

    fn touch(&mut self) {
        self.edited.version_date = OffsetDateTime::now_utc();
        if self.published.is_some() {
            self.edited.version_id += 1;
        }
    }
}
