//! Content node kits: the immutable, serializable record of one cached node.
//!
//! A kit is never mutated once built. Refreshing a node produces a new kit that
//! replaces the old one in the next generation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use super::types::ContentKind;

/// Identifier of the virtual root every top-level node hangs under.
pub const ROOT_ID: i32 = -1;

/// One stored value of a property, optionally scoped to a culture and segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub culture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment: Option<String>,
    pub value: Value,
}

impl PropertyValue {
    pub fn invariant(value: Value) -> Self {
        Self {
            culture: None,
            segment: None,
            value,
        }
    }

    pub fn for_culture(culture: impl Into<String>, value: Value) -> Self {
        Self {
            culture: Some(culture.into()),
            segment: None,
            value,
        }
    }
}

/// Per-culture metadata of a variant node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CultureVariation {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_segment: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
    #[serde(default)]
    pub is_draft: bool,
}

/// The property data of one version (draft or published) of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentData {
    pub name: String,
    pub version_id: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub version_date: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<i32>,
    #[serde(default)]
    pub properties: BTreeMap<String, Vec<PropertyValue>>,
    #[serde(default)]
    pub culture_infos: BTreeMap<String, CultureVariation>,
}

impl ContentData {
    pub fn new(name: impl Into<String>, version_id: i32) -> Self {
        Self {
            name: name.into(),
            version_id,
            version_date: OffsetDateTime::now_utc(),
            template_id: None,
            properties: BTreeMap::new(),
            culture_infos: BTreeMap::new(),
        }
    }

    /// Source value of a property for a culture, falling back to the invariant value.
    pub fn value(&self, alias: &str, culture: Option<&str>) -> Option<&Value> {
        let values = self.properties.get(alias)?;
        if let Some(culture) = culture
            && let Some(found) = values
                .iter()
                .find(|v| v.culture.as_deref() == Some(culture) && v.segment.is_none())
        {
            return Some(&found.value);
        }
        values
            .iter()
            .find(|v| v.culture.is_none() && v.segment.is_none())
            .map(|v| &v.value)
    }

    /// Name of the node for a culture, falling back to the invariant name.
    pub fn name_for(&self, culture: Option<&str>) -> &str {
        culture
            .and_then(|c| self.culture_infos.get(c))
            .map_or(self.name.as_str(), |info| info.name.as_str())
    }
}

/// Structural (tree) metadata of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentNode {
    pub id: i32,
    pub key: Uuid,
    pub parent_id: i32,
    pub level: i32,
    /// Comma separated ancestor ids, root first, ending with this node's id.
    pub path: String,
    pub sort_order: i32,
    #[serde(default)]
    pub trashed: bool,
    pub content_type_id: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl ContentNode {
    /// Ancestor-or-self ids parsed from the path, root excluded.
    pub fn path_ids(&self) -> impl Iterator<Item = i32> + '_ {
        self.path
            .split(',')
            .filter_map(|segment| segment.trim().parse::<i32>().ok())
            .filter(|id| *id != ROOT_ID)
    }

    /// True when this node is `ancestor_id` or one of its descendants.
    pub fn is_in_branch(&self, ancestor_id: i32) -> bool {
        self.path_ids().any(|id| id == ancestor_id)
    }
}

/// Immutable snapshot of one content or media node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentNodeKit {
    pub kind: ContentKind,
    pub node: ContentNode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft: Option<ContentData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<ContentData>,
}

impl ContentNodeKit {
    pub fn id(&self) -> i32 {
        self.node.id
    }

    pub fn key(&self) -> Uuid {
        self.node.key
    }

    pub fn content_type_id(&self) -> i32 {
        self.node.content_type_id
    }

    /// Whether the node is visible to non-preview readers.
    pub fn is_published(&self) -> bool {
        self.published.is_some() && !self.node.trashed
    }

    /// The data a reader should see: the draft when previewing, the published
    /// version otherwise. Draft reads fall back to the published version.
    pub fn data(&self, preview: bool) -> Option<&ContentData> {
        if preview {
            self.draft.as_ref().or(self.published.as_ref())
        } else if self.node.trashed {
            None
        } else {
            self.published.as_ref()
        }
    }
}

/// A published top-level kit with a key derived from its id.
#[cfg(test)]
pub(crate) fn test_kit(kind: ContentKind, id: i32, name: &str) -> ContentNodeKit {
    let data = ContentData::new(name, 1);
    ContentNodeKit {
        kind,
        node: ContentNode {
            id,
            key: Uuid::from_u128(id as u128),
            parent_id: ROOT_ID,
            level: 1,
            path: format!("{ROOT_ID},{id}"),
            sort_order: 0,
            trashed: false,
            content_type_id: 1,
            created_at: OffsetDateTime::now_utc(),
        },
        draft: Some(data.clone()),
        published: Some(data),
    }
}
