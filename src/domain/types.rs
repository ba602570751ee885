//! Shared domain enumerations and content type definitions.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Which published tree a node belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Document,
    Media,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Document => "document",
            ContentKind::Media => "media",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle level of the hosting application.
///
/// Cache work only happens in `Run` and `Upgrade`; during `Install` or after a
/// failed boot there is nothing valid to cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeLevel {
    Install,
    Upgrade,
    Run,
    BootFailed,
}

impl RuntimeLevel {
    pub fn allows_cache_work(self) -> bool {
        matches!(self, RuntimeLevel::Run | RuntimeLevel::Upgrade)
    }

    fn to_u8(self) -> u8 {
        match self {
            RuntimeLevel::Install => 0,
            RuntimeLevel::Upgrade => 1,
            RuntimeLevel::Run => 2,
            RuntimeLevel::BootFailed => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => RuntimeLevel::Install,
            1 => RuntimeLevel::Upgrade,
            2 => RuntimeLevel::Run,
            _ => RuntimeLevel::BootFailed,
        }
    }
}

/// Shared, atomically updated runtime level.
#[derive(Debug)]
pub struct RuntimeState {
    level: AtomicU8,
}

impl RuntimeState {
    pub fn new(level: RuntimeLevel) -> Self {
        Self {
            level: AtomicU8::new(level.to_u8()),
        }
    }

    pub fn level(&self) -> RuntimeLevel {
        RuntimeLevel::from_u8(self.level.load(Ordering::Acquire))
    }

    pub fn set_level(&self, level: RuntimeLevel) {
        self.level.store(level.to_u8(), Ordering::Release);
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new(RuntimeLevel::Run)
    }
}

/// How long a resolved property value may be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyCacheLevel {
    /// Never cached; resolved on every read.
    None,
    /// Cached on the read view itself.
    Element,
    /// Cached in the shared elements cache until a related entity changes.
    Elements,
    /// Cached for the lifetime of one snapshot read.
    Snapshot,
}

/// A property definition on a content type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyType {
    pub alias: String,
    pub editor_alias: String,
    pub cache_level: PropertyCacheLevel,
    #[serde(default)]
    pub varies_by_culture: bool,
}

impl PropertyType {
    pub fn new(
        alias: impl Into<String>,
        editor_alias: impl Into<String>,
        cache_level: PropertyCacheLevel,
    ) -> Self {
        Self {
            alias: alias.into(),
            editor_alias: editor_alias.into(),
            cache_level,
            varies_by_culture: false,
        }
    }

    pub fn varying_by_culture(mut self) -> Self {
        self.varies_by_culture = true;
        self
    }
}

/// A document or media type definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentType {
    pub id: i32,
    pub alias: String,
    pub kind: ContentKind,
    pub property_types: Vec<PropertyType>,
}

impl ContentType {
    pub fn property_type(&self, alias: &str) -> Option<&PropertyType> {
        self.property_types.iter().find(|p| p.alias == alias)
    }

    /// Property types whose values live in the shared elements cache.
    pub fn elements_level_properties(&self) -> impl Iterator<Item = &PropertyType> {
        self.property_types
            .iter()
            .filter(|p| p.cache_level == PropertyCacheLevel::Elements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_level_gates_cache_work() {
        assert!(RuntimeLevel::Run.allows_cache_work());
        assert!(RuntimeLevel::Upgrade.allows_cache_work());
        assert!(!RuntimeLevel::Install.allows_cache_work());
        assert!(!RuntimeLevel::BootFailed.allows_cache_work());
    }

    #[test]
    fn runtime_state_round_trips_levels() {
        let state = RuntimeState::new(RuntimeLevel::Install);
        assert_eq!(state.level(), RuntimeLevel::Install);

        for level in [
            RuntimeLevel::Upgrade,
            RuntimeLevel::Run,
            RuntimeLevel::BootFailed,
        ] {
            state.set_level(level);
            assert_eq!(state.level(), level);
        }
    }

    #[test]
    fn elements_level_properties_filters_by_cache_level() {
        let content_type = ContentType {
            id: 10,
            alias: "article".to_string(),
            kind: ContentKind::Document,
            property_types: vec![
                PropertyType::new("title", "textbox", PropertyCacheLevel::Element),
                PropertyType::new("related", "picker", PropertyCacheLevel::Elements),
                PropertyType::new("body", "rte", PropertyCacheLevel::Snapshot),
            ],
        };

        let aliases: Vec<_> = content_type
            .elements_level_properties()
            .map(|p| p.alias.as_str())
            .collect();
        assert_eq!(aliases, vec!["related"]);
        assert!(content_type.property_type("body").is_some());
        assert!(content_type.property_type("missing").is_none());
    }
}
