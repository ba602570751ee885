//! Cache key definitions.
//!
//! Defines `ValueCacheKey` for converted property values held by the elements
//! cache, plus the hashing helper shared by the snapshot index.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use uuid::Uuid;

/// Identifies one converted property value in the elements cache.
///
/// A node's value is cached separately per culture and per preview mode, so
/// invalidating a property means removing both the preview and the
/// non-preview entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValueCacheKey {
    pub content_key: Uuid,
    pub alias: String,
    pub culture: Option<String>,
    pub preview: bool,
}

impl ValueCacheKey {
    /// `culture` is `None` for invariant values. `preview` selects the draft
    /// view of the node.
    pub fn new(
        content_key: Uuid,
        alias: impl Into<String>,
        culture: Option<&str>,
        preview: bool,
    ) -> Self {
        Self {
            content_key,
            alias: alias.into(),
            culture: culture.map(str::to_owned),
            preview,
        }
    }

    /// The key of the same value seen through the other preview mode.
    pub fn with_preview(&self, preview: bool) -> Self {
        Self {
            preview,
            ..self.clone()
        }
    }
}

impl fmt::Display for ValueCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.content_key,
            self.alias,
            self.culture.as_deref().unwrap_or("*"),
            if self.preview { "preview" } else { "published" }
        )
    }
}

// ============================================================================
// Hash Utilities
// ============================================================================

/// Compute a hash for any hashable value.
pub fn hash_value<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}
