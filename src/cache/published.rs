//! Read views over cached kits.
//!
//! `PublishedContent` exposes only read operations; editing goes through
//! `domain::entities::ContentEntity`. Property values are resolved through a
//! `PropertyValueResolver` and cached according to each property type's
//! cache level.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use crate::domain::kits::{ContentData, ContentNodeKit};
use crate::domain::types::{ContentKind, ContentType, PropertyCacheLevel, PropertyType};

use super::elements::ElementsCache;
use super::keys::ValueCacheKey;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::published";

/// Converts a stored source value into the value handed to readers.
pub trait PropertyValueResolver: Send + Sync {
    fn resolve(
        &self,
        content: &ContentNodeKit,
        property: &PropertyType,
        source: Option<&Value>,
        culture: Option<&str>,
        preview: bool,
    ) -> Value;
}

/// Hands the stored value through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughResolver;

impl PropertyValueResolver for PassThroughResolver {
    fn resolve(
        &self,
        _content: &ContentNodeKit,
        _property: &PropertyType,
        source: Option<&Value>,
        _culture: Option<&str>,
        _preview: bool,
    ) -> Value {
        source.cloned().unwrap_or(Value::Null)
    }
}

/// Content type definitions, keyed by id.
#[derive(Debug, Default)]
pub struct ContentTypeCache {
    types: DashMap<i32, Arc<ContentType>>,
}

impl ContentTypeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: i32) -> Option<Arc<ContentType>> {
        self.types.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn set(&self, content_type: ContentType) {
        self.types.insert(content_type.id, Arc::new(content_type));
    }

    pub fn remove(&self, id: i32) -> bool {
        self.types.remove(&id).is_some()
    }

    /// Replace every definition.
    pub fn replace_all(&self, types: impl IntoIterator<Item = ContentType>) {
        self.types.clear();
        for content_type in types {
            self.set(content_type);
        }
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Immutable read view of one cached node.
pub struct PublishedContent {
    kit: Arc<ContentNodeKit>,
    content_type: Option<Arc<ContentType>>,
    preview: bool,
    elements: Arc<ElementsCache>,
    resolver: Arc<dyn PropertyValueResolver>,
    memo: Mutex<HashMap<(String, Option<String>), Value>>,
}

impl PublishedContent {
    /// Build a view, or `None` when the kit has no data for the requested mode.
    pub fn from_kit(
        kit: Arc<ContentNodeKit>,
        content_type: Option<Arc<ContentType>>,
        preview: bool,
        elements: Arc<ElementsCache>,
        resolver: Arc<dyn PropertyValueResolver>,
    ) -> Option<Self> {
        kit.data(preview)?;
        Some(Self {
            kit,
            content_type,
            preview,
            elements,
            resolver,
            memo: Mutex::new(HashMap::new()),
        })
    }

    // Always `Some`: checked in `from_kit` and kits are immutable.
    fn data(&self) -> Option<&ContentData> {
        self.kit.data(self.preview)
    }

    pub fn kit(&self) -> &Arc<ContentNodeKit> {
        &self.kit
    }

    pub fn kind(&self) -> ContentKind {
        self.kit.kind
    }

    pub fn id(&self) -> i32 {
        self.kit.id()
    }

    pub fn key(&self) -> Uuid {
        self.kit.key()
    }

    pub fn parent_id(&self) -> i32 {
        self.kit.node.parent_id
    }

    pub fn level(&self) -> i32 {
        self.kit.node.level
    }

    pub fn path(&self) -> &str {
        &self.kit.node.path
    }

    pub fn sort_order(&self) -> i32 {
        self.kit.node.sort_order
    }

    pub fn is_preview(&self) -> bool {
        self.preview
    }

    pub fn content_type(&self) -> Option<&ContentType> {
        self.content_type.as_deref()
    }

    /// Node name for `culture`, falling back to the invariant name.
    pub fn name(&self, culture: Option<&str>) -> &str {
        self.data().map_or("", |data| data.name_for(culture))
    }

    /// URL segment published for `culture`, if any.
    pub fn url_segment(&self, culture: &str) -> Option<&str> {
        self.data()?
            .culture_infos
            .get(culture)
            .and_then(|info| info.url_segment.as_deref())
    }

    pub fn cultures(&self) -> impl Iterator<Item = &str> {
        self.data()
            .into_iter()
            .flat_map(|data| data.culture_infos.keys().map(String::as_str))
    }

    pub fn template_id(&self) -> Option<i32> {
        self.data()?.template_id
    }

    /// Whether a raw value is stored, before any resolving.
    pub fn has_value(&self, alias: &str, culture: Option<&str>) -> bool {
        self.data()
            .and_then(|data| data.value(alias, culture))
            .is_some()
    }

    /// The resolved value of a property, cached per its cache level.
    ///
    /// Properties missing from the content type are returned as stored.
    pub fn value(&self, alias: &str, culture: Option<&str>) -> Value {
        let Some(property) = self
            .content_type
            .as_deref()
            .and_then(|t| t.property_type(alias))
        else {
            return self
                .data()
                .and_then(|data| data.value(alias, culture))
                .cloned()
                .unwrap_or(Value::Null);
        };
        let culture = if property.varies_by_culture {
            culture
        } else {
            None
        };

        match property.cache_level {
            PropertyCacheLevel::None => self.resolve(property, culture),
            PropertyCacheLevel::Element | PropertyCacheLevel::Snapshot => {
                let memo_key = (alias.to_owned(), culture.map(str::to_owned));
                if let Some(value) = mutex_lock(&self.memo, SOURCE, "memo_get").get(&memo_key) {
                    return value.clone();
                }
                let value = self.resolve(property, culture);
                mutex_lock(&self.memo, SOURCE, "memo_set").insert(memo_key, value.clone());
                value
            }
            PropertyCacheLevel::Elements => {
                let key = ValueCacheKey::new(self.key(), alias, culture, self.preview);
                self.elements
                    .get_or_insert_with(&key, || self.resolve(property, culture))
            }
        }
    }

    fn resolve(&self, property: &PropertyType, culture: Option<&str>) -> Value {
        let source = self
            .data()
            .and_then(|data| data.value(&property.alias, culture));
        self.resolver
            .resolve(&self.kit, property, source, culture, self.preview)
    }
}

impl std::fmt::Debug for PublishedContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishedContent")
            .field("id", &self.id())
            .field("key", &self.key())
            .field("preview", &self.preview)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::cache::config::CacheConfig;
    use crate::domain::kits::{CultureVariation, PropertyValue, test_kit};

    #[derive(Default)]
    struct CountingResolver {
        calls: AtomicUsize,
    }

    impl PropertyValueResolver for CountingResolver {
        fn resolve(
            &self,
            _content: &ContentNodeKit,
            _property: &PropertyType,
            source: Option<&Value>,
            _culture: Option<&str>,
            _preview: bool,
        ) -> Value {
            self.calls.fetch_add(1, Ordering::SeqCst);
            source.cloned().unwrap_or(Value::Null)
        }
    }

    fn content_type() -> Arc<ContentType> {
        Arc::new(ContentType {
            id: 1,
            alias: "article".to_string(),
            kind: ContentKind::Document,
            property_types: vec![
                PropertyType::new("live", "text", PropertyCacheLevel::None),
                PropertyType::new("element", "text", PropertyCacheLevel::Element),
                PropertyType::new("related", "picker", PropertyCacheLevel::Elements),
                PropertyType::new("title", "text", PropertyCacheLevel::Snapshot)
                    .varying_by_culture(),
            ],
        })
    }

    fn kit() -> Arc<ContentNodeKit> {
        let mut kit = test_kit(ContentKind::Document, 10, "Article");
        let data = kit.published.as_mut().expect("published");
        for alias in ["live", "element", "related"] {
            data.properties
                .insert(alias.to_string(), vec![PropertyValue::invariant(json!(alias))]);
        }
        data.properties.insert(
            "title".to_string(),
            vec![
                PropertyValue::invariant(json!("Hello")),
                PropertyValue::for_culture("da-DK", json!("Hej")),
            ],
        );
        data.culture_infos.insert(
            "da-DK".to_string(),
            CultureVariation {
                name: "Artikel".to_string(),
                url_segment: Some("artikel".to_string()),
                date: time::OffsetDateTime::now_utc(),
                is_draft: false,
            },
        );
        Arc::new(kit)
    }

    fn view(
        elements: &Arc<ElementsCache>,
        resolver: &Arc<CountingResolver>,
    ) -> PublishedContent {
        PublishedContent::from_kit(
            kit(),
            Some(content_type()),
            false,
            Arc::clone(elements),
            Arc::clone(resolver) as Arc<dyn PropertyValueResolver>,
        )
        .expect("published view")
    }

    #[test]
    fn cache_levels_control_recomputation() {
        let elements = Arc::new(ElementsCache::new(&CacheConfig::default()));
        let resolver = Arc::new(CountingResolver::default());
        let view = view(&elements, &resolver);

        view.value("live", None);
        view.value("live", None);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);

        view.value("element", None);
        view.value("element", None);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 3);

        view.value("related", None);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 4);
        // A second view over the same kit shares the elements cache.
        let other = PublishedContent::from_kit(
            kit(),
            Some(content_type()),
            false,
            Arc::clone(&elements),
            Arc::clone(&resolver) as Arc<dyn PropertyValueResolver>,
        )
        .expect("view");
        assert_eq!(other.value("related", None), json!("related"));
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn culture_variant_values_and_names() {
        let elements = Arc::new(ElementsCache::new(&CacheConfig::default()));
        let resolver = Arc::new(CountingResolver::default());
        let view = view(&elements, &resolver);

        assert_eq!(view.value("title", Some("da-DK")), json!("Hej"));
        assert_eq!(view.value("title", None), json!("Hello"));
        assert_eq!(view.name(Some("da-DK")), "Artikel");
        assert_eq!(view.name(None), "Article");
        assert_eq!(view.url_segment("da-DK"), Some("artikel"));
        assert_eq!(view.cultures().collect::<Vec<_>>(), vec!["da-DK"]);
    }

    #[test]
    fn unpublished_kit_has_no_published_view() {
        let mut kit = test_kit(ContentKind::Document, 3, "Draft only");
        kit.published = None;
        let elements = Arc::new(ElementsCache::new(&CacheConfig::default()));
        let kit = Arc::new(kit);

        assert!(
            PublishedContent::from_kit(
                Arc::clone(&kit),
                None,
                false,
                Arc::clone(&elements),
                Arc::new(PassThroughResolver),
            )
            .is_none()
        );
        let draft = PublishedContent::from_kit(kit, None, true, elements, Arc::new(PassThroughResolver))
            .expect("draft view");
        assert_eq!(draft.name(None), "Draft only");
    }

    #[test]
    fn content_type_cache_replace_all() {
        let cache = ContentTypeCache::new();
        cache.set((*content_type()).clone());
        assert_eq!(cache.get(1).map(|t| t.alias.clone()).as_deref(), Some("article"));

        cache.replace_all(Vec::new());
        assert!(cache.is_empty());
        assert!(!cache.remove(1));
    }
}
