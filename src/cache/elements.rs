//! Elements-level value cache.
//!
//! Holds converted property values that stay valid until an entity they
//! depend on changes. Entries are bounded by an LRU and cleared either one
//! property at a time by relation invalidation, or wholesale when a content
//! type changes.
//!
//! Every entry is also indexed by its owning `(content_key, alias)`, so a
//! property is cleared for every culture and preview mode it was ever read
//! in, not only the cultures the current kit carries.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use lru::LruCache;
use metrics::counter;
use serde_json::Value;
use uuid::Uuid;

use super::config::CacheConfig;
use super::keys::ValueCacheKey;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::elements";
const METRIC_HIT: &str = "pubcache_elements_hit_total";
const METRIC_MISS: &str = "pubcache_elements_miss_total";
const METRIC_EVICT: &str = "pubcache_elements_evict_total";

type Owner = (Uuid, String);

struct Entries {
    values: LruCache<ValueCacheKey, Value>,
    by_owner: HashMap<Owner, HashSet<ValueCacheKey>>,
}

impl Entries {
    fn owner(key: &ValueCacheKey) -> Owner {
        (key.content_key, key.alias.clone())
    }

    fn forget(&mut self, key: &ValueCacheKey) {
        let owner = Self::owner(key);
        if let Some(keys) = self.by_owner.get_mut(&owner) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_owner.remove(&owner);
            }
        }
    }
}

pub struct ElementsCache {
    entries: RwLock<Entries>,
}

impl ElementsCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: RwLock::new(Entries {
                values: LruCache::new(config.elements_cache_limit_non_zero()),
                by_owner: HashMap::new(),
            }),
        }
    }

    /// Look up a value, counting the hit or miss. A hit marks the entry as
    /// most recently used.
    pub fn get(&self, key: &ValueCacheKey) -> Option<Value> {
        let found = rw_write(&self.entries, SOURCE, "get")
            .values
            .get(key)
            .cloned();
        if found.is_some() {
            counter!(METRIC_HIT).increment(1);
        } else {
            counter!(METRIC_MISS).increment(1);
        }
        found
    }

    /// Store a value, returning the key evicted to make room, if any.
    ///
    /// Replacing the value of a key already present is not an eviction.
    pub fn insert(&self, key: ValueCacheKey, value: Value) -> Option<ValueCacheKey> {
        let mut entries = rw_write(&self.entries, SOURCE, "insert");
        entries
            .by_owner
            .entry(Entries::owner(&key))
            .or_default()
            .insert(key.clone());
        match entries.values.push(key.clone(), value) {
            Some((evicted, _)) if evicted != key => {
                entries.forget(&evicted);
                counter!(METRIC_EVICT).increment(1);
                Some(evicted)
            }
            _ => None,
        }
    }

    /// Return the cached value or compute, store and return it.
    ///
    /// The lock is not held while `compute` runs, so two racing readers may
    /// both compute; the later insert wins.
    pub fn get_or_insert_with<F>(&self, key: &ValueCacheKey, compute: F) -> Value
    where
        F: FnOnce() -> Value,
    {
        if let Some(value) = self.get(key) {
            return value;
        }
        let value = compute();
        self.insert(key.clone(), value.clone());
        value
    }

    /// Whether a value is cached, without touching recency or counters.
    pub fn contains(&self, key: &ValueCacheKey) -> bool {
        rw_read(&self.entries, SOURCE, "contains")
            .values
            .contains(key)
    }

    /// Drop one entry. Returns whether it was present.
    pub fn remove(&self, key: &ValueCacheKey) -> bool {
        let mut entries = rw_write(&self.entries, SOURCE, "remove");
        entries.forget(key);
        entries.values.pop(key).is_some()
    }

    /// Drop every entry of one property of one node, across all cultures and
    /// both preview modes. Returns the number of entries removed.
    pub fn remove_property(&self, content_key: Uuid, alias: &str) -> usize {
        let mut entries = rw_write(&self.entries, SOURCE, "remove_property");
        let Some(keys) = entries.by_owner.remove(&(content_key, alias.to_owned())) else {
            return 0;
        };
        keys.iter()
            .filter(|key| entries.values.pop(*key).is_some())
            .count()
    }

    pub fn clear(&self) {
        let mut entries = rw_write(&self.entries, SOURCE, "clear");
        entries.values.clear();
        entries.by_owner.clear();
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
