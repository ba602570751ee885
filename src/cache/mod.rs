//! Published content cache.
//!
//! Two in-memory trees (documents and media) served from immutable
//! generations, a local fast-restart store per tree, an elements value cache
//! invalidated through the relation graph, and refresher messages that keep
//! every node of a farm in step.
//!
//! ## Configuration
//!
//! Controlled via `pubcache.toml`:
//!
//! ```toml
//! [cache]
//! enable_local_store = true
//! local_store_dir = "cache-data"
//! elements_cache_limit = 10000
//!
//! [farm]
//! server_identity = "web-1"
//! peers = ["http://web-2:8080"]
//! # ... see config.rs for all options
//! ```

mod config;
mod context;
mod elements;
mod error;
mod invalidation;
mod keys;
pub(crate) mod lock;
pub mod messenger;
mod notifications;
mod persistent;
mod published;
pub mod refresher;
mod service;
pub mod snapshot;

pub use config::{CacheConfig, FarmConfig, KIT_SERIALIZER_VERSION};
pub use context::{CacheContext, CacheContextBuilder, Collaborators, StartReport};
pub use elements::ElementsCache;
pub use error::{CacheServiceError, RefreshError, SeedError, StoreError, TransportError};
pub use invalidation::{ElementsInvalidator, InvalidationOutcome};
pub use keys::{ValueCacheKey, hash_value};
pub use notifications::{CacheNotification, CacheNotificationHandler};
pub use persistent::{KitTransaction, PersistentKeyStore};
pub use published::{
    ContentTypeCache, PassThroughResolver, PropertyValueResolver, PublishedContent,
};
pub use service::{
    DocumentCacheService, MediaCacheService, PublishedCacheService, SeedOutcome, ViewFactory,
};
pub use snapshot::{KitChange, Snapshot, SnapshotContentStore};
