//! Cache configuration.
//!
//! Controls the snapshot stores, the fast-restart local store and the
//! elements cache via the `[cache]` section of `pubcache.toml`, and farm
//! messaging via `[farm]`.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use url::Url;
use uuid::Uuid;

// Default values for cache configuration
const DEFAULT_LOCAL_STORE_DIR: &str = "cache-data";
const DEFAULT_ELEMENTS_CACHE_LIMIT: usize = 10_000;
const DEFAULT_GENERATION_WARN_THRESHOLD: usize = 16;
const DEFAULT_SEED_CANCEL_CHECK_EVERY: usize = 1024;
const DEFAULT_SYNC_INTERVAL_MS: u64 = 2_000;
const DEFAULT_BATCH_LIMIT: usize = 100;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_SEEN_MESSAGE_LIMIT: usize = 1_024;

/// Version tag of the kit serialization format written to local stores.
///
/// Bump whenever `ContentNodeKit`'s serialized shape changes; stores written
/// with another tag are treated as absent and rebuilt from the primary source.
pub const KIT_SERIALIZER_VERSION: u32 = 1;

/// Cache configuration from `pubcache.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Persist kits locally for fast warm restarts.
    pub enable_local_store: bool,
    /// Directory holding the local store files.
    pub local_store_dir: PathBuf,
    /// Serializer version tag written to and expected from local stores.
    pub serializer_version: u32,
    /// Maximum entries in the elements value cache.
    pub elements_cache_limit: usize,
    /// Live generation count above which a warning is logged.
    pub generation_warn_threshold: usize,
    /// Number of kits loaded between cancellation checks while seeding.
    pub seed_cancel_check_every: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable_local_store: true,
            local_store_dir: PathBuf::from(DEFAULT_LOCAL_STORE_DIR),
            serializer_version: KIT_SERIALIZER_VERSION,
            elements_cache_limit: DEFAULT_ELEMENTS_CACHE_LIMIT,
            generation_warn_threshold: DEFAULT_GENERATION_WARN_THRESHOLD,
            seed_cancel_check_every: DEFAULT_SEED_CANCEL_CHECK_EVERY,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enable_local_store: settings.enable_local_store,
            local_store_dir: settings.local_store_dir.clone(),
            serializer_version: settings.serializer_version,
            elements_cache_limit: settings.elements_cache_limit.get(),
            generation_warn_threshold: settings.generation_warn_threshold.get(),
            seed_cancel_check_every: settings.seed_cancel_check_every.get(),
        }
    }
}

impl CacheConfig {
    /// Returns the elements cache limit as NonZeroUsize, clamping to 1 if zero.
    pub fn elements_cache_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.elements_cache_limit).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the seed cancellation stride, clamping to 1 if zero.
    pub fn seed_cancel_check_every_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.seed_cancel_check_every).unwrap_or(NonZeroUsize::MIN)
    }

    /// Path of the local store file for one tree.
    pub fn local_store_path(&self, file_name: &str) -> PathBuf {
        self.local_store_dir.join(file_name)
    }
}

/// Farm messaging configuration.
#[derive(Debug, Clone)]
pub struct FarmConfig {
    /// Identity stamped on outgoing envelopes. Must differ between nodes.
    pub server_identity: String,
    /// Inbound instruction endpoints of the other nodes.
    pub peers: Vec<Url>,
    /// Interval of the background sync loop.
    pub sync_interval: Duration,
    /// Maximum messages per envelope.
    pub batch_limit: usize,
    /// Timeout of one peer request.
    pub request_timeout: Duration,
    /// Envelope ids remembered for duplicate detection.
    pub seen_message_limit: usize,
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            server_identity: format!("node-{}", Uuid::new_v4().simple()),
            peers: Vec::new(),
            sync_interval: Duration::from_millis(DEFAULT_SYNC_INTERVAL_MS),
            batch_limit: DEFAULT_BATCH_LIMIT,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            seen_message_limit: DEFAULT_SEEN_MESSAGE_LIMIT,
        }
    }
}

impl From<&crate::config::FarmSettings> for FarmConfig {
    fn from(settings: &crate::config::FarmSettings) -> Self {
        Self {
            server_identity: settings.server_identity.clone(),
            peers: settings.peers.clone(),
            sync_interval: Duration::from_millis(settings.sync_interval_ms.get()),
            batch_limit: settings.batch_limit.get(),
            request_timeout: Duration::from_millis(settings.request_timeout_ms.get()),
            seen_message_limit: settings.seen_message_limit.get(),
        }
    }
}

impl FarmConfig {
    pub fn single_server(server_identity: impl Into<String>) -> Self {
        Self {
            server_identity: server_identity.into(),
            ..Default::default()
        }
    }

    pub fn seen_message_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.seen_message_limit).unwrap_or(NonZeroUsize::MIN)
    }
}
