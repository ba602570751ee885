//! Configuration layer: typed settings with layered precedence (file → env).

use std::{
    num::{NonZeroU64, NonZeroUsize},
    path::{Path, PathBuf},
    str::FromStr,
};

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;
use uuid::Uuid;

use crate::cache::KIT_SERIALIZER_VERSION;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "pubcache";
const ENV_PREFIX: &str = "PUBCACHE";
const DEFAULT_LOCAL_STORE_DIR: &str = "cache-data";
const DEFAULT_ELEMENTS_CACHE_LIMIT: u64 = 10_000;
const DEFAULT_GENERATION_WARN_THRESHOLD: u64 = 16;
const DEFAULT_SEED_CANCEL_CHECK_EVERY: u64 = 1_024;
const DEFAULT_SYNC_INTERVAL_MS: u64 = 2_000;
const DEFAULT_BATCH_LIMIT: u64 = 100;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_SEEN_MESSAGE_LIMIT: u64 = 1_024;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub farm: FarmSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enable_local_store: bool,
    pub local_store_dir: PathBuf,
    pub serializer_version: u32,
    pub elements_cache_limit: NonZeroUsize,
    pub generation_warn_threshold: NonZeroUsize,
    pub seed_cancel_check_every: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct FarmSettings {
    pub server_identity: String,
    pub peers: Vec<Url>,
    pub sync_interval_ms: NonZeroU64,
    pub batch_limit: NonZeroUsize,
    pub request_timeout_ms: NonZeroU64,
    pub seen_message_limit: NonZeroUsize,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence
/// (`config/default` → `pubcache` → `path` → `PUBCACHE__SECTION__KEY`).
pub fn load(path: Option<&Path>) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = path {
        builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("farm.peers")
            .try_parsing(true),
    );

    let raw: RawSettings = builder.build()?.try_deserialize()?;
    Settings::from_raw(raw)
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            cache,
            farm,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;
        let farm = build_farm_settings(farm)?;

        Ok(Self {
            logging,
            cache,
            farm,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let local_store_dir = cache
        .local_store_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCAL_STORE_DIR));
    if local_store_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "cache.local_store_dir",
            "must not be empty",
        ));
    }

    let serializer_version = cache.serializer_version.unwrap_or(KIT_SERIALIZER_VERSION);
    if serializer_version == 0 {
        return Err(LoadError::invalid(
            "cache.serializer_version",
            "must be greater than zero",
        ));
    }

    Ok(CacheSettings {
        enable_local_store: cache.enable_local_store.unwrap_or(true),
        local_store_dir,
        serializer_version,
        elements_cache_limit: non_zero_usize(
            cache
                .elements_cache_limit
                .unwrap_or(DEFAULT_ELEMENTS_CACHE_LIMIT),
            "cache.elements_cache_limit",
        )?,
        generation_warn_threshold: non_zero_usize(
            cache
                .generation_warn_threshold
                .unwrap_or(DEFAULT_GENERATION_WARN_THRESHOLD),
            "cache.generation_warn_threshold",
        )?,
        seed_cancel_check_every: non_zero_usize(
            cache
                .seed_cancel_check_every
                .unwrap_or(DEFAULT_SEED_CANCEL_CHECK_EVERY),
            "cache.seed_cancel_check_every",
        )?,
    })
}

fn build_farm_settings(farm: RawFarmSettings) -> Result<FarmSettings, LoadError> {
    let server_identity = match farm.server_identity {
        Some(identity) => {
            let trimmed = identity.trim();
            if trimmed.is_empty() {
                return Err(LoadError::invalid(
                    "farm.server_identity",
                    "must not be blank",
                ));
            }
            trimmed.to_string()
        }
        None => generated_identity(),
    };

    let peers = farm
        .peers
        .unwrap_or_default()
        .iter()
        .map(|peer| parse_peer(peer))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(FarmSettings {
        server_identity,
        peers,
        sync_interval_ms: non_zero_u64(
            farm.sync_interval_ms.unwrap_or(DEFAULT_SYNC_INTERVAL_MS),
            "farm.sync_interval_ms",
        )?,
        batch_limit: non_zero_usize(
            farm.batch_limit.unwrap_or(DEFAULT_BATCH_LIMIT),
            "farm.batch_limit",
        )?,
        request_timeout_ms: non_zero_u64(
            farm.request_timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
            "farm.request_timeout_ms",
        )?,
        seen_message_limit: non_zero_usize(
            farm.seen_message_limit.unwrap_or(DEFAULT_SEEN_MESSAGE_LIMIT),
            "farm.seen_message_limit",
        )?,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    farm: RawFarmSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enable_local_store: Option<bool>,
    local_store_dir: Option<PathBuf>,
    serializer_version: Option<u32>,
    elements_cache_limit: Option<u64>,
    generation_warn_threshold: Option<u64>,
    seed_cancel_check_every: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawFarmSettings {
    server_identity: Option<String>,
    peers: Option<Vec<String>>,
    sync_interval_ms: Option<u64>,
    batch_limit: Option<u64>,
    request_timeout_ms: Option<u64>,
    seen_message_limit: Option<u64>,
}

fn generated_identity() -> String {
    format!("node-{}", Uuid::new_v4().simple())
}

/// Peers are base URLs; their path always ends in `/` so relative routes
/// join beneath it.
fn parse_peer(peer: &str) -> Result<Url, LoadError> {
    let mut url = Url::parse(peer.trim())
        .map_err(|err| LoadError::invalid("farm.peers", format!("`{peer}`: {err}")))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(LoadError::invalid(
            "farm.peers",
            format!("`{peer}`: unsupported scheme `{scheme}`"),
        )),
    }
}

fn non_zero_u64(value: u64, key: &'static str) -> Result<NonZeroU64, LoadError> {
    NonZeroU64::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
