//! Logging and metric descriptions for a process hosting the cache.

use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

/// One metric emitted by the cache.
#[derive(Debug, Clone, Copy)]
pub struct MetricDescription {
    pub name: &'static str,
    pub kind: MetricKind,
    pub unit: Unit,
    pub help: &'static str,
}

const fn metric(
    name: &'static str,
    kind: MetricKind,
    unit: Unit,
    help: &'static str,
) -> MetricDescription {
    MetricDescription {
        name,
        kind,
        unit,
        help,
    }
}

/// Every metric the cache records.
pub const METRICS: &[MetricDescription] = &[
    metric(
        "pubcache_snapshot_generations_live",
        MetricKind::Gauge,
        Unit::Count,
        "Generations still alive, current or pinned by a snapshot.",
    ),
    metric(
        "pubcache_snapshot_apply_ms",
        MetricKind::Histogram,
        Unit::Milliseconds,
        "Time to build and publish one generation from a delta.",
    ),
    metric(
        "pubcache_seed_ms",
        MetricKind::Histogram,
        Unit::Milliseconds,
        "Seed latency per tree and origin (local store or primary source).",
    ),
    metric(
        "pubcache_elements_hit_total",
        MetricKind::Counter,
        Unit::Count,
        "Total number of elements cache hits.",
    ),
    metric(
        "pubcache_elements_miss_total",
        MetricKind::Counter,
        Unit::Count,
        "Total number of elements cache misses.",
    ),
    metric(
        "pubcache_elements_evict_total",
        MetricKind::Counter,
        Unit::Count,
        "Total number of elements cache evictions due to capacity.",
    ),
    metric(
        "pubcache_messenger_queue_len",
        MetricKind::Gauge,
        Unit::Count,
        "Refresher messages waiting for the next farm sync.",
    ),
    metric(
        "pubcache_messenger_sent_total",
        MetricKind::Counter,
        Unit::Count,
        "Total number of refresher messages sent to the farm.",
    ),
    metric(
        "pubcache_refresher_unknown_total",
        MetricKind::Counter,
        Unit::Count,
        "Messages ignored because no refresher with their id is registered.",
    ),
    metric(
        "pubcache_payload_rejected_total",
        MetricKind::Counter,
        Unit::Count,
        "Messages dropped because their payload could not be deserialized.",
    ),
];

/// Install a global tracing subscriber using the provided logging settings.
///
/// Fails when a global subscriber is already installed.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for `METRICS` with the installed recorder. Runs once.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        for description in METRICS {
            let MetricDescription {
                name,
                kind,
                unit,
                help,
            } = *description;
            match kind {
                MetricKind::Counter => describe_counter!(name, unit, help),
                MetricKind::Gauge => describe_gauge!(name, unit, help),
                MetricKind::Histogram => describe_histogram!(name, unit, help),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use tracing::level_filters::LevelFilter;

    use super::*;

    #[test]
    fn metric_names_are_unique_and_prefixed() {
        let names: HashSet<_> = METRICS.iter().map(|m| m.name).collect();
        assert_eq!(names.len(), METRICS.len());
        assert!(names.iter().all(|name| name.starts_with("pubcache_")));
    }

    #[test]
    fn subscriber_installs_once() {
        let logging = LoggingSettings {
            level: LevelFilter::WARN,
            format: LogFormat::Compact,
        };
        init(&logging).expect("first install");
        let err = init(&logging).expect_err("second install");
        assert!(matches!(err, InfraError::Telemetry(_)));
    }
}
