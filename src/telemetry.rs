use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), String> {
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
        .map_err(|err| format!("failed to install tracing subscriber: {err}"))
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "razzo_cache_hit_total",
            Unit::Count,
            "Total number of page cache hits."
        );
        describe_counter!(
            "razzo_cache_miss_total",
            Unit::Count,
            "Total number of page cache misses."
        );
        describe_counter!(
            "razzo_cache_bypass_total",
            Unit::Count,
            "Total number of requests bypassed by rule, labeled by reason."
        );
        describe_counter!(
            "razzo_purge_removed_total",
            Unit::Count,
            "Total number of cache entries removed by purges, labeled by scope."
        );
        describe_counter!(
            "razzo_purge_failed_total",
            Unit::Count,
            "Total number of failed purge requests, labeled by scope."
        );
        describe_gauge!(
            "razzo_event_queue_depth",
            Unit::Count,
            "Current number of pending change events in the queue."
        );
        describe_counter!(
            "razzo_preload_fetched_total",
            Unit::Count,
            "Total number of pages warmed by preload runs."
        );
        describe_counter!(
            "razzo_preload_failed_total",
            Unit::Count,
            "Total number of preload fetches that failed."
        );
        describe_histogram!(
            "razzo_preload_fetch_ms",
            Unit::Milliseconds,
            "Preload fetch latency in milliseconds."
        );
    });
}
