use std::sync::Once;

use metrics::{Unit, describe_counter};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
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

/// Register descriptions for the cache counters with the installed recorder.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "pagecache_store_hit_total",
            Unit::Count,
            "Entry store reads that returned a fresh record."
        );
        describe_counter!(
            "pagecache_store_miss_total",
            Unit::Count,
            "Entry store reads that found nothing fresh."
        );
        describe_counter!(
            "pagecache_store_corrupt_total",
            Unit::Count,
            "Bucket files discarded because they failed verification."
        );
        describe_counter!(
            "pagecache_store_commit_failed_total",
            Unit::Count,
            "Bucket commits that could not reach the disk."
        );
        describe_counter!(
            "pagecache_rendered_hit_total",
            Unit::Count,
            "Rendered cache lookups answered with content."
        );
        describe_counter!(
            "pagecache_rendered_miss_total",
            Unit::Count,
            "Rendered cache lookups that found no usable artifact."
        );
        describe_counter!(
            "pagecache_rendered_not_modified_total",
            Unit::Count,
            "Rendered cache lookups answered with 304 Not Modified."
        );
        describe_counter!(
            "pagecache_rendered_write_total",
            Unit::Count,
            "Rendered artifacts written to disk."
        );
    });
}
