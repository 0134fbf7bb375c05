//! Prometheus metrics collection
//!
//! Counters here are process-wide and exist for scraping. Per-hub numbers
//! that callers reason about live on the hub itself.

use prometheus::{Encoder, Registry, TextEncoder};

/// Global metrics registry
pub static REGISTRY: std::sync::LazyLock<Registry> = std::sync::LazyLock::new(Registry::new);

/// Fan-out to local subscribers
pub mod hub {
    use prometheus::{
        register_int_counter_with_registry, register_int_gauge_with_registry, IntCounter, IntGauge,
    };

    use super::REGISTRY;

    /// Events handed to a broadcaster
    pub static EVENTS_PUBLISHED: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
        register_int_counter_with_registry!(
            "changefeed_events_published_total",
            "Total number of events published to local subscribers",
            REGISTRY.clone()
        ).expect("Failed to register EVENTS_PUBLISHED")
    });

    /// Per-subscriber deliveries dropped because the channel was full
    pub static EVENTS_DROPPED: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
        register_int_counter_with_registry!(
            "changefeed_events_dropped_total",
            "Total number of per-subscriber deliveries dropped on a full channel",
            REGISTRY.clone()
        ).expect("Failed to register EVENTS_DROPPED")
    });

    /// Live subscriptions across all hubs in this process
    pub static ACTIVE_SUBSCRIPTIONS: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "changefeed_active_subscriptions",
            "Current number of registered subscriptions",
            REGISTRY.clone()
        ).expect("Failed to register ACTIVE_SUBSCRIPTIONS")
    });
}

/// Cross-instance relay
pub mod relay {
    use prometheus::{register_int_counter_with_registry, IntCounter};

    use super::REGISTRY;

    pub static PUBLISH_FAILURES: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
        register_int_counter_with_registry!(
            "changefeed_relay_publish_failures_total",
            "Total number of events that could not be published to the relay medium",
            REGISTRY.clone()
        ).expect("Failed to register PUBLISH_FAILURES")
    });

    pub static MALFORMED_PAYLOADS: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
        register_int_counter_with_registry!(
            "changefeed_relay_malformed_total",
            "Total number of relay payloads skipped because they could not be decoded",
            REGISTRY.clone()
        ).expect("Failed to register MALFORMED_PAYLOADS")
    });
}

/// Upstream change sources
pub mod source {
    use prometheus::{register_int_counter_with_registry, IntCounter};

    use super::REGISTRY;

    pub static MALFORMED_NOTIFICATIONS: std::sync::LazyLock<IntCounter> =
        std::sync::LazyLock::new(|| {
            register_int_counter_with_registry!(
                "changefeed_source_malformed_total",
                "Total number of source notifications skipped because they could not be decoded",
                REGISTRY.clone()
            )
            .expect("Failed to register MALFORMED_NOTIFICATIONS")
        });
}

/// Render all registered metrics in Prometheus text format
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|_| prometheus::Error::Msg("Invalid UTF-8".to_string()))
}
