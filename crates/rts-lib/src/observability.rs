//! Observability infrastructure for the real-time service
//!
//! Provides:
//! - Prometheus metrics (cache hit ratio, fetch timeouts, pulling groups, reconnects)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<RtsMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct RtsMetricsInner {
    resolve_latency_seconds: Histogram,
    cache_hits: IntCounter,
    cache_misses: IntCounter,
    fetches_issued: IntCounter,
    fetch_timeouts: IntCounter,
    unmatched_replies: IntCounter,
    pulling_groups: IntGauge,
    pulling_entries: IntGauge,
    polls_published: IntCounter,
    channel_reconnects: IntCounter,
    publish_failures: IntCounter,
    decode_failures: IntCounter,
    lifecycle_events: IntCounterVec,
}

impl RtsMetricsInner {
    fn new() -> Self {
        Self {
            resolve_latency_seconds: register_histogram!(
                "rts_resolve_latency_seconds",
                "Time spent answering a metric request",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register resolve_latency_seconds"),

            cache_hits: register_int_counter!(
                "rts_cache_hits_total",
                "Metric requests answered from cache"
            )
            .expect("Failed to register cache_hits"),

            cache_misses: register_int_counter!(
                "rts_cache_misses_total",
                "Metric requests that missed the cache"
            )
            .expect("Failed to register cache_misses"),

            fetches_issued: register_int_counter!(
                "rts_fetches_issued_total",
                "Correlated fetch requests published to translators"
            )
            .expect("Failed to register fetches_issued"),

            fetch_timeouts: register_int_counter!(
                "rts_fetch_timeouts_total",
                "Correlated fetches that received no reply in time"
            )
            .expect("Failed to register fetch_timeouts"),

            unmatched_replies: register_int_counter!(
                "rts_unmatched_replies_total",
                "Correlated replies that arrived with nobody waiting"
            )
            .expect("Failed to register unmatched_replies"),

            pulling_groups: register_int_gauge!(
                "rts_pulling_groups",
                "Container pulling groups currently polling"
            )
            .expect("Failed to register pulling_groups"),

            pulling_entries: register_int_gauge!(
                "rts_pulling_entries",
                "Metrics currently being polled in the background"
            )
            .expect("Failed to register pulling_entries"),

            polls_published: register_int_counter!(
                "rts_polls_published_total",
                "Batched background fetches published"
            )
            .expect("Failed to register polls_published"),

            channel_reconnects: register_int_counter!(
                "rts_channel_reconnects_total",
                "Broker subscriptions re-established after loss"
            )
            .expect("Failed to register channel_reconnects"),

            publish_failures: register_int_counter!(
                "rts_publish_failures_total",
                "Messages dropped because the broker refused them"
            )
            .expect("Failed to register publish_failures"),

            decode_failures: register_int_counter!(
                "rts_decode_failures_total",
                "Inbound messages dropped because their body did not decode"
            )
            .expect("Failed to register decode_failures"),

            lifecycle_events: register_int_counter_vec!(
                "rts_lifecycle_events_total",
                "Lifecycle broadcasts applied to pulling state",
                &["kind"]
            )
            .expect("Failed to register lifecycle_events"),
        }
    }
}

/// Service metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct RtsMetrics {
    _private: (),
}

impl Default for RtsMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RtsMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(RtsMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &RtsMetricsInner {
        GLOBAL_METRICS.get_or_init(RtsMetricsInner::new)
    }

    pub fn observe_resolve_latency(&self, elapsed: Duration) {
        self.inner()
            .resolve_latency_seconds
            .observe(elapsed.as_secs_f64());
    }

    pub fn inc_cache_hits(&self) {
        self.inner().cache_hits.inc();
    }

    pub fn inc_cache_misses(&self) {
        self.inner().cache_misses.inc();
    }

    pub fn inc_fetches_issued(&self) {
        self.inner().fetches_issued.inc();
    }

    pub fn inc_fetch_timeouts(&self) {
        self.inner().fetch_timeouts.inc();
    }

    pub fn inc_unmatched_replies(&self) {
        self.inner().unmatched_replies.inc();
    }

    /// Update the pulling registry gauges
    pub fn set_pulling(&self, groups: usize, entries: usize) {
        self.inner().pulling_groups.set(groups as i64);
        self.inner().pulling_entries.set(entries as i64);
    }

    pub fn inc_polls_published(&self) {
        self.inner().polls_published.inc();
    }

    pub fn inc_channel_reconnects(&self) {
        self.inner().channel_reconnects.inc();
    }

    pub fn inc_publish_failures(&self) {
        self.inner().publish_failures.inc();
    }

    pub fn inc_decode_failures(&self) {
        self.inner().decode_failures.inc();
    }

    pub fn inc_lifecycle_event(&self, kind: &str) {
        self.inner()
            .lifecycle_events
            .with_label_values(&[kind])
            .inc();
    }
}

/// Structured logger for service events
///
/// Provides consistent JSON-formatted logging for pulling group lifecycle,
/// fetch timeouts and other significant events.
#[derive(Clone)]
pub struct StructuredLogger {
    service_id: String,
}

impl StructuredLogger {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Log service startup
    pub fn log_startup(&self, version: &str) {
        info!(
            event = "service_started",
            service = %self.service_id,
            version = %version,
            "Real-time service started"
        );
    }

    /// Log service shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "service_shutdown",
            service = %self.service_id,
            reason = %reason,
            "Real-time service shutting down"
        );
    }

    /// Log a pulling group being created
    pub fn log_group_started(&self, group: &str, interval: Duration) {
        info!(
            event = "pulling_group_started",
            service = %self.service_id,
            group = %group,
            interval_ms = interval.as_millis() as u64,
            "Pulling group started"
        );
    }

    /// Log a pulling group being torn down
    pub fn log_group_stopped(&self, group: &str, reason: &str) {
        info!(
            event = "pulling_group_stopped",
            service = %self.service_id,
            group = %group,
            reason = %reason,
            "Pulling group stopped"
        );
    }

    /// Log a correlated fetch that got no reply
    pub fn log_fetch_timeout(&self, metric_id: i32, correlation_id: &str, after: Duration) {
        warn!(
            event = "fetch_timeout",
            service = %self.service_id,
            metric_id = metric_id,
            correlation_id = %correlation_id,
            after_ms = after.as_millis() as u64,
            "No reply for metric fetch"
        );
    }

    /// Log a lifecycle broadcast applied to pulling state
    pub fn log_lifecycle(&self, kind: &str, subject: i32, affected: usize) {
        info!(
            event = "lifecycle_applied",
            service = %self.service_id,
            kind = %kind,
            subject = subject,
            affected = affected,
            "Lifecycle notification applied"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rts_metrics_creation() {
        let metrics = RtsMetrics::new();

        metrics.observe_resolve_latency(Duration::from_millis(3));
        metrics.inc_cache_hits();
        metrics.inc_cache_misses();
        metrics.set_pulling(2, 5);
        metrics.inc_lifecycle_event("container_deleted");

        // A second handle shares the registered collectors
        let other = RtsMetrics::new();
        other.inc_fetch_timeouts();
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("rts-test");
        assert_eq!(logger.service_id(), "rts-test");
    }
}
