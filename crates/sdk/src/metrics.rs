//! Client-side metrics for cluster connectivity.
//!
//! This module provides a pluggable metrics trait (`SdkMetrics`) that users
//! can implement to observe discovery and reconnection behaviour. Two
//! implementations are included:
//!
//! - [`NoopSdkMetrics`]: Zero-overhead default that discards all metrics.
//! - [`MetricsSdkMetrics`]: Integration with the [`metrics`](https://docs.rs/metrics) crate facade,
//!   forwarding to whatever recorder is installed (Prometheus, StatsD, etc.).
//!
//! # Metric Names
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `evdb_client_discoveries_total` | Counter | `status` | Completed gossip resolutions |
//! | `evdb_client_discovery_duration_seconds` | Histogram | `status` | Resolution latency |
//! | `evdb_client_discovery_attempts` | Histogram | | Attempts used per resolution |
//! | `evdb_client_gossip_calls_total` | Counter | `endpoint`, `outcome` | Per-endpoint gossip outcomes |
//! | `evdb_client_reconnects_total` | Counter | `trigger` | Connection resets by trigger |
//! | `evdb_client_connects_total` | Counter | `status` | Connection factory runs |
//! | `evdb_client_connections_total` | Counter | `endpoint`, `event` | Connection cache events |

use std::{fmt, sync::Arc, time::Duration};

/// Events for connection cache tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A handle was built and cached.
    Created,
    /// A handle was evicted and handed off for disposal.
    Evicted,
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Evicted => write!(f, "evicted"),
        }
    }
}

/// Trait for client-side metrics collection.
///
/// All methods have default no-op implementations, so you only need to
/// override the metrics you care about.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` since a single metrics instance is
/// shared by the resolver, the provider and background tasks.
pub trait SdkMetrics: Send + Sync + fmt::Debug {
    /// Records the end of one gossip resolution (all attempts included).
    ///
    /// - `duration`: Wall-clock time of the resolution.
    /// - `attempts`: Number of attempts made.
    /// - `success`: Whether a member list was obtained.
    fn record_discovery(&self, duration: Duration, attempts: u32, success: bool) {
        let _ = (duration, attempts, success);
    }

    /// Records the outcome of one gossip call.
    ///
    /// - `endpoint`: The queried endpoint (`host:port`).
    /// - `outcome`: `success`, `timeout`, `no_viable_endpoints` or `failed`.
    fn record_gossip_call(&self, endpoint: &str, outcome: &str) {
        let _ = (endpoint, outcome);
    }

    /// Records a connection reset.
    ///
    /// - `trigger`: `rediscover` or `new_leader`.
    fn record_reconnect(&self, trigger: &str) {
        let _ = trigger;
    }

    /// Records the outcome of a connection factory run.
    fn record_connect(&self, duration: Duration, success: bool) {
        let _ = (duration, success);
    }

    /// Records a connection cache event.
    fn record_connection(&self, endpoint: &str, event: ConnectionEvent) {
        let _ = (endpoint, event);
    }
}

/// No-op metrics implementation with zero overhead.
///
/// This is the default when no metrics backend is configured.
#[derive(Debug, Clone, Copy)]
pub struct NoopSdkMetrics;

impl SdkMetrics for NoopSdkMetrics {}

/// Metrics implementation using the [`metrics`](https://docs.rs/metrics) crate facade.
///
/// All metric names use the `evdb_client_` prefix.
#[derive(Debug, Clone, Copy)]
pub struct MetricsSdkMetrics;

/// Metric name constants for the `metrics` crate facade.
mod metric_names {
    pub const DISCOVERIES_TOTAL: &str = "evdb_client_discoveries_total";
    pub const DISCOVERY_DURATION: &str = "evdb_client_discovery_duration_seconds";
    pub const DISCOVERY_ATTEMPTS: &str = "evdb_client_discovery_attempts";
    pub const GOSSIP_CALLS_TOTAL: &str = "evdb_client_gossip_calls_total";
    pub const RECONNECTS_TOTAL: &str = "evdb_client_reconnects_total";
    pub const CONNECTS_TOTAL: &str = "evdb_client_connects_total";
    pub const CONNECTIONS_TOTAL: &str = "evdb_client_connections_total";
}

fn status_label(success: bool) -> &'static str {
    if success { "success" } else { "error" }
}

impl SdkMetrics for MetricsSdkMetrics {
    fn record_discovery(&self, duration: Duration, attempts: u32, success: bool) {
        let status = status_label(success);
        metrics::counter!(metric_names::DISCOVERIES_TOTAL, "status" => status).increment(1);
        metrics::histogram!(metric_names::DISCOVERY_DURATION, "status" => status)
            .record(duration.as_secs_f64());
        metrics::histogram!(metric_names::DISCOVERY_ATTEMPTS).record(f64::from(attempts));
    }

    fn record_gossip_call(&self, endpoint: &str, outcome: &str) {
        metrics::counter!(
            metric_names::GOSSIP_CALLS_TOTAL,
            "endpoint" => endpoint.to_owned(),
            "outcome" => outcome.to_owned(),
        )
        .increment(1);
    }

    fn record_reconnect(&self, trigger: &str) {
        metrics::counter!(metric_names::RECONNECTS_TOTAL, "trigger" => trigger.to_owned())
            .increment(1);
    }

    fn record_connect(&self, _duration: Duration, success: bool) {
        metrics::counter!(metric_names::CONNECTS_TOTAL, "status" => status_label(success))
            .increment(1);
    }

    fn record_connection(&self, endpoint: &str, event: ConnectionEvent) {
        metrics::counter!(
            metric_names::CONNECTIONS_TOTAL,
            "endpoint" => endpoint.to_owned(),
            "event" => event.to_string(),
        )
        .increment(1);
    }
}

/// Creates the default metrics instance (no-op).
pub(crate) fn default_metrics() -> Arc<dyn SdkMetrics> {
    Arc::new(NoopSdkMetrics)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    /// Test metrics that counts calls for verification.
    #[derive(Debug, Default)]
    pub(crate) struct CountingMetrics {
        pub(crate) discoveries: AtomicU64,
        pub(crate) failed_discoveries: AtomicU64,
        pub(crate) gossip_calls: AtomicU64,
        pub(crate) reconnects: AtomicU64,
        pub(crate) connects: AtomicU64,
        pub(crate) connections: AtomicU64,
    }

    impl SdkMetrics for CountingMetrics {
        fn record_discovery(&self, _duration: Duration, _attempts: u32, success: bool) {
            self.discoveries.fetch_add(1, Ordering::Relaxed);
            if !success {
                self.failed_discoveries.fetch_add(1, Ordering::Relaxed);
            }
        }
        fn record_gossip_call(&self, _endpoint: &str, _outcome: &str) {
            self.gossip_calls.fetch_add(1, Ordering::Relaxed);
        }
        fn record_reconnect(&self, _trigger: &str) {
            self.reconnects.fetch_add(1, Ordering::Relaxed);
        }
        fn record_connect(&self, _duration: Duration, _success: bool) {
            self.connects.fetch_add(1, Ordering::Relaxed);
        }
        fn record_connection(&self, _endpoint: &str, _event: ConnectionEvent) {
            self.connections.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn noop_metrics_is_zero_overhead() {
        let metrics = NoopSdkMetrics;
        metrics.record_discovery(Duration::from_millis(5), 1, true);
        metrics.record_gossip_call("node-1:2113", "timeout");
        metrics.record_reconnect("rediscover");
        metrics.record_connect(Duration::from_millis(3), false);
        metrics.record_connection("node-1:2113", ConnectionEvent::Created);
    }

    #[test]
    fn counting_metrics_via_trait_object() {
        let counting = Arc::new(CountingMetrics::default());
        let metrics: Arc<dyn SdkMetrics> = counting.clone();

        metrics.record_discovery(Duration::from_millis(5), 3, false);
        metrics.record_gossip_call("node-1:2113", "success");
        metrics.record_reconnect("new_leader");
        metrics.record_connection("node-1:2113", ConnectionEvent::Evicted);

        assert_eq!(counting.discoveries.load(Ordering::Relaxed), 1);
        assert_eq!(counting.failed_discoveries.load(Ordering::Relaxed), 1);
        assert_eq!(counting.gossip_calls.load(Ordering::Relaxed), 1);
        assert_eq!(counting.reconnects.load(Ordering::Relaxed), 1);
        assert_eq!(counting.connections.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn connection_event_display() {
        assert_eq!(ConnectionEvent::Created.to_string(), "created");
        assert_eq!(ConnectionEvent::Evicted.to_string(), "evicted");
    }

    #[test]
    fn metrics_facade_does_not_panic_without_recorder() {
        let metrics = MetricsSdkMetrics;
        metrics.record_discovery(Duration::from_millis(5), 2, true);
        metrics.record_gossip_call("node-1:2113", "failed");
        metrics.record_reconnect("rediscover");
        metrics.record_connect(Duration::from_millis(1), true);
        metrics.record_connection("node-1:2113", ConnectionEvent::Created);
    }

    #[test]
    fn metrics_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopSdkMetrics>();
        assert_send_sync::<MetricsSdkMetrics>();
        assert_send_sync::<Arc<dyn SdkMetrics>>();
    }
}
