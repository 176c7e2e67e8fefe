//! Prometheus metrics for observability.
//!
//! Server-side metrics live here:
//! - HTTP request metrics (latency, counts, rejected maintenance calls)
//! - Store and cache gauges (collected dynamically)
//! - Replication gauges per peer (collected dynamically)
//! - Housekeeping task counters
//!
//! Merge, bucket and replication counters are defined in
//! `magnetdb_core::metrics` and registered into the same registry.

use once_cell::sync::Lazy;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// HTTP Request Metrics
// =============================================================================

/// HTTP request duration in seconds.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "magnetdb_http_request_duration_seconds",
            "HTTP request duration in seconds",
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
        ]),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests total count.
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("magnetdb_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests currently in flight.
pub static HTTP_REQUESTS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "magnetdb_http_requests_in_flight",
        "Number of HTTP requests currently being processed",
    )
    .unwrap()
});

/// Maintenance requests refused because they did not come from loopback.
pub static DEV_REQUESTS_REJECTED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "magnetdb_dev_requests_rejected_total",
        "Maintenance requests rejected for a non-loopback client",
    )
    .unwrap()
});

// =============================================================================
// Store Metrics
// =============================================================================

/// Buckets in the master index.
pub static STORE_BUCKETS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("magnetdb_store_buckets", "Number of buckets in the master index").unwrap()
});

/// Cached read snapshots.
pub static CACHE_ENTRIES: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("magnetdb_cache_entries", "Number of cached bucket snapshots").unwrap()
});

/// Open bucket write handles.
pub static CACHE_OPEN_WRITERS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "magnetdb_cache_open_writers",
        "Number of buckets with an open write handle",
    )
    .unwrap()
});

// =============================================================================
// Replication Metrics
// =============================================================================

/// Whether the sync manager is running.
pub static SYNC_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("magnetdb_sync_running", "Whether peer replication is running").unwrap()
});

/// Last persisted replication cursor per peer.
pub static SYNC_LASTSYNC: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "magnetdb_sync_lastsync",
            "Replication cursor (file time) per peer",
        ),
        &["peer"],
    )
    .unwrap()
});

/// Failed replication cycles per peer since startup.
pub static SYNC_PEER_FAILURES: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "magnetdb_sync_peer_failures",
            "Failed replication cycles per peer since startup",
        ),
        &["peer"],
    )
    .unwrap()
});

// =============================================================================
// Housekeeping Metrics
// =============================================================================

/// Expired snapshots dropped by the purge task.
pub static CACHE_PURGED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "magnetdb_cache_purged_total",
        "Expired bucket snapshots dropped by the purge task",
    )
    .unwrap()
});

/// Master index snapshot writes by result.
pub static MASTER_SAVES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "magnetdb_master_saves_total",
            "Master index snapshot writes",
        ),
        &["result"],
    )
    .unwrap()
});

// =============================================================================
// Registration
// =============================================================================

fn register_metrics(registry: &Registry) {
    // HTTP
    registry
        .register(Box::new(HTTP_REQUEST_DURATION.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_IN_FLIGHT.clone()))
        .unwrap();
    registry
        .register(Box::new(DEV_REQUESTS_REJECTED.clone()))
        .unwrap();

    // Store
    registry.register(Box::new(STORE_BUCKETS.clone())).unwrap();
    registry.register(Box::new(CACHE_ENTRIES.clone())).unwrap();
    registry
        .register(Box::new(CACHE_OPEN_WRITERS.clone()))
        .unwrap();

    // Replication
    registry.register(Box::new(SYNC_RUNNING.clone())).unwrap();
    registry.register(Box::new(SYNC_LASTSYNC.clone())).unwrap();
    registry
        .register(Box::new(SYNC_PEER_FAILURES.clone()))
        .unwrap();

    // Housekeeping
    registry
        .register(Box::new(CACHE_PURGED_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(MASTER_SAVES_TOTAL.clone()))
        .unwrap();

    // Core metrics (merge, buckets, cache, replication)
    for metric in magnetdb_core::metrics::all_metrics() {
        registry.register(metric).unwrap();
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

/// Collect dynamic metrics from current application state.
///
/// Called before encoding so gauges reflect the store and the replicators
/// at scrape time.
pub async fn collect_dynamic_metrics(state: &crate::state::AppState) {
    let store = state.store();
    STORE_BUCKETS.set(store.master().len() as i64);

    let cache = store.cache().stats();
    CACHE_ENTRIES.set(cache.entries as i64);
    CACHE_OPEN_WRITERS.set(cache.open_writers as i64);

    let sync = state.sync();
    SYNC_RUNNING.set(if sync.is_running() { 1 } else { 0 });
    for status in sync.statuses().await {
        SYNC_LASTSYNC
            .with_label_values(&[&status.peer])
            .set(status.lastsync);
        SYNC_PEER_FAILURES
            .with_label_values(&[&status.peer])
            .set(status.failures as i64);
    }
}

/// Route label for a request: the matched route template, or a fixed label
/// for requests no route matched.
pub fn route_label(matched: Option<&str>) -> String {
    matched.unwrap_or("unmatched").to_string()
}
