//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Merge engine (record outcomes)
//! - Bucket store (flushes, cache lookups, evictions)
//! - Replication (pages, applied records, cycles)

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts};

// =============================================================================
// Merge Metrics
// =============================================================================

/// Records seen by `AddOrUpdate`, by outcome.
pub static MERGE_RECORDS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("magnetdb_merge_records_total", "Records processed by the merge engine"),
        &["outcome"], // "inserted", "updated", "unchanged", "rejected", "skipped", "failed"
    )
    .unwrap()
});

// =============================================================================
// Store Metrics
// =============================================================================

/// Bucket flushes by result.
pub static BUCKET_FLUSHES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("magnetdb_bucket_flushes_total", "Bucket file flushes"),
        &["result"], // "written", "deleted", "failed"
    )
    .unwrap()
});

/// Bucket flush duration in seconds.
pub static BUCKET_FLUSH_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "magnetdb_bucket_flush_duration_seconds",
            "Duration of a bucket flush",
        )
        .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        &[],
    )
    .unwrap()
});

/// Read-cache lookups by result.
pub static CACHE_LOOKUPS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("magnetdb_cache_lookups_total", "Bucket cache lookups"),
        &["result"], // "hit", "miss", "expired"
    )
    .unwrap()
});

/// Cached snapshots dropped by eviction or expiry.
pub static CACHE_EVICTIONS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "magnetdb_cache_evictions_total",
        "Bucket snapshots dropped from the cache",
    )
    .unwrap()
});

// =============================================================================
// Replication Metrics
// =============================================================================

/// Pages fetched from peers.
pub static SYNC_PAGES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("magnetdb_sync_pages_total", "Replication pages fetched"),
        &["peer", "protocol", "result"], // protocol: "v1", "v2", "spidr"; result: "ok", "error"
    )
    .unwrap()
});

/// Records merged from peers after filtering.
pub static SYNC_RECORDS_APPLIED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "magnetdb_sync_records_applied_total",
            "Replicated records handed to the merge engine",
        ),
        &["peer"],
    )
    .unwrap()
});

/// Replication cycles by result.
pub static SYNC_CYCLES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("magnetdb_sync_cycles_total", "Replication cycles"),
        &["peer", "result"], // "converged", "partial", "failed"
    )
    .unwrap()
});

/// Replication cycle duration in seconds.
pub static SYNC_CYCLE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "magnetdb_sync_cycle_duration_seconds",
            "Duration of a replication cycle",
        )
        .buckets(vec![0.1, 1.0, 5.0, 30.0, 60.0, 300.0, 900.0, 3600.0]),
        &["peer"],
    )
    .unwrap()
});

/// Returns all core metrics for registration.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Merge
        Box::new(MERGE_RECORDS.clone()),
        // Store
        Box::new(BUCKET_FLUSHES.clone()),
        Box::new(BUCKET_FLUSH_DURATION.clone()),
        Box::new(CACHE_LOOKUPS.clone()),
        Box::new(CACHE_EVICTIONS.clone()),
        // Replication
        Box::new(SYNC_PAGES.clone()),
        Box::new(SYNC_RECORDS_APPLIED.clone()),
        Box::new(SYNC_CYCLES.clone()),
        Box::new(SYNC_CYCLE_DURATION.clone()),
    ]
}
