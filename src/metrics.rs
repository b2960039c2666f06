// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for query-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding application is responsible for choosing the exporter.
//!
//! # Metric Naming Convention
//! - `query_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `resource`: first segment of the query key (e.g. `tasks`)
//! - `outcome`: success, error, deduplicated
//! - `error_type`: transport, remote, malformed, type_mismatch, disposed

use metrics::{counter, gauge, histogram};
use std::time::Duration;

use crate::query_key::QueryKey;

fn resource_label(key: &QueryKey) -> String {
    key.resource().unwrap_or("unknown").to_string()
}

/// Record a fetch reaching the operation
pub fn record_fetch(key: &QueryKey) {
    counter!("query_sync_fetches_total", "resource" => resource_label(key)).increment(1);
}

/// Record a fetch that attached to an in-flight request instead
pub fn record_dedup(key: &QueryKey) {
    counter!("query_sync_deduplicated_total", "resource" => resource_label(key)).increment(1);
}

/// Record a fetch settlement with its latency
pub fn record_settled(key: &QueryKey, outcome: &str, duration: Duration) {
    let resource = resource_label(key);
    counter!(
        "query_sync_fetch_settled_total",
        "resource" => resource.clone(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("query_sync_fetch_seconds", "resource" => resource).record(duration.as_secs_f64());
}

/// Record an error with category for alerting
pub fn record_error(component: &str, error_type: &str) {
    counter!(
        "query_sync_errors_total",
        "component" => component.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record invalidation of one entry and whether it refetched
pub fn record_invalidation(key: &QueryKey, refetched: bool) {
    counter!(
        "query_sync_invalidations_total",
        "resource" => resource_label(key),
        "refetched" => refetched.to_string()
    )
    .increment(1);
}

/// Record mutation outcome
pub fn record_mutation(outcome: &str, duration: Duration) {
    counter!("query_sync_mutations_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("query_sync_mutation_seconds").record(duration.as_secs_f64());
}

/// Record eviction event
pub fn record_eviction(count: usize) {
    counter!("query_sync_evictions_total").increment(count as u64);
}

/// Set current entry count
pub fn set_cache_entries(count: usize) {
    gauge!("query_sync_cache_entries").set(count as f64);
}

/// Set current subscriber count across all entries
pub fn set_active_subscribers(count: usize) {
    gauge!("query_sync_active_subscribers").set(count as f64);
}
