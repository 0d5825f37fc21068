// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for config-relay.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter
//! (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `config_relay_` prefix for all metrics
//! - `_total` suffix for counters

use metrics::{counter, gauge};

/// Record one message appended to the bus
pub fn message_published() {
    counter!("config_relay_messages_published_total").increment(1);
}

/// Record a cleanup request dropped because the queue was full
pub fn cleanup_dropped() {
    counter!("config_relay_cleanup_dropped_total").increment(1);
}

/// Record superseded message rows removed by the cleanup worker
pub fn messages_cleaned(count: usize) {
    counter!("config_relay_messages_cleaned_total").increment(count as u64);
}

/// Record rows delivered by the bus scanner
pub fn messages_scanned(count: usize) {
    counter!("config_relay_messages_scanned_total").increment(count as u64);
}

/// Set message cache entry count
pub fn message_cache_size(count: usize) {
    gauge!("config_relay_message_cache_entries").set(count as f64);
}

/// Set namespace metadata cache entry count
pub fn meta_cache_size(count: usize) {
    gauge!("config_relay_meta_cache_entries").set(count as f64);
}

/// Set gray rule cache bucket count
pub fn gray_rule_buckets(count: usize) {
    gauge!("config_relay_gray_rule_buckets").set(count as f64);
}

/// Record release cache lookup outcome per cache ("key" or "id")
pub fn release_cache(cache: &str, outcome: &str) {
    counter!(
        "config_relay_release_cache_total",
        "cache" => cache.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set combined release cache entry count after a sweep
pub fn release_cache_size(count: usize) {
    gauge!("config_relay_release_cache_entries").set(count as f64);
}

/// Record config fetch outcome: ok, not_modified, not_found
pub fn config_served(outcome: &str) {
    counter!(
        "config_relay_configs_served_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record long poll outcome: immediate, woken, timeout
pub fn long_poll(outcome: &str) {
    counter!(
        "config_relay_long_polls_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set currently parked long-poll waiter count
pub fn parked_waiters(count: usize) {
    gauge!("config_relay_parked_waiters").set(count as f64);
}

/// Record a completed publish operation
pub fn release_published() {
    counter!("config_relay_releases_published_total").increment(1);
}
