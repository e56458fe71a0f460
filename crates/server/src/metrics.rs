//! Prometheus metrics
//!
//! Counters and histograms for the replication fabric. Everything is
//! labelled by sync group where one applies, so a single misbehaving group
//! is visible without log spelunking.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use worldsync_core::ResourceKind;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Call once at startup.
pub fn init_metrics() {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            let _ = PROMETHEUS_HANDLE.set(handle);

            describe_counter!("worldsync_ticks_total", "Ticks captured per sync group");
            describe_counter!(
                "worldsync_ticks_delayed_total",
                "Ticks whose capture overran the interval"
            );
            describe_histogram!(
                "worldsync_tick_duration_ms",
                "Tick capture duration in milliseconds"
            );
            describe_counter!("worldsync_queries_total", "Client queries executed");
            describe_histogram!(
                "worldsync_query_duration_ms",
                "Client query duration in milliseconds"
            );
            describe_gauge!("worldsync_connections", "Live WebSocket connections");
            describe_counter!(
                "worldsync_notifications_total",
                "Store notifications forwarded to sessions"
            );
            describe_counter!(
                "worldsync_backpressure_closes_total",
                "Connections shed for a full outbound queue"
            );
            describe_counter!(
                "worldsync_fanout_changes_total",
                "Changes fanned out per sync group"
            );

            tracing::info!("Prometheus metrics initialised at /metrics");
        }
        Err(error) => {
            tracing::warn!(%error, "Failed to install metrics recorder; /metrics will be empty");
        }
    }
}

/// GET /metrics
pub async fn metrics_handler() -> String {
    PROMETHEUS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_default()
}

pub fn record_tick(sync_group: &str, duration_ms: f64, delayed: bool) {
    counter!("worldsync_ticks_total", "sync_group" => sync_group.to_string()).increment(1);
    histogram!("worldsync_tick_duration_ms", "sync_group" => sync_group.to_string())
        .record(duration_ms);
    if delayed {
        counter!("worldsync_ticks_delayed_total", "sync_group" => sync_group.to_string())
            .increment(1);
    }
}

pub fn record_query(duration: Duration, success: bool) {
    let outcome = if success { "ok" } else { "error" };
    counter!("worldsync_queries_total", "outcome" => outcome).increment(1);
    histogram!("worldsync_query_duration_ms").record(duration.as_secs_f64() * 1000.0);
}

pub fn record_connection_opened() {
    gauge!("worldsync_connections").increment(1.0);
}

pub fn record_connection_closed() {
    gauge!("worldsync_connections").decrement(1.0);
}

pub fn record_notification(kind: ResourceKind) {
    counter!("worldsync_notifications_total", "kind" => kind.as_str()).increment(1);
}

pub fn record_backpressure_close(sync_group: &str) {
    counter!("worldsync_backpressure_closes_total", "sync_group" => sync_group.to_string())
        .increment(1);
}

pub fn record_fanout(sync_group: &str, changes: usize) {
    counter!("worldsync_fanout_changes_total", "sync_group" => sync_group.to_string())
        .increment(changes as u64);
}
