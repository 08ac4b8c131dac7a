//! Metrics collection for the device engine.
//!
//! Counters are mirrored in atomics so the health endpoint and tests can
//! read them without a Prometheus scrape, and emitted through the `metrics`
//! macros for export.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Installs the process-wide Prometheus recorder and returns the handle
/// the `/metrics` endpoint renders from.
pub fn install_prometheus() -> Option<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().ok()
}

/// Engine metrics collector.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    polls_total: AtomicU64,
    poll_errors: AtomicU64,
    tag_reads: AtomicU64,
    tag_writes: AtomicU64,
    cycles_total: AtomicU64,
    broadcast_drops: AtomicU64,
    buffer_evictions: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        describe_counter!(
            "fieldgate_connections_opened_total",
            "Connections opened by the pool"
        );
        describe_counter!(
            "fieldgate_connections_closed_total",
            "Connections closed or evicted by the pool"
        );
        describe_counter!("fieldgate_polls_total", "Device poll units completed");
        describe_counter!(
            "fieldgate_poll_errors_total",
            "Tag reads and connection attempts that failed during polling"
        );
        describe_counter!("fieldgate_tag_reads_total", "Successful tag reads");
        describe_counter!("fieldgate_tag_writes_total", "Successful tag writes");
        describe_counter!("fieldgate_poll_cycles_total", "Completed poll cycles");
        describe_histogram!(
            "fieldgate_poll_cycle_seconds",
            "Wall-clock duration of one poll cycle"
        );
        describe_counter!(
            "fieldgate_broadcast_drops_total",
            "Events dropped because a subscriber channel was full"
        );
        describe_counter!(
            "fieldgate_buffer_evictions_total",
            "Entries evicted from the resilient buffer at capacity"
        );
        describe_gauge!("fieldgate_connections_active", "Connections currently pooled");

        Self::default()
    }

    pub fn record_connection_opened(&self, active: usize) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        counter!("fieldgate_connections_opened_total").increment(1);
        gauge!("fieldgate_connections_active").set(active as f64);
    }

    pub fn record_connection_closed(&self, active: usize) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        counter!("fieldgate_connections_closed_total").increment(1);
        gauge!("fieldgate_connections_active").set(active as f64);
    }

    pub fn record_poll(&self) {
        self.polls_total.fetch_add(1, Ordering::Relaxed);
        counter!("fieldgate_polls_total").increment(1);
    }

    pub fn record_poll_error(&self) {
        self.poll_errors.fetch_add(1, Ordering::Relaxed);
        counter!("fieldgate_poll_errors_total").increment(1);
    }

    pub fn record_tag_read(&self) {
        self.tag_reads.fetch_add(1, Ordering::Relaxed);
        counter!("fieldgate_tag_reads_total").increment(1);
    }

    pub fn record_tag_write(&self) {
        self.tag_writes.fetch_add(1, Ordering::Relaxed);
        counter!("fieldgate_tag_writes_total").increment(1);
    }

    pub fn record_cycle(&self, duration: Duration) {
        self.cycles_total.fetch_add(1, Ordering::Relaxed);
        counter!("fieldgate_poll_cycles_total").increment(1);
        histogram!("fieldgate_poll_cycle_seconds").record(duration.as_secs_f64());
    }

    pub fn record_broadcast_drop(&self) {
        self.broadcast_drops.fetch_add(1, Ordering::Relaxed);
        counter!("fieldgate_broadcast_drops_total").increment(1);
    }

    pub fn record_buffer_eviction(&self) {
        self.buffer_evictions.fetch_add(1, Ordering::Relaxed);
        counter!("fieldgate_buffer_evictions_total").increment(1);
    }

    pub fn polls_total(&self) -> u64 {
        self.polls_total.load(Ordering::Relaxed)
    }

    pub fn poll_errors(&self) -> u64 {
        self.poll_errors.load(Ordering::Relaxed)
    }

    pub fn cycles_total(&self) -> u64 {
        self.cycles_total.load(Ordering::Relaxed)
    }

    pub fn connections_opened(&self) -> u64 {
        self.connections_opened.load(Ordering::Relaxed)
    }

    pub fn connections_closed(&self) -> u64 {
        self.connections_closed.load(Ordering::Relaxed)
    }
}
