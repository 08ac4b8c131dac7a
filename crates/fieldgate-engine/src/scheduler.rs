//! Concurrent polling scheduler.
//!
//! Ticks on a fixed interval. Each cycle fans out one independent task per
//! registered device and joins them all before the next tick can start, so
//! cycles never overlap. Within a device's unit of work the tags are read
//! sequentially over one pooled connection; a failed read marks that tag
//! BAD and moves on to the next. Cancellation is observed between device
//! units and between tag reads, so shutdown completes within one tag
//! read's worst-case latency.
//!
//! Failure isolation is two layers deep: the protocol layer returns decode
//! faults as errors rather than panicking, and each device unit runs in its
//! own task whose join error is contained, so even an unexpected fault in
//! one unit cannot take down the cycle or any other device.

use fieldgate_core::{AuditCategory, AuditEvent, AuditOutcome, GatewayError, TagUpdate};
use fieldgate_security::AuditLog;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::broadcaster::Broadcaster;
use crate::buffer::{BufferedMessage, ResilientBuffer};
use crate::metrics::EngineMetrics;
use crate::pool::ConnectionPool;
use crate::registry::{DeviceEntry, DeviceRegistry};

pub struct PollingScheduler {
    registry: Arc<DeviceRegistry>,
    pool: Arc<ConnectionPool>,
    broadcaster: Arc<Broadcaster>,
    buffer: Arc<ResilientBuffer>,
    audit: Arc<AuditLog>,
    metrics: Arc<EngineMetrics>,
    interval: Duration,
}

impl PollingScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<DeviceRegistry>,
        pool: Arc<ConnectionPool>,
        broadcaster: Arc<Broadcaster>,
        buffer: Arc<ResilientBuffer>,
        audit: Arc<AuditLog>,
        metrics: Arc<EngineMetrics>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            pool,
            broadcaster,
            buffer,
            audit,
            metrics,
            interval,
        }
    }

    /// Runs the tick loop until cancelled. A new cycle starts only after
    /// the previous one has fully joined.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        self.run_cycle(&token).await;
                    }
                }
            }
            debug!("Polling scheduler stopped");
        })
    }

    /// One full cycle: fan out per-device units, join them all.
    pub async fn run_cycle(&self, token: &CancellationToken) {
        let started = Instant::now();
        let mut units: JoinSet<()> = JoinSet::new();

        for entry in self.registry.list() {
            if token.is_cancelled() {
                break;
            }
            let pool = Arc::clone(&self.pool);
            let broadcaster = Arc::clone(&self.broadcaster);
            let buffer = Arc::clone(&self.buffer);
            let audit = Arc::clone(&self.audit);
            let metrics = Arc::clone(&self.metrics);
            let token = token.clone();
            units.spawn(async move {
                poll_device(entry, pool, broadcaster, buffer, audit, metrics, token).await;
            });
        }

        while let Some(joined) = units.join_next().await {
            if let Err(e) = joined {
                // A fault in one device's unit is contained here; the
                // cycle and every other device continue untouched.
                error!(error = %e, "Device poll unit failed to join");
                self.metrics.record_poll_error();
            }
        }

        self.metrics.record_cycle(started.elapsed());
    }
}

/// One device's unit of work: acquire a connection, read every tag
/// sequentially, hand updates to the broadcaster and the outbound buffer.
async fn poll_device(
    entry: Arc<DeviceEntry>,
    pool: Arc<ConnectionPool>,
    broadcaster: Arc<Broadcaster>,
    buffer: Arc<ResilientBuffer>,
    audit: Arc<AuditLog>,
    metrics: Arc<EngineMetrics>,
    token: CancellationToken,
) {
    let device = entry.config().clone();

    let mut conn = match pool.acquire(&device).await {
        Ok(conn) => conn,
        Err(e) => {
            metrics.record_poll_error();
            if entry.is_connected() {
                entry.set_connected(false);
                entry.mark_all_stale();
                warn!(device_id = %device.id, error = %e, "Device became unreachable");
                audit.record(
                    AuditEvent::new(
                        AuditCategory::Connection,
                        &device.id,
                        "connection_lost",
                        AuditOutcome::Error,
                    )
                    .with_detail(json!({ "error": e.to_string() })),
                );
            } else {
                debug!(device_id = %device.id, error = %e, "Reconnect attempt failed");
            }
            return;
        }
    };

    if !entry.is_connected() {
        entry.set_connected(true);
        audit.record(AuditEvent::new(
            AuditCategory::Connection,
            &device.id,
            "connection_established",
            AuditOutcome::Success,
        ));
    }

    // A transport or protocol failure during the unit poisons the
    // connection for reuse; reads continue on it, the pool just does not
    // get it back.
    let mut poisoned = false;

    for tag_def in &device.tags {
        if token.is_cancelled() {
            break;
        }
        match conn.session.read_value(tag_def).await {
            Ok(value) => {
                metrics.record_tag_read();
                entry.touch();
                if let Some(tag) = entry.apply_reading(&tag_def.address, value) {
                    let update = TagUpdate {
                        device_id: device.id.clone(),
                        tag,
                    };
                    broadcaster.publish(&update);
                    if let Ok(payload) = serde_json::to_value(&update) {
                        buffer.add(BufferedMessage::new(payload)).ok();
                    }
                }
            }
            Err(e) => {
                entry.mark_bad(&tag_def.address);
                entry.bump_read_errors();
                metrics.record_poll_error();
                debug!(
                    device_id = %device.id,
                    tag = %tag_def.address,
                    error = %e,
                    "Tag read failed"
                );
                match &e {
                    GatewayError::Transport(_) => poisoned = true,
                    GatewayError::Protocol(p) => {
                        poisoned = true;
                        audit.record(
                            AuditEvent::new(
                                AuditCategory::Protocol,
                                &device.id,
                                "protocol_violation",
                                AuditOutcome::Error,
                            )
                            .with_detail(json!({ "tag": tag_def.address, "error": p.to_string() })),
                        );
                    }
                    _ => {}
                }
            }
        }
    }

    entry.bump_polls();
    metrics.record_poll();

    if poisoned {
        pool.evict(conn).await;
    } else {
        pool.release(conn).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldgate_core::config::PoolSettings;
    use fieldgate_core::{DataType, DeviceConfig, ProtocolKind, Quality, TagDef, TagValue};
    use fieldgate_protocol::{HandlerRegistry, SimResponse, SimulatedHandler};
    use std::collections::HashMap;

    struct Harness {
        scheduler: Arc<PollingScheduler>,
        registry: Arc<DeviceRegistry>,
        sim: Arc<SimulatedHandler>,
        broadcaster: Arc<Broadcaster>,
        buffer: Arc<ResilientBuffer>,
    }

    fn harness() -> Harness {
        let metrics = Arc::new(EngineMetrics::default());
        let sim = Arc::new(SimulatedHandler::new());
        let handlers = Arc::new(HandlerRegistry::builder().register(sim.clone()).build());
        let registry = Arc::new(DeviceRegistry::new());
        let pool = Arc::new(ConnectionPool::new(
            handlers,
            PoolSettings::default(),
            metrics.clone(),
        ));
        let broadcaster = Arc::new(Broadcaster::new(metrics.clone()));
        let buffer = Arc::new(ResilientBuffer::in_memory(1_000));
        let audit = Arc::new(AuditLog::new(true));
        let scheduler = Arc::new(PollingScheduler::new(
            registry.clone(),
            pool,
            broadcaster.clone(),
            buffer.clone(),
            audit,
            metrics,
            Duration::from_millis(100),
        ));
        Harness {
            scheduler,
            registry,
            sim,
            broadcaster,
            buffer,
        }
    }

    fn float_tag(address: &str) -> TagDef {
        TagDef {
            name: format!("tag-{address}"),
            address: address.to_string(),
            data_type: DataType::Float,
            writable: false,
            unit: None,
            description: None,
        }
    }

    fn device(id: &str, tags: Vec<TagDef>) -> DeviceConfig {
        DeviceConfig {
            id: id.to_string(),
            protocol: ProtocolKind::Simulated,
            host: "localhost".to_string(),
            port: 1,
            params: HashMap::new(),
            tags,
        }
    }

    #[tokio::test]
    async fn successful_poll_updates_value_and_quality() {
        let h = harness();
        h.registry
            .register(device("d1", vec![float_tag("40001")]))
            .unwrap();
        h.sim.device("d1").set_value("40001", TagValue::Float(25.5));

        h.scheduler.run_cycle(&CancellationToken::new()).await;

        let tag = h.registry.get("d1").unwrap().tag("40001").unwrap();
        assert_eq!(tag.value, Some(TagValue::Float(25.5)));
        assert_eq!(tag.quality, Quality::Good);
        assert!(h.registry.get("d1").unwrap().is_connected());
    }

    #[tokio::test]
    async fn failed_tag_does_not_abort_the_rest_of_the_device() {
        let h = harness();
        h.registry
            .register(device(
                "d2",
                vec![float_tag("40001"), float_tag("40002"), float_tag("40003")],
            ))
            .unwrap();
        let sim = h.sim.device("d2");
        sim.set_value("40001", TagValue::Float(1.0));
        sim.set_response("40002", SimResponse::TransportFail);
        sim.set_value("40003", TagValue::Float(3.0));

        h.scheduler.run_cycle(&CancellationToken::new()).await;

        let entry = h.registry.get("d2").unwrap();
        assert_eq!(entry.tag("40001").unwrap().quality, Quality::Good);
        assert_eq!(entry.tag("40002").unwrap().quality, Quality::Bad);
        assert_eq!(entry.tag("40003").unwrap().quality, Quality::Good);
        assert_eq!(entry.tag("40003").unwrap().value, Some(TagValue::Float(3.0)));
        assert_eq!(entry.read_errors(), 1);
    }

    #[tokio::test]
    async fn one_device_failure_never_touches_another() {
        let h = harness();
        h.registry
            .register(device("healthy", vec![float_tag("40001")]))
            .unwrap();
        h.registry
            .register(device("broken", vec![float_tag("40001")]))
            .unwrap();
        h.sim
            .device("healthy")
            .set_value("40001", TagValue::Float(7.0));
        h.sim.device("broken").refuse_connections(true);

        h.scheduler.run_cycle(&CancellationToken::new()).await;

        let healthy = h.registry.get("healthy").unwrap();
        assert_eq!(healthy.tag("40001").unwrap().quality, Quality::Good);
        assert!(!h.registry.get("broken").unwrap().is_connected());
    }

    #[tokio::test]
    async fn unreachable_device_marks_tags_stale_and_reconnects_next_cycle() {
        let h = harness();
        h.registry
            .register(device("d1", vec![float_tag("40001")]))
            .unwrap();
        let sim = h.sim.device("d1");
        sim.set_value("40001", TagValue::Float(25.5));

        h.scheduler.run_cycle(&CancellationToken::new()).await;
        assert!(h.registry.get("d1").unwrap().is_connected());

        // Device drops off the network: probe fails on the pooled
        // connection and new dials are refused.
        sim.fail_probes(true);
        sim.refuse_connections(true);
        h.scheduler.run_cycle(&CancellationToken::new()).await;

        let entry = h.registry.get("d1").unwrap();
        assert!(!entry.is_connected());
        let tag = entry.tag("40001").unwrap();
        assert_eq!(tag.quality, Quality::Stale);
        assert_eq!(tag.value, Some(TagValue::Float(25.5)));

        // Back online: the next cycle reconnects.
        sim.fail_probes(false);
        sim.refuse_connections(false);
        h.scheduler.run_cycle(&CancellationToken::new()).await;
        assert!(h.registry.get("d1").unwrap().is_connected());
        assert_eq!(
            h.registry.get("d1").unwrap().tag("40001").unwrap().quality,
            Quality::Good
        );
    }

    #[tokio::test]
    async fn updates_reach_broadcaster_and_buffer() {
        let h = harness();
        let sub = h.broadcaster.subscribe();
        h.registry
            .register(device("d1", vec![float_tag("40001")]))
            .unwrap();
        h.sim.device("d1").set_value("40001", TagValue::Float(25.5));

        h.scheduler.run_cycle(&CancellationToken::new()).await;

        let update = sub.rx.try_recv().unwrap();
        assert_eq!(update.device_id, "d1");
        assert_eq!(update.tag.value, Some(TagValue::Float(25.5)));
        assert_eq!(h.buffer.len(), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_mid_device_between_tag_reads() {
        let h = harness();
        let tags: Vec<TagDef> = (1..=50).map(|n| float_tag(&format!("4{n:04}"))).collect();
        h.registry.register(device("d1", tags)).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        h.scheduler.run_cycle(&token).await;

        // Already-cancelled token: no device unit starts.
        assert_eq!(h.sim.device("d1").read_count(), 0);
    }
}
