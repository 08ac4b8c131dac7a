//! The Fieldgate device engine: connection pool, device registry, polling
//! scheduler, resilient outbound buffer, and realtime broadcaster.
//!
//! [`GatewayEngine`] wires the pieces together and is the single handle the
//! API layer and the binary talk to. Protocol handlers and the security
//! boundary are injected at construction; the engine never reaches for
//! globals.

pub mod broadcaster;
pub mod buffer;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod scheduler;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fieldgate_core::{
    AuditCategory, AuditEvent, AuditOutcome, ConfigError, DeviceConfig, DeviceStatus,
    GatewayConfig, GatewayError, Result, Tag, TagUpdate, TagValue,
};
use fieldgate_protocol::HandlerRegistry;
use fieldgate_security::SecurityContext;

pub use broadcaster::{Broadcaster, Subscription};
pub use buffer::{BufferedMessage, ResilientBuffer};
pub use metrics::{install_prometheus, EngineMetrics};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use registry::{DeviceEntry, DeviceRegistry};
pub use scheduler::PollingScheduler;

/// Liveness/readiness summary served by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub devices_total: usize,
    pub devices_connected: usize,
    pub connections_total: usize,
    pub connections_in_use: usize,
    pub connection_limit: usize,
    pub buffer_len: usize,
    pub buffer_capacity: usize,
    pub degraded_reasons: Vec<String>,
}

/// The assembled device engine.
pub struct GatewayEngine {
    config: GatewayConfig,
    registry: Arc<DeviceRegistry>,
    pool: Arc<ConnectionPool>,
    broadcaster: Arc<Broadcaster>,
    buffer: Arc<ResilientBuffer>,
    security: SecurityContext,
    metrics: Arc<EngineMetrics>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GatewayEngine {
    /// Builds the engine from validated configuration. The buffer reloads
    /// any persisted entries here, before anything is polled.
    pub fn new(
        config: GatewayConfig,
        handlers: Arc<HandlerRegistry>,
        security: SecurityContext,
    ) -> Arc<Self> {
        let metrics = Arc::new(EngineMetrics::new());
        let registry = Arc::new(DeviceRegistry::new());
        let pool = Arc::new(ConnectionPool::new(
            handlers,
            config.pool.clone(),
            metrics.clone(),
        ));
        let broadcaster = Arc::new(Broadcaster::new(metrics.clone()));
        let buffer = Arc::new(ResilientBuffer::from_settings(&config.buffer));

        Arc::new(Self {
            config,
            registry,
            pool,
            broadcaster,
            buffer,
            security,
            metrics,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Registers statically configured devices and spawns the background
    /// tasks: polling scheduler, pool sweeper, buffer persistence.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        for device in self.config.devices.clone() {
            if let Err(e) = self.register_device(device).await {
                warn!(error = %e, "Skipping statically configured device");
            }
        }

        let scheduler = Arc::new(PollingScheduler::new(
            self.registry.clone(),
            self.pool.clone(),
            self.broadcaster.clone(),
            self.buffer.clone(),
            self.security.audit.clone(),
            self.metrics.clone(),
            self.config.polling.interval(),
        ));

        let mut tasks = self.tasks.lock();
        tasks.push(scheduler.spawn(self.shutdown.clone()));
        tasks.push(self.pool.spawn_sweeper(self.shutdown.clone()));
        tasks.push(
            self.buffer
                .spawn_persistence(self.config.buffer.persist_interval(), self.shutdown.clone()),
        );
        info!(devices = self.registry.len(), "Gateway engine started");
        Ok(())
    }

    /// Registers a device and attempts its first connection.
    ///
    /// A device that is currently offline still registers (the scheduler
    /// keeps trying every cycle), but a capacity failure propagates: the
    /// registration is rolled back and the caller sees the error.
    pub async fn register_device(&self, device: DeviceConfig) -> Result<DeviceStatus> {
        // An unknown protocol kind is a configuration error, caught before
        // the registry accepts the device.
        let _ = self.pool_handlers_check(&device)?;
        let entry = self.registry.register(device.clone())?;

        match self.pool.acquire(&device).await {
            Ok(conn) => {
                self.pool.release(conn).await;
                entry.set_connected(true);
                entry.touch();
                self.security.audit.record(AuditEvent::new(
                    AuditCategory::Connection,
                    &device.id,
                    "connection_established",
                    AuditOutcome::Success,
                ));
            }
            Err(e @ GatewayError::Capacity(_)) => {
                self.registry.remove(&device.id).ok();
                return Err(e);
            }
            Err(e) => {
                warn!(device_id = %device.id, error = %e, "Device registered but unreachable");
                self.security.audit.record(
                    AuditEvent::new(
                        AuditCategory::Connection,
                        &device.id,
                        "connection_failed",
                        AuditOutcome::Error,
                    )
                    .with_detail(json!({ "error": e.to_string() })),
                );
            }
        }
        Ok(entry.status())
    }

    /// Disconnects and deregisters a device.
    pub async fn remove_device(&self, id: &str) -> Result<()> {
        let entry = self.registry.remove(id)?;
        entry.set_connected(false);
        self.pool.close_device(id).await;
        self.security.audit.record(AuditEvent::new(
            AuditCategory::Connection,
            id,
            "device_removed",
            AuditOutcome::Success,
        ));
        Ok(())
    }

    pub fn list_devices(&self) -> Vec<DeviceStatus> {
        let mut devices: Vec<DeviceStatus> =
            self.registry.list().iter().map(|e| e.status()).collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub fn device_status(&self, id: &str) -> Result<DeviceStatus> {
        Ok(self.registry.get(id)?.status())
    }

    pub fn device_tags(&self, id: &str) -> Result<Vec<Tag>> {
        Ok(self.registry.get(id)?.tags())
    }

    /// Current value, quality, and timestamp of a tag, as last polled.
    pub fn read_tag(&self, device_id: &str, address: &str) -> Result<Tag> {
        let entry = self.registry.get(device_id)?;
        entry.tag(address).ok_or_else(|| {
            ConfigError::UnknownTag {
                device_id: device_id.to_string(),
                address: address.to_string(),
            }
            .into()
        })
    }

    /// Writes a value to a writable tag, through the device's pooled
    /// connection. The write is audited whether it succeeds or fails.
    pub async fn write_tag(
        &self,
        device_id: &str,
        address: &str,
        value: TagValue,
        actor: &str,
    ) -> Result<Tag> {
        let entry = self.registry.get(device_id)?;
        let def = entry
            .tag_def(address)
            .ok_or_else(|| ConfigError::UnknownTag {
                device_id: device_id.to_string(),
                address: address.to_string(),
            })?
            .clone();
        if !def.writable {
            return Err(ConfigError::TagNotWritable {
                device_id: device_id.to_string(),
                address: address.to_string(),
            }
            .into());
        }
        if !value.matches(def.data_type) {
            return Err(ConfigError::invalid_value(
                "value",
                format!(
                    "type {:?} does not match tag type {:?}",
                    value.data_type(),
                    def.data_type
                ),
            )
            .into());
        }

        let mut conn = self.pool.acquire(entry.config()).await?;
        let outcome = conn.session.write_value(&def, &value).await;

        let audit_outcome = if outcome.is_ok() {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failure
        };
        self.security.audit.record(
            AuditEvent::new(AuditCategory::Write, actor, "tag_write", audit_outcome).with_detail(
                json!({
                    "device_id": device_id,
                    "tag": address,
                    "value": value,
                }),
            ),
        );

        match outcome {
            Ok(()) => {
                self.pool.release(conn).await;
                entry.bump_writes();
                entry.touch();
                self.metrics.record_tag_write();
                let tag = entry
                    .apply_reading(address, value)
                    .expect("tag exists: definition was just resolved");
                self.broadcaster.publish(&TagUpdate {
                    device_id: device_id.to_string(),
                    tag: tag.clone(),
                });
                Ok(tag)
            }
            Err(e) => {
                match &e {
                    GatewayError::Transport(_) | GatewayError::Protocol(_) => {
                        self.pool.evict(conn).await;
                    }
                    _ => self.pool.release(conn).await,
                }
                Err(e)
            }
        }
    }

    /// Subscribes to live tag updates.
    pub fn subscribe(&self) -> Subscription {
        self.broadcaster.subscribe()
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn buffer(&self) -> &Arc<ResilientBuffer> {
        &self.buffer
    }

    pub fn security(&self) -> &SecurityContext {
        &self.security
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn health(&self) -> HealthSnapshot {
        let pool = self.pool.stats();
        let buffer_len = self.buffer.len();
        let buffer_capacity = self.buffer.capacity();

        let mut degraded_reasons = Vec::new();
        if pool.saturated() {
            degraded_reasons.push("connection ceiling saturated".to_string());
        }
        if buffer_len >= buffer_capacity {
            degraded_reasons.push("outbound buffer at capacity".to_string());
        }

        HealthSnapshot {
            status: if degraded_reasons.is_empty() {
                "ok"
            } else {
                "degraded"
            },
            devices_total: self.registry.len(),
            devices_connected: self.registry.connected_count(),
            connections_total: pool.total,
            connections_in_use: pool.in_use,
            connection_limit: pool.global_limit,
            buffer_len,
            buffer_capacity,
            degraded_reasons,
        }
    }

    /// Graceful shutdown: stop scheduling, let the in-flight cycle observe
    /// cancellation, flush the buffer, close all pooled connections, then
    /// drop every subscriber.
    pub async fn shutdown(&self) {
        info!("Gateway engine shutting down");
        self.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.await.ok();
        }

        if let Err(e) = self.buffer.persist() {
            warn!(error = %e, "Buffer flush during shutdown failed");
        }
        self.pool.close_all().await;
        self.broadcaster.close_all();
        info!("Gateway engine stopped");
    }

    fn pool_handlers_check(&self, device: &DeviceConfig) -> Result<()> {
        device.validate()?;
        // Resolving the handler here surfaces an unsupported protocol as a
        // registration-time configuration error.
        self.pool.handler_for(device.protocol).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldgate_core::config::{BufferSettings, PoolSettings};
    use fieldgate_core::{DataType, ProtocolKind, Quality, TagDef};
    use fieldgate_protocol::SimulatedHandler;
    use std::collections::HashMap;

    fn engine() -> (Arc<GatewayEngine>, Arc<SimulatedHandler>) {
        let sim = Arc::new(SimulatedHandler::new());
        let handlers = Arc::new(HandlerRegistry::builder().register(sim.clone()).build());
        let config = GatewayConfig {
            pool: PoolSettings {
                per_device_limit: 1,
                global_limit: 4,
                ..PoolSettings::default()
            },
            buffer: BufferSettings {
                capacity: 100,
                ..BufferSettings::default()
            },
            ..GatewayConfig::default()
        };
        let security = SecurityContext::from_settings(&config.security).unwrap();
        (GatewayEngine::new(config, handlers, security), sim)
    }

    fn device(id: &str, writable: bool) -> DeviceConfig {
        DeviceConfig {
            id: id.to_string(),
            protocol: ProtocolKind::Simulated,
            host: "localhost".to_string(),
            port: 1,
            params: HashMap::new(),
            tags: vec![TagDef {
                name: "setpoint".to_string(),
                address: "40001".to_string(),
                data_type: DataType::Float,
                writable,
                unit: None,
                description: None,
            }],
        }
    }

    #[tokio::test]
    async fn register_connects_and_reports_status() {
        let (engine, _) = engine();
        let status = engine.register_device(device("d1", false)).await.unwrap();
        assert!(status.connected);
        assert_eq!(engine.list_devices().len(), 1);
    }

    #[tokio::test]
    async fn offline_device_still_registers() {
        let (engine, sim) = engine();
        sim.device("d1").refuse_connections(true);
        let status = engine.register_device(device("d1", false)).await.unwrap();
        assert!(!status.connected);
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let (engine, _) = engine();
        engine.register_device(device("d1", false)).await.unwrap();
        let err = engine.register_device(device("d1", false)).await.unwrap_err();
        assert_eq!(err.category(), "config");
    }

    #[tokio::test]
    async fn write_round_trip_updates_registry_and_audits() {
        let (engine, sim) = engine();
        engine.register_device(device("d1", true)).await.unwrap();

        let tag = engine
            .write_tag("d1", "40001", TagValue::Float(21.5), "operator-1")
            .await
            .unwrap();
        assert_eq!(tag.value, Some(TagValue::Float(21.5)));
        assert_eq!(tag.quality, Quality::Good);
        assert_eq!(sim.device("d1").write_count(), 1);

        let audits = engine.security().audit.recent(10);
        assert!(audits
            .iter()
            .any(|e| e.category == fieldgate_core::AuditCategory::Write));
    }

    #[tokio::test]
    async fn read_only_tag_rejects_writes() {
        let (engine, _) = engine();
        engine.register_device(device("d1", false)).await.unwrap();
        let err = engine
            .write_tag("d1", "40001", TagValue::Float(1.0), "operator-1")
            .await
            .unwrap_err();
        assert_eq!(err.category(), "config");
    }

    #[tokio::test]
    async fn type_mismatch_rejects_writes() {
        let (engine, _) = engine();
        engine.register_device(device("d1", true)).await.unwrap();
        let err = engine
            .write_tag("d1", "40001", TagValue::Text("hot".into()), "operator-1")
            .await
            .unwrap_err();
        assert_eq!(err.category(), "config");
    }

    #[tokio::test]
    async fn remove_device_disconnects_and_forgets() {
        let (engine, _) = engine();
        engine.register_device(device("d1", false)).await.unwrap();
        engine.remove_device("d1").await.unwrap();
        assert!(engine.list_devices().is_empty());
        assert!(engine.remove_device("d1").await.is_err());
    }

    #[tokio::test]
    async fn health_reflects_registered_fleet() {
        let (engine, _) = engine();
        engine.register_device(device("d1", false)).await.unwrap();
        let health = engine.health();
        assert_eq!(health.status, "ok");
        assert_eq!(health.devices_total, 1);
        assert_eq!(health.devices_connected, 1);
    }

    #[tokio::test]
    async fn shutdown_flushes_and_closes() {
        let (engine, _) = engine();
        engine.register_device(device("d1", false)).await.unwrap();
        engine.start().await.unwrap();
        engine.shutdown().await;
        assert_eq!(engine.health().connections_total, 0);
    }
}
