//! In-process simulated devices.
//!
//! The simulator backs tests and demo deployments that have no hardware on
//! the network. Each simulated device is scriptable per tag address: it can
//! answer with a value, fail at the transport level, or return a malformed
//! response, and it counts the calls it receives.

use async_trait::async_trait;
use dashmap::DashMap;
use fieldgate_core::{
    DataType, DeviceConfig, DeviceId, ProtocolError, ProtocolKind, Result, TagDef, TagValue,
    TransportError,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Scripted answer for one tag address.
#[derive(Debug, Clone)]
pub enum SimResponse {
    /// Answer with this value
    Value(TagValue),
    /// Fail as if the transport dropped mid-call
    TransportFail,
    /// Fail as if the device answered garbage
    Malformed,
}

/// Scriptable state of one simulated device.
#[derive(Debug, Default)]
pub struct SimDevice {
    responses: RwLock<HashMap<String, SimResponse>>,
    reads: AtomicU64,
    writes: AtomicU64,
    connects: AtomicU64,
    refuse_connect: AtomicBool,
    fail_probe: AtomicBool,
}

impl SimDevice {
    /// Scripts the answer for a tag address.
    pub fn set_response(&self, address: impl Into<String>, response: SimResponse) {
        self.responses.write().insert(address.into(), response);
    }

    /// Shorthand for scripting a plain value.
    pub fn set_value(&self, address: impl Into<String>, value: TagValue) {
        self.set_response(address, SimResponse::Value(value));
    }

    /// Makes subsequent `connect` calls fail at the transport level.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::Relaxed);
    }

    /// Makes liveness probes on existing sessions fail.
    pub fn fail_probes(&self, fail: bool) {
        self.fail_probe.store(fail, Ordering::Relaxed);
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    fn default_value(data_type: DataType) -> TagValue {
        match data_type {
            DataType::Bool => TagValue::Bool(false),
            DataType::Int => TagValue::Int(0),
            DataType::Float => TagValue::Float(0.0),
            DataType::String => TagValue::Text(String::new()),
        }
    }
}

/// Protocol handler serving simulated devices.
#[derive(Default)]
pub struct SimulatedHandler {
    devices: DashMap<DeviceId, Arc<SimDevice>>,
}

impl SimulatedHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the scriptable state for a device, creating it on first use.
    pub fn device(&self, id: &str) -> Arc<SimDevice> {
        self.devices
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(SimDevice::default()))
            .clone()
    }
}

#[async_trait]
impl crate::handler::ProtocolHandler for SimulatedHandler {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Simulated
    }

    async fn connect(
        &self,
        device: &DeviceConfig,
    ) -> Result<Box<dyn crate::handler::ProtocolSession>> {
        let state = self.device(&device.id);
        if state.refuse_connect.load(Ordering::Relaxed) {
            return Err(TransportError::connect_failed(
                device.host.clone(),
                device.port,
                "simulated connection refusal",
            )
            .into());
        }
        state.connects.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(SimSession {
            device_id: device.id.clone(),
            state,
            open: true,
        }))
    }
}

struct SimSession {
    device_id: DeviceId,
    state: Arc<SimDevice>,
    open: bool,
}

impl SimSession {
    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(TransportError::NotConnected.into())
        }
    }
}

#[async_trait]
impl crate::handler::ProtocolSession for SimSession {
    async fn read_value(&mut self, tag: &TagDef) -> Result<TagValue> {
        self.ensure_open()?;
        self.state.reads.fetch_add(1, Ordering::Relaxed);
        let scripted = self.state.responses.read().get(&tag.address).cloned();
        match scripted {
            Some(SimResponse::Value(value)) => Ok(value),
            Some(SimResponse::TransportFail) => Err(TransportError::ConnectionReset.into()),
            Some(SimResponse::Malformed) => Err(ProtocolError::malformed(format!(
                "scripted malformed response for '{}'",
                tag.address
            ))
            .into()),
            None => Ok(SimDevice::default_value(tag.data_type)),
        }
    }

    async fn write_value(&mut self, tag: &TagDef, value: &TagValue) -> Result<()> {
        self.ensure_open()?;
        self.state.writes.fetch_add(1, Ordering::Relaxed);
        match self.state.responses.read().get(&tag.address) {
            Some(SimResponse::TransportFail) => {
                return Err(TransportError::ConnectionReset.into())
            }
            Some(SimResponse::Malformed) => {
                return Err(ProtocolError::malformed(format!(
                    "scripted malformed response for '{}'",
                    tag.address
                ))
                .into())
            }
            _ => {}
        }
        self.state
            .responses
            .write()
            .insert(tag.address.clone(), SimResponse::Value(value.clone()));
        Ok(())
    }

    async fn identify(&mut self) -> Result<String> {
        self.ensure_open()?;
        Ok(format!("simulated device '{}'", self.device_id))
    }

    async fn probe(&mut self) -> bool {
        self.open && !self.state.fail_probe.load(Ordering::Relaxed)
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ProtocolHandler;
    use fieldgate_core::GatewayError;

    fn device() -> DeviceConfig {
        DeviceConfig {
            id: "sim-1".to_string(),
            protocol: ProtocolKind::Simulated,
            host: "localhost".to_string(),
            port: 1,
            params: HashMap::new(),
            tags: vec![],
        }
    }

    fn tag(address: &str, data_type: DataType) -> TagDef {
        TagDef {
            name: address.to_string(),
            address: address.to_string(),
            data_type,
            writable: true,
            unit: None,
            description: None,
        }
    }

    #[tokio::test]
    async fn scripted_values_are_served() {
        let handler = SimulatedHandler::new();
        handler.device("sim-1").set_value("40001", TagValue::Float(25.5));

        let mut session = handler.connect(&device()).await.unwrap();
        let value = session
            .read_value(&tag("40001", DataType::Float))
            .await
            .unwrap();
        assert_eq!(value, TagValue::Float(25.5));
        assert_eq!(handler.device("sim-1").read_count(), 1);
    }

    #[tokio::test]
    async fn scripted_failures_map_to_taxonomy() {
        let handler = SimulatedHandler::new();
        let state = handler.device("sim-1");
        state.set_response("40001", SimResponse::TransportFail);
        state.set_response("40002", SimResponse::Malformed);

        let mut session = handler.connect(&device()).await.unwrap();
        assert!(matches!(
            session.read_value(&tag("40001", DataType::Float)).await,
            Err(GatewayError::Transport(_))
        ));
        assert!(matches!(
            session.read_value(&tag("40002", DataType::Float)).await,
            Err(GatewayError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn writes_become_visible_to_reads() {
        let handler = SimulatedHandler::new();
        let mut session = handler.connect(&device()).await.unwrap();
        session
            .write_value(&tag("40001", DataType::Int), &TagValue::Int(42))
            .await
            .unwrap();
        let value = session
            .read_value(&tag("40001", DataType::Int))
            .await
            .unwrap();
        assert_eq!(value, TagValue::Int(42));
    }

    #[tokio::test]
    async fn closed_session_refuses_calls() {
        let handler = SimulatedHandler::new();
        let mut session = handler.connect(&device()).await.unwrap();
        session.close().await.unwrap();
        assert!(!session.probe().await);
        assert!(session.read_value(&tag("40001", DataType::Int)).await.is_err());
    }
}
