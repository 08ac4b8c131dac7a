//! The protocol handler contract and the explicit dispatch table.

use async_trait::async_trait;
use fieldgate_core::{ConfigError, DeviceConfig, ProtocolKind, Result, TagDef, TagValue};
use std::collections::HashMap;
use std::sync::Arc;

/// Per-connection protocol state.
///
/// A session is created by [`ProtocolHandler::connect`] and owned exclusively
/// by one caller at a time (the connection pool enforces this), so methods
/// take `&mut self` and implementations never need internal locking for
/// call ordering.
#[async_trait]
pub trait ProtocolSession: Send {
    /// Reads the current value of a tag.
    ///
    /// Errors distinguish transport failures (retryable on a fresh
    /// connection), protocol violations (the connection must be evicted),
    /// and unsupported operations (permanent).
    async fn read_value(&mut self, tag: &TagDef) -> Result<TagValue>;

    /// Writes a value to a tag. The engine has already checked writability
    /// and type compatibility.
    async fn write_value(&mut self, tag: &TagDef, value: &TagValue) -> Result<()>;

    /// Returns the device's identification string.
    async fn identify(&mut self) -> Result<String>;

    /// Cheap liveness check used by the pool before reuse and during sweeps.
    async fn probe(&mut self) -> bool;

    /// Closes the underlying transport. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// The codec/transport implementation for one wire protocol.
///
/// Handlers hold no per-device state and are safe to invoke concurrently for
/// different devices.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// The protocol kind this handler serves.
    fn kind(&self) -> ProtocolKind;

    /// Opens a new session to the device.
    async fn connect(&self, device: &DeviceConfig) -> Result<Box<dyn ProtocolSession>>;
}

/// Explicit table mapping protocol kinds to handler instances.
///
/// Built once at startup and injected into the engine; there is no global
/// registry and no string-keyed dispatch.
pub struct HandlerRegistry {
    table: HashMap<ProtocolKind, Arc<dyn ProtocolHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder {
            table: HashMap::new(),
        }
    }

    /// Looks up the handler for a protocol kind. A device declaring a kind
    /// with no registered handler is a configuration error.
    pub fn get(&self, kind: ProtocolKind) -> Result<Arc<dyn ProtocolHandler>> {
        self.table.get(&kind).cloned().ok_or_else(|| {
            ConfigError::invalid_value(
                "device.protocol",
                format!("no handler registered for protocol '{kind}'"),
            )
            .into()
        })
    }

    pub fn kinds(&self) -> Vec<ProtocolKind> {
        self.table.keys().copied().collect()
    }
}

pub struct HandlerRegistryBuilder {
    table: HashMap<ProtocolKind, Arc<dyn ProtocolHandler>>,
}

impl HandlerRegistryBuilder {
    pub fn register(mut self, handler: Arc<dyn ProtocolHandler>) -> Self {
        self.table.insert(handler.kind(), handler);
        self
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry { table: self.table }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedHandler;

    #[test]
    fn registry_resolves_registered_kinds() {
        let registry = HandlerRegistry::builder()
            .register(Arc::new(SimulatedHandler::new()))
            .build();

        assert!(registry.get(ProtocolKind::Simulated).is_ok());
        let err = registry.get(ProtocolKind::FramedTcp).unwrap_err();
        assert_eq!(err.category(), "config");
    }
}
