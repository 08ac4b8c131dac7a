//! Core types, errors, and configuration for the Fieldgate edge gateway.
//!
//! This crate is dependency-light on purpose: every other Fieldgate crate
//! builds on the error taxonomy, the tag data model, and the configuration
//! structures defined here.

pub mod config;
pub mod error;
pub mod types;

pub use config::GatewayConfig;
pub use error::{
    AuthError, CapacityError, ConfigError, GatewayError, ProtocolError, Result, TransportError,
};
pub use types::{
    AuditCategory, AuditEvent, AuditOutcome, DataType, DeviceConfig, DeviceId, DeviceStatus,
    ProtocolKind, Quality, Tag, TagDef, TagUpdate, TagValue,
};
