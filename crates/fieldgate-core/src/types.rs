//! Shared domain model: devices, tags, values, and audit events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{ConfigError, GatewayError, Result};

/// Unique identifier for a registered device.
pub type DeviceId = String;

/// Closed set of wire protocols the gateway speaks.
///
/// Dispatch is by this enum through an explicit handler table built at
/// startup; there is no runtime string lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    /// Length-prefixed framed TCP protocol (the reference format)
    FramedTcp,
    /// In-process simulated devices, for tests and demo deployments
    Simulated,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolKind::FramedTcp => write!(f, "framed_tcp"),
            ProtocolKind::Simulated => write!(f, "simulated"),
        }
    }
}

/// Declared data type of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Bool,
    Int,
    Float,
    String,
}

/// A typed tag value as read from or written to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl TagValue {
    /// The declared type this value satisfies.
    pub fn data_type(&self) -> DataType {
        match self {
            TagValue::Bool(_) => DataType::Bool,
            TagValue::Int(_) => DataType::Int,
            TagValue::Float(_) => DataType::Float,
            TagValue::Text(_) => DataType::String,
        }
    }

    /// Returns true if this value can be written to a tag declared as `ty`.
    pub fn matches(&self, ty: DataType) -> bool {
        self.data_type() == ty || (ty == DataType::Float && matches!(self, TagValue::Int(_)))
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Bool(v) => write!(f, "{v}"),
            TagValue::Int(v) => write!(f, "{v}"),
            TagValue::Float(v) => write!(f, "{v}"),
            TagValue::Text(v) => write!(f, "{v}"),
        }
    }
}

/// Quality indicator attached to every tag value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Quality {
    /// Value was read successfully in the most recent poll
    Good,
    /// Value is from an earlier poll; the device is currently unreachable
    Stale,
    /// The most recent read of this tag failed
    Bad,
    /// Never read since registration
    #[default]
    Uninit,
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quality::Good => write!(f, "GOOD"),
            Quality::Stale => write!(f, "STALE"),
            Quality::Bad => write!(f, "BAD"),
            Quality::Uninit => write!(f, "UNINIT"),
        }
    }
}

/// Configuration-time definition of a tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagDef {
    /// Human-readable name
    pub name: String,
    /// Protocol address, e.g. `"40001"` for a holding register
    pub address: String,
    /// Declared data type
    pub data_type: DataType,
    /// Whether writes are permitted
    #[serde(default)]
    pub writable: bool,
    /// Engineering unit, e.g. `"degC"`
    #[serde(default)]
    pub unit: Option<String>,
    /// Free-form description
    #[serde(default)]
    pub description: Option<String>,
}

impl TagDef {
    pub fn validate(&self, device_id: &str) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidTag {
                device_id: device_id.to_string(),
                address: self.address.clone(),
                reason: "tag name must not be empty".to_string(),
            }
            .into());
        }
        if self.address.trim().is_empty() {
            return Err(ConfigError::InvalidTag {
                device_id: device_id.to_string(),
                address: self.address.clone(),
                reason: "tag address must not be empty".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Runtime state of a tag: the definition plus its last known value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub address: String,
    pub data_type: DataType,
    pub writable: bool,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Last known value, if any poll has succeeded
    pub value: Option<TagValue>,
    pub quality: Quality,
    /// Timestamp of the last quality/value change
    pub updated_at: Option<DateTime<Utc>>,
}

impl Tag {
    /// Initial runtime state for a tag definition.
    pub fn from_def(def: &TagDef) -> Self {
        Self {
            name: def.name.clone(),
            address: def.address.clone(),
            data_type: def.data_type,
            writable: def.writable,
            unit: def.unit.clone(),
            description: def.description.clone(),
            value: None,
            quality: Quality::Uninit,
            updated_at: None,
        }
    }
}

/// Registration-time configuration of a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique, immutable identifier
    pub id: DeviceId,
    /// Wire protocol this device speaks
    pub protocol: ProtocolKind,
    /// Network host (name or address)
    pub host: String,
    /// Network port
    pub port: u16,
    /// Free-form protocol-specific parameters
    #[serde(default)]
    pub params: HashMap<String, String>,
    /// Tags owned by this device
    #[serde(default)]
    pub tags: Vec<TagDef>,
}

impl DeviceConfig {
    /// Validates the definition. Invalid devices are rejected at
    /// registration time, never silently accepted.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::invalid_value("device.id", "must not be empty").into());
        }
        if self.host.trim().is_empty() {
            return Err(GatewayError::Config(ConfigError::invalid_value(
                "device.host",
                "must not be empty",
            )));
        }
        if self.port == 0 {
            return Err(ConfigError::invalid_value("device.port", "must be non-zero").into());
        }
        let mut seen = std::collections::HashSet::new();
        for tag in &self.tags {
            tag.validate(&self.id)?;
            if !seen.insert(tag.address.as_str()) {
                return Err(ConfigError::InvalidTag {
                    device_id: self.id.clone(),
                    address: tag.address.clone(),
                    reason: "duplicate tag address".to_string(),
                }
                .into());
            }
        }
        Ok(())
    }
}

/// Point-in-time snapshot of a device's runtime state, as exposed by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub id: DeviceId,
    pub protocol: ProtocolKind,
    pub host: String,
    pub port: u16,
    pub connected: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub tag_count: usize,
    pub polls_total: u64,
    pub read_errors: u64,
    pub writes_total: u64,
}

/// Event emitted after every successful tag read and every applied write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagUpdate {
    pub device_id: DeviceId,
    pub tag: Tag,
}

/// Category of a security-relevant action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Authentication,
    Connection,
    Write,
    Protocol,
    Configuration,
}

/// Outcome of an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
    Error,
}

/// Immutable record of a security-relevant action. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub category: AuditCategory,
    /// User or device identifier that performed the action
    pub actor: String,
    pub action: String,
    pub outcome: AuditOutcome,
    /// Free-form structured detail
    #[serde(default)]
    pub detail: Option<serde_json::Value>,
}

impl AuditEvent {
    pub fn new(
        category: AuditCategory,
        actor: impl Into<String>,
        action: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            category,
            actor: actor.into(),
            action: action.into(),
            outcome,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}
