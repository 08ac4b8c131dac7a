//! Configuration management for the Fieldgate edge gateway.
//!
//! Configuration is loaded from a YAML file, with serde defaults for every
//! optional field, and validated as a whole before the engine is built.
//! Devices may be declared statically here or registered later through the
//! API; both paths go through the same [`DeviceConfig::validate`] checks.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::types::DeviceConfig;

/// Root configuration for the gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub polling: PollingSettings,

    #[serde(default)]
    pub pool: PoolSettings,

    #[serde(default)]
    pub buffer: BufferSettings,

    #[serde(default)]
    pub security: SecuritySettings,

    #[serde(default)]
    pub api: ApiSettings,

    #[serde(default)]
    pub metrics: MetricsSettings,

    #[serde(default)]
    pub logging: LoggingSettings,

    /// Devices to register at startup
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl GatewayConfig {
    /// Loads configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_yaml(&contents)
    }

    /// Loads configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).map_err(|e| ConfigError::LoadFailed {
            path: "<inline>".to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every section and every statically declared device.
    pub fn validate(&self) -> Result<()> {
        self.polling.validate()?;
        self.pool.validate()?;
        self.buffer.validate()?;
        self.security.validate()?;

        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            device.validate()?;
            if !seen.insert(device.id.as_str()) {
                return Err(ConfigError::DuplicateDevice {
                    id: device.id.clone(),
                }
                .into());
            }
        }
        Ok(())
    }
}

/// Polling scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingSettings {
    /// Interval between poll cycles, in milliseconds
    pub interval_ms: u64,
    /// Per-call deadline for a single tag read or write, in milliseconds
    pub call_timeout_ms: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            call_timeout_ms: 2_000,
        }
    }
}

impl PollingSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(ConfigError::invalid_value("polling.interval_ms", "must be non-zero").into());
        }
        if self.call_timeout_ms == 0 {
            return Err(
                ConfigError::invalid_value("polling.call_timeout_ms", "must be non-zero").into(),
            );
        }
        Ok(())
    }
}

/// Connection pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Maximum connections per device
    pub per_device_limit: usize,
    /// Maximum connections across all devices
    pub global_limit: usize,
    /// Idle budget: an idle connection older than this is not reused,
    /// and one older than twice this is swept
    pub idle_timeout_secs: u64,
    /// Deadline for establishing a new connection
    pub connect_timeout_ms: u64,
    /// Interval between background sweeps, in seconds
    pub sweep_interval_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            per_device_limit: 2,
            global_limit: 256,
            idle_timeout_secs: 60,
            connect_timeout_ms: 5_000,
            sweep_interval_secs: 30,
        }
    }
}

impl PoolSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.per_device_limit == 0 {
            return Err(
                ConfigError::invalid_value("pool.per_device_limit", "must be non-zero").into(),
            );
        }
        if self.global_limit < self.per_device_limit {
            return Err(ConfigError::invalid_value(
                "pool.global_limit",
                "must be at least pool.per_device_limit",
            )
            .into());
        }
        if self.idle_timeout_secs == 0 {
            return Err(
                ConfigError::invalid_value("pool.idle_timeout_secs", "must be non-zero").into(),
            );
        }
        Ok(())
    }
}

/// Resilient buffer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferSettings {
    /// Maximum queued entries before oldest-first eviction
    pub capacity: usize,
    /// File the buffer is mirrored to; `None` selects the in-memory variant
    #[serde(default)]
    pub persist_path: Option<String>,
    /// Interval between persistence snapshots, in seconds
    pub persist_interval_secs: u64,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            persist_path: None,
            persist_interval_secs: 30,
        }
    }
}

impl BufferSettings {
    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.persist_interval_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(ConfigError::invalid_value("buffer.capacity", "must be non-zero").into());
        }
        if let Some(path) = &self.persist_path {
            if path.trim().is_empty() {
                return Err(ConfigError::invalid_value(
                    "buffer.persist_path",
                    "must not be empty when set",
                )
                .into());
            }
            if self.persist_interval_secs == 0 {
                return Err(ConfigError::invalid_value(
                    "buffer.persist_interval_secs",
                    "must be non-zero when persistence is enabled",
                )
                .into());
            }
        }
        Ok(())
    }
}

/// How API callers authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// Shared API key carried in a request header
    #[default]
    ApiKey,
}

/// Security boundary settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuritySettings {
    /// Require authentication on the network API
    pub auth_enabled: bool,
    /// Authentication method for API callers
    #[serde(default)]
    pub auth_method: AuthMethod,
    /// Whether the deployment terminates TLS in front of the API listener.
    /// The gateway does not terminate TLS itself; the flag is part of the
    /// reported security posture.
    #[serde(default)]
    pub transport_encryption_enabled: bool,
    /// Encrypt tag values leaving the gateway
    pub value_encryption_enabled: bool,
    /// Hex-encoded 256-bit key for value encryption
    #[serde(default)]
    pub value_encryption_key: Option<String>,
    /// Identifier published alongside encrypted values
    #[serde(default = "default_key_id")]
    pub value_encryption_key_id: String,
    /// Record audit events
    pub audit_enabled: bool,
}

fn default_key_id() -> String {
    "k1".to_string()
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            auth_enabled: false,
            auth_method: AuthMethod::default(),
            transport_encryption_enabled: false,
            value_encryption_enabled: false,
            value_encryption_key: None,
            value_encryption_key_id: default_key_id(),
            audit_enabled: true,
        }
    }
}

impl SecuritySettings {
    fn validate(&self) -> Result<()> {
        if self.value_encryption_enabled {
            match &self.value_encryption_key {
                None => {
                    return Err(ConfigError::MissingField {
                        field: "security.value_encryption_key".to_string(),
                    }
                    .into());
                }
                Some(key) if key.len() != 64 => {
                    return Err(ConfigError::invalid_value(
                        "security.value_encryption_key",
                        "must be 64 hex characters (256 bits)",
                    )
                    .into());
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// API server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    /// Bind address, e.g. `"0.0.0.0:8080"`
    pub bind_addr: String,
    /// Permissive CORS for browser-based dashboards
    pub cors_enabled: bool,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            cors_enabled: true,
        }
    }
}

/// Metrics settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSettings {
    pub enabled: bool,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter, e.g. `"info"` or `"fieldgate=debug"`
    pub level: String,
    /// Emit JSON-formatted log lines
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        GatewayConfig::default().validate().unwrap();
    }

    #[test]
    fn full_yaml_round_trip() {
        let yaml = r#"
polling:
  interval_ms: 500
  call_timeout_ms: 1000
pool:
  per_device_limit: 1
  global_limit: 32
  idle_timeout_secs: 30
  connect_timeout_ms: 2000
  sweep_interval_secs: 15
buffer:
  capacity: 100
  persist_path: /var/lib/fieldgate/buffer.jsonl
  persist_interval_secs: 10
security:
  auth_enabled: true
  value_encryption_enabled: false
  audit_enabled: true
devices:
  - id: plc-1
    protocol: framed_tcp
    host: 10.0.0.7
    port: 1502
    tags:
      - name: line-temp
        address: "40001"
        data_type: float
        writable: false
        unit: degC
"#;
        let config = GatewayConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.polling.interval(), Duration::from_millis(500));
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].tags[0].address, "40001");
    }

    #[test]
    fn zero_interval_rejected() {
        let yaml = "polling:\n  interval_ms: 0\n  call_timeout_ms: 1000\n";
        assert!(GatewayConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn duplicate_device_ids_rejected() {
        let yaml = r#"
devices:
  - id: d1
    protocol: simulated
    host: localhost
    port: 1
  - id: d1
    protocol: simulated
    host: localhost
    port: 2
"#;
        let err = GatewayConfig::from_yaml(yaml).unwrap_err();
        assert_eq!(err.category(), "config");
    }

    #[test]
    fn security_flags_parse_from_yaml() {
        let yaml = r#"
security:
  auth_enabled: true
  auth_method: api_key
  transport_encryption_enabled: true
  value_encryption_enabled: false
  audit_enabled: true
"#;
        let config = GatewayConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.security.auth_method, AuthMethod::ApiKey);
        assert!(config.security.transport_encryption_enabled);
    }

    #[test]
    fn encryption_requires_key() {
        let yaml = "security:\n  auth_enabled: false\n  value_encryption_enabled: true\n  audit_enabled: true\n";
        assert!(GatewayConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn global_limit_must_cover_per_device() {
        let mut config = GatewayConfig::default();
        config.pool.per_device_limit = 8;
        config.pool.global_limit = 4;
        assert!(config.validate().is_err());
    }
}
