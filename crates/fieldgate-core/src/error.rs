//! Error types for the Fieldgate edge gateway.
//!
//! Every failure in the system falls into one of five categories: transport,
//! protocol, capacity, authentication, or configuration. The category decides
//! how the engine reacts (retry, evict, surface to caller) and what the API
//! reports, so the taxonomy lives here rather than in the crates that raise
//! the errors. All variants are serializable for API responses and logging.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Result type alias using [`GatewayError`] as the error type.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Top-level error type for all gateway operations.
#[derive(Debug, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum GatewayError {
    /// Transport-level failures: connect, reset, timeout. Retryable.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Wire protocol violations: malformed frames, unknown operations.
    /// Not retryable on the same connection.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Resource ceilings reached: connection limits, buffer capacity.
    #[error("Capacity error: {0}")]
    Capacity(#[from] CapacityError),

    /// Authentication and authorization failures. Always audited.
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Invalid device, tag, or gateway configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Internal errors that shouldn't normally occur.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable category label used in structured API error responses.
    pub fn category(&self) -> &'static str {
        match self {
            GatewayError::Transport(_) => "transport",
            GatewayError::Protocol(_) => "protocol",
            GatewayError::Capacity(_) => "capacity",
            GatewayError::Auth(_) => "auth",
            GatewayError::Config(_) => "config",
            GatewayError::Internal(_) => "internal",
        }
    }

    /// Returns true if retrying the same operation may succeed without
    /// operator intervention.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Transport(e) => e.is_transient(),
            GatewayError::Capacity(_) => true,
            _ => false,
        }
    }
}

/// Errors on the transport path between the gateway and a field device.
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum TransportError {
    /// Failed to establish a connection
    #[error("Failed to connect to {host}:{port}: {reason}")]
    ConnectFailed {
        host: String,
        port: u16,
        reason: String,
    },

    /// Connection was unexpectedly closed
    #[error("Connection closed unexpectedly: {reason}")]
    ConnectionClosed { reason: String },

    /// Connection was reset by peer
    #[error("Connection reset by peer")]
    ConnectionReset,

    /// Operation exceeded its deadline
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Operation attempted on a connection that is not established
    #[error("Not connected")]
    NotConnected,

    /// Underlying I/O failure
    #[error("I/O error: {message}")]
    Io { message: String },
}

impl TransportError {
    /// Creates a connect failure error.
    pub fn connect_failed(host: impl Into<String>, port: u16, reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            host: host.into(),
            port,
            reason: reason.into(),
        }
    }

    /// Creates a timeout error for the named operation.
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Returns true if this error is transient and the operation can be
    /// retried on a fresh connection.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectFailed { .. }
                | TransportError::ConnectionReset
                | TransportError::Timeout { .. }
                | TransportError::ConnectionClosed { .. }
        )
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset => TransportError::ConnectionReset,
            io::ErrorKind::TimedOut => TransportError::Timeout {
                operation: "io".to_string(),
                timeout_ms: 0,
            },
            io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => {
                TransportError::ConnectionClosed {
                    reason: err.to_string(),
                }
            }
            _ => TransportError::Io {
                message: err.to_string(),
            },
        }
    }
}

impl From<io::Error> for GatewayError {
    fn from(err: io::Error) -> Self {
        GatewayError::Transport(err.into())
    }
}

/// Wire protocol violations.
///
/// A protocol error means the peer sent something the codec refuses to
/// interpret; the connection it arrived on is evicted rather than reused.
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum ProtocolError {
    /// Frame header declares a payload larger than the hard cap
    #[error("Frame declares {declared} payload bytes, maximum is {max}")]
    OversizedFrame { declared: usize, max: usize },

    /// Operation code outside the known set
    #[error("Unknown operation code 0x{code:02x}")]
    UnknownOpCode { code: u8 },

    /// Frame failed structural validation
    #[error("Malformed frame: {details}")]
    MalformedFrame { details: String },

    /// Response transaction id does not match the request
    #[error("Transaction mismatch: expected {expected}, got {actual}")]
    TransactionMismatch { expected: u16, actual: u16 },

    /// Device reported an exception for the requested operation
    #[error("Device exception 0x{code:02x} for {operation}")]
    DeviceException { operation: String, code: u8 },

    /// Operation is not supported by this protocol or device. Permanent.
    #[error("Unsupported operation: {operation}")]
    UnsupportedOperation { operation: String },

    /// Payload bytes could not be decoded into the declared data type
    #[error("Value decode failed: {details}")]
    ValueDecode { details: String },
}

impl ProtocolError {
    /// Creates a malformed frame error.
    pub fn malformed(details: impl Into<String>) -> Self {
        Self::MalformedFrame {
            details: details.into(),
        }
    }

    /// Returns true if no reconnect will ever make this operation succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ProtocolError::UnsupportedOperation { .. })
    }
}

/// Resource ceiling errors. Caller-visible and non-fatal.
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum CapacityError {
    /// Per-device connection ceiling reached
    #[error("Connection ceiling for device '{device_id}' reached ({limit})")]
    DeviceCeiling { device_id: String, limit: usize },

    /// Global connection ceiling reached
    #[error("Global connection ceiling reached ({limit})")]
    GlobalCeiling { limit: usize },

    /// Outbound buffer at capacity
    #[error("Buffer at capacity ({capacity})")]
    BufferFull { capacity: usize },
}

/// Authentication and authorization failures.
///
/// `InvalidCredentials` deliberately carries no detail: the response must not
/// reveal whether the identity exists or the secret was wrong.
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum AuthError {
    /// Credential rejected. Uniform for unknown identity and wrong secret.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Authenticated identity lacks permission for the action
    #[error("Permission denied for {action}")]
    PermissionDenied { action: String },

    /// Request arrived without a credential where one is required
    #[error("Authentication required")]
    MissingCredentials,
}

/// Errors in device, tag, or gateway configuration.
/// Rejected at registration or load time, never silently accepted.
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    /// Missing required configuration field
    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    /// Invalid configuration value
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// Device identifier already registered
    #[error("Device '{id}' is already registered")]
    DuplicateDevice { id: String },

    /// Device identifier not known to the registry
    #[error("Unknown device '{id}'")]
    UnknownDevice { id: String },

    /// Tag address not defined on the device
    #[error("Unknown tag '{address}' on device '{device_id}'")]
    UnknownTag { device_id: String, address: String },

    /// Invalid tag definition
    #[error("Invalid tag '{address}' on device '{device_id}': {reason}")]
    InvalidTag {
        device_id: String,
        address: String,
        reason: String,
    },

    /// Tag is not writable
    #[error("Tag '{address}' on device '{device_id}' is read-only")]
    TagNotWritable { device_id: String, address: String },
}

impl ConfigError {
    /// Creates an invalid value error.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_transient() {
        let err = TransportError::timeout("read_value", 2_000);
        assert!(err.is_transient());
        assert!(GatewayError::from(err).is_transient());
    }

    #[test]
    fn unsupported_operation_is_permanent() {
        let err = ProtocolError::UnsupportedOperation {
            operation: "write_value".to_string(),
        };
        assert!(err.is_permanent());
        assert!(!GatewayError::from(err).is_transient());
    }

    #[test]
    fn categories_are_stable() {
        let err: GatewayError = CapacityError::GlobalCeiling { limit: 64 }.into();
        assert_eq!(err.category(), "capacity");

        let err: GatewayError = AuthError::InvalidCredentials.into();
        assert_eq!(err.category(), "auth");
    }

    #[test]
    fn invalid_credentials_carries_no_detail() {
        let unknown_id: GatewayError = AuthError::InvalidCredentials.into();
        let wrong_secret: GatewayError = AuthError::InvalidCredentials.into();
        assert_eq!(unknown_id.to_string(), wrong_secret.to_string());
    }

    #[test]
    fn io_error_maps_to_transport() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let err: GatewayError = io_err.into();
        assert!(matches!(
            err,
            GatewayError::Transport(TransportError::ConnectionReset)
        ));
    }

    #[test]
    fn errors_serialize_for_api_responses() {
        let err: GatewayError = TransportError::connect_failed("10.0.0.7", 1502, "refused").into();
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("Transport"));
        assert!(json.contains("10.0.0.7"));
    }
}
