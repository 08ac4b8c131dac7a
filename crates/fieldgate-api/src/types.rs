//! Request and response bodies for the gateway API.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use fieldgate_core::{
    AuthError, CapacityError, ConfigError, DataType, DeviceStatus, GatewayError, Tag, TagValue,
};
use fieldgate_security::{SealedValue, ValueCipher};
use serde::{Deserialize, Serialize};

/// Structured error body: a taxonomy category plus a human message.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub category: String,
    pub message: String,
}

/// Wrapper mapping [`GatewayError`] onto HTTP status codes.
#[derive(Debug)]
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GatewayError::Transport(_) | GatewayError::Protocol(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Capacity(CapacityError::BufferFull { .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Capacity(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Auth(AuthError::PermissionDenied { .. }) => StatusCode::FORBIDDEN,
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Config(ConfigError::UnknownDevice { .. })
            | GatewayError::Config(ConfigError::UnknownTag { .. }) => StatusCode::NOT_FOUND,
            GatewayError::Config(ConfigError::DuplicateDevice { .. }) => StatusCode::CONFLICT,
            GatewayError::Config(_) => StatusCode::BAD_REQUEST,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            category: self.0.category().to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceList {
    pub devices: Vec<DeviceStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceDetail {
    #[serde(flatten)]
    pub status: DeviceStatus,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemoveDeviceResponse {
    pub removed: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TagReadRequest {
    pub device_id: String,
    pub tag_address: String,
}

/// The readable state of a tag: sealed once a value exists, bare quality
/// before the first successful read.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagState {
    Sealed(SealedValue),
    Unread { quality: fieldgate_core::Quality },
}

/// A tag as it leaves the gateway: metadata in the clear, the (value,
/// quality) pair sealed per the deployment's encryption setting.
#[derive(Debug, Serialize, Deserialize)]
pub struct TagEnvelope {
    pub name: String,
    pub address: String,
    pub data_type: DataType,
    pub writable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub state: TagState,
}

impl TagEnvelope {
    /// Seals a registry tag for transport.
    pub fn seal(cipher: &ValueCipher, tag: &Tag) -> Result<Self, GatewayError> {
        let state = match &tag.value {
            Some(value) => TagState::Sealed(cipher.seal(value, tag.quality)?),
            None => TagState::Unread {
                quality: tag.quality,
            },
        };
        Ok(Self {
            name: tag.name.clone(),
            address: tag.address.clone(),
            data_type: tag.data_type,
            writable: tag.writable,
            unit: tag.unit.clone(),
            updated_at: tag.updated_at,
            state,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TagReadResponse {
    pub device_id: String,
    pub tag: TagEnvelope,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TagWriteRequest {
    pub device_id: String,
    pub tag_address: String,
    pub value: TagValue,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TagWriteResponse {
    pub device_id: String,
    pub tag: TagEnvelope,
}

/// One streamed event: `{"type": "tag_update", "device_id": ..., "tag": ...}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub device_id: String,
    pub tag: TagEnvelope,
}

impl StreamEvent {
    pub fn tag_update(device_id: String, tag: TagEnvelope) -> Self {
        Self {
            kind: "tag_update".to_string(),
            device_id,
            tag,
        }
    }
}
