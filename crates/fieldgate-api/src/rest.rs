//! REST handlers for device management, tag access, health, and metrics.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use fieldgate_core::{AuditEvent, DeviceConfig};
use serde::Deserialize;
use tracing::info;

use crate::types::{
    ApiError, DeviceDetail, DeviceList, RemoveDeviceResponse, TagEnvelope, TagReadRequest,
    TagReadResponse, TagWriteRequest, TagWriteResponse,
};
use crate::ApiState;

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/devices", post(register_device).get(list_devices))
        .route("/api/devices/{id}", get(get_device).delete(remove_device))
        .route("/api/tags/read", post(read_tag))
        .route("/api/tags/write", post(write_tag))
        .route("/api/audit", get(recent_audit))
        .with_state(state)
}

/// POST /api/devices - register a device.
async fn register_device(
    State(state): State<ApiState>,
    Json(config): Json<DeviceConfig>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state.engine.register_device(config).await?;
    info!(device_id = %status.id, connected = status.connected, "Device registered via API");
    Ok(Json(status))
}

/// GET /api/devices - list devices and runtime state.
async fn list_devices(State(state): State<ApiState>) -> Json<DeviceList> {
    Json(DeviceList {
        devices: state.engine.list_devices(),
    })
}

/// GET /api/devices/{id} - one device with its tag set.
async fn get_device(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<DeviceDetail>, ApiError> {
    let status = state.engine.device_status(&id)?;
    let tags = state.engine.device_tags(&id)?;
    Ok(Json(DeviceDetail { status, tags }))
}

/// DELETE /api/devices/{id} - disconnect and deregister.
async fn remove_device(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<RemoveDeviceResponse>, ApiError> {
    state.engine.remove_device(&id).await?;
    Ok(Json(RemoveDeviceResponse { removed: id }))
}

/// POST /api/tags/read - current value, quality, timestamp of one tag.
async fn read_tag(
    State(state): State<ApiState>,
    Json(request): Json<TagReadRequest>,
) -> Result<Json<TagReadResponse>, ApiError> {
    let tag = state
        .engine
        .read_tag(&request.device_id, &request.tag_address)?;
    let envelope = TagEnvelope::seal(&state.engine.security().cipher, &tag)?;
    Ok(Json(TagReadResponse {
        device_id: request.device_id,
        tag: envelope,
    }))
}

/// POST /api/tags/write - write a value to a writable tag.
async fn write_tag(
    State(state): State<ApiState>,
    Json(request): Json<TagWriteRequest>,
) -> Result<Json<TagWriteResponse>, ApiError> {
    let actor = "api"; // refined by the auth layer when enabled
    let tag = state
        .engine
        .write_tag(
            &request.device_id,
            &request.tag_address,
            request.value,
            actor,
        )
        .await?;
    let envelope = TagEnvelope::seal(&state.engine.security().cipher, &tag)?;
    Ok(Json(TagWriteResponse {
        device_id: request.device_id,
        tag: envelope,
    }))
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    #[serde(default = "default_audit_limit")]
    limit: usize,
}

fn default_audit_limit() -> usize {
    50
}

/// GET /api/audit - most recent audit events, newest first.
async fn recent_audit(
    State(state): State<ApiState>,
    Query(query): Query<AuditQuery>,
) -> Json<Vec<AuditEvent>> {
    Json(state.engine.security().audit.recent(query.limit.min(1_000)))
}

/// GET /health - liveness/readiness summary.
pub async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.engine.health())
}

/// GET /metrics - Prometheus exposition.
pub async fn metrics(State(state): State<ApiState>) -> impl IntoResponse {
    match &state.prometheus {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}
