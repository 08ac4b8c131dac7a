//! Network API surface of the Fieldgate gateway.
//!
//! REST routes for device management and tag access, a WebSocket stream of
//! tag updates, and the health/metrics endpoints. The router is built around
//! an injected [`ApiState`] holding the engine handle; when authentication
//! is enabled every `/api` route passes through an API-key check backed by
//! the security boundary, while `/health` and `/metrics` stay open for
//! probes and scrapers.

pub mod rest;
pub mod types;
pub mod ws;

use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use fieldgate_core::{AuditCategory, AuditEvent, AuditOutcome, AuthError};
use fieldgate_engine::GatewayEngine;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

pub use types::{ApiError, ErrorBody, StreamEvent, TagEnvelope};

/// Header carrying the API credential as `<id>:<secret>`.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<GatewayEngine>,
    /// Handle the `/metrics` endpoint renders from; `None` when metrics
    /// are disabled.
    pub prometheus: Option<PrometheusHandle>,
}

/// Assembles the full application router.
pub fn router(state: ApiState, cors_enabled: bool) -> Router {
    let mut api = rest::router(state.clone()).merge(ws::router(state.clone()));
    if state.engine.security().authenticator.enabled() {
        api = api.layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));
    }

    let mut app = Router::new()
        .route("/health", get(rest::health))
        .route("/metrics", get(rest::metrics))
        .with_state(state)
        .merge(api)
        .layer(TraceLayer::new_for_http());

    if cors_enabled {
        app = app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }
    app
}

/// Serves the API until the shutdown token fires.
pub async fn serve(
    state: ApiState,
    bind_addr: &str,
    cors_enabled: bool,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = router(state, cors_enabled);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = %listener.local_addr()?, "API server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// API-key check applied ahead of every `/api` route when authentication is
/// enabled. Every attempt is audited; a missing, malformed, or rejected
/// credential produces the same structured auth error either way.
async fn require_api_key(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let security = state.engine.security();

    let credential = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());
    let Some(raw) = credential else {
        security.audit.record(AuditEvent::new(
            AuditCategory::Authentication,
            "anonymous",
            "api_request",
            AuditOutcome::Failure,
        ));
        return Err(ApiError(AuthError::MissingCredentials.into()));
    };

    let (id, secret) = raw.split_once(':').unwrap_or((raw, ""));
    match security.authenticator.authenticate(id, secret) {
        Ok(identity) => {
            security.audit.record(AuditEvent::new(
                AuditCategory::Authentication,
                &identity.id,
                "api_request",
                AuditOutcome::Success,
            ));
            Ok(next.run(request).await)
        }
        Err(e) => {
            security.audit.record(AuditEvent::new(
                AuditCategory::Authentication,
                id,
                "api_request",
                AuditOutcome::Failure,
            ));
            Err(ApiError(e))
        }
    }
}
