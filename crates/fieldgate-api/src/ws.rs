//! WebSocket streaming of tag updates.
//!
//! Each client gets its own broadcaster subscription. Events are forwarded
//! as one JSON object per message; a client that stops draining falls
//! behind on its bounded channel and loses events rather than slowing the
//! publisher, and a closed socket drops the subscription so the
//! broadcaster prunes it.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tracing::{debug, info};

use crate::types::{StreamEvent, TagEnvelope};
use crate::ApiState;

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/stream", get(stream_handler))
        .with_state(state)
}

/// GET /api/stream - upgrade and stream tag updates.
async fn stream_handler(ws: WebSocketUpgrade, State(state): State<ApiState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_socket(socket, state))
}

async fn stream_socket(mut socket: WebSocket, state: ApiState) {
    let subscription = state.engine.subscribe();
    info!(subscriber_id = %subscription.id, "Stream client connected");

    loop {
        tokio::select! {
            update = subscription.rx.recv_async() => {
                let Ok(update) = update else {
                    // Broadcaster shut down.
                    break;
                };
                let envelope =
                    match TagEnvelope::seal(&state.engine.security().cipher, &update.tag) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            debug!(error = %e, "Skipping unsealable update");
                            continue;
                        }
                    };
                let event = StreamEvent::tag_update(update.device_id, envelope);
                let Ok(text) = serde_json::to_string(&event) else {
                    continue;
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // pings and client chatter are ignored
                    Some(Err(_)) => break,
                }
            }
        }
    }

    state.engine.broadcaster().unsubscribe(subscription.id);
    info!(subscriber_id = %subscription.id, "Stream client disconnected");
}
