//! HTTP and websocket transport, served from one axum router.
//!
//! `POST /invoke` is the stateless one-shot path: the body is a single
//! envelope, the response body is the answering envelope, and protocol
//! errors are a 400. `GET /ws` upgrades to the duplex websocket path with
//! one envelope per frame. `GET /health` serves the lifecycle health
//! document. Everything else is a 404.

use crate::lifecycle::LifecycleManager;
use crate::transport::{ChannelResponder, OneshotResponder, TransportMessage};
use crate::wire::decode_envelope;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Shared state behind the router.
#[derive(Clone)]
pub struct HttpServerState {
    pub intake: mpsc::Sender<TransportMessage>,
    pub lifecycle: Arc<LifecycleManager>,
}

/// Build the transport router.
pub fn router(state: HttpServerState) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .route("/invoke", post(invoke_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

fn metadata_from_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_lowercase(), value.to_string()))
        })
        .collect()
}

async fn health_handler(State(state): State<HttpServerState>) -> impl IntoResponse {
    Json(state.lifecycle.health())
}

async fn invoke_handler(
    State(state): State<HttpServerState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    // Validate before queueing so malformed requests become a 400 instead
    // of a silent drop.
    if let Err(e) = decode_envelope(&body) {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }

    let (responder, reply) = OneshotResponder::new();
    let mut message = TransportMessage::new(body.to_vec(), responder);
    message.metadata = metadata_from_headers(&headers);

    if state.intake.send(message).await.is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server stopped").into_response();
    }

    match reply.await {
        Ok(frame) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            frame,
        )
            .into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "no response produced").into_response(),
    }
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<HttpServerState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let metadata = metadata_from_headers(&headers);
    ws.on_upgrade(move |socket| handle_socket(socket, state, metadata))
}

async fn handle_socket(
    socket: WebSocket,
    state: HttpServerState,
    metadata: HashMap<String, String>,
) {
    let conn_id = Uuid::new_v4().to_string();
    log::info!("websocket connected: {}", conn_id);

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(Message::Binary(frame.into())).await.is_err() {
                break;
            }
        }
    });

    let responder = ChannelResponder::new(tx);
    let intake = state.intake.clone();
    let shutdown = state.lifecycle.shutdown_token();
    let conn_id_receive = conn_id.clone();
    let receive_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = ws_receiver.next() => {
                    let payload = match frame {
                        Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
                        Some(Ok(Message::Binary(data))) => data.to_vec(),
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            log::error!("websocket error for {}: {}", conn_id_receive, e);
                            break;
                        }
                    };
                    let mut message = TransportMessage::new(payload, responder.clone())
                        .with_source(conn_id_receive.clone());
                    message.metadata = metadata.clone();
                    if intake.send(message).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = receive_task => {},
    }
    log::info!("websocket closed: {}", conn_id);
}
