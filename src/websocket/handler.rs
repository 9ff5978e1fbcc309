use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::error::AppError;
use crate::lifecycle::{attach_lifecycle, ConnectionLifecycle, ConnectionPhase};
use crate::registry::MessageQueueRegistry;
use crate::server::AppState;
use crate::telemetry::attributes;

use super::delivery::WsDeliverer;
use super::message::{ClientMessage, ServerMessage};

const DEFAULT_OWNER: &str = "anonymous";

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub connection_id: Option<String>,
    pub owner: Option<String>,
}

/// WebSocket upgrade handler
#[tracing::instrument(
    name = "ws.upgrade",
    skip(ws, state, query),
    fields(has_connection_id = query.connection_id.is_some())
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Response {
    let connection_id = query
        .connection_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let owner = query.owner.unwrap_or_else(|| DEFAULT_OWNER.to_string());

    if state.registry.get(&connection_id).is_some() {
        tracing::warn!(connection_id = %connection_id, "Connection id already live");
        return AppError::Conflict(format!("Connection {} is already open", connection_id))
            .into_response();
    }

    tracing::info!(connection_id = %connection_id, owner = %owner, "WebSocket upgrade requested");

    ws.on_upgrade(move |socket| handle_socket(socket, state, connection_id, owner))
}

/// Handle an established WebSocket connection
#[tracing::instrument(
    name = "ws.connection",
    skip(socket, state),
    fields(otel.kind = "server")
)]
async fn handle_socket(socket: WebSocket, state: AppState, connection_id: String, owner: String) {
    let span = tracing::Span::current();
    for kv in [attributes::connection_id(&connection_id), attributes::owner(&owner)] {
        span.set_attribute(kv.key, kv.value);
    }

    let connection_start = std::time::Instant::now();
    let ws_settings = &state.settings.websocket;

    // Channel feeding the socket writer; the queue's deliveries go through it
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(ws_settings.channel_buffer_size.max(1));

    let queue = match state.registry.create(&connection_id, &owner, None) {
        Ok(queue) => queue,
        Err(e) => {
            tracing::warn!(connection_id = %connection_id, error = %e, "Connection rejected");
            let (mut ws_sender, _) = socket.split();
            let error_msg = ServerMessage::error("CONNECTION_CONFLICT", e.to_string());
            if let Ok(json) = serde_json::to_string(&error_msg) {
                let _ = ws_sender.send(Message::Text(json.into())).await;
            }
            let _ = ws_sender.close().await;
            return;
        }
    };

    let deliverer = WsDeliverer::new(tx.clone(), Duration::from_millis(ws_settings.send_timeout_ms));
    queue.register_delivery_function(Arc::new(deliverer)).await;
    queue.start_retry_loop().await;

    let lifecycle = Arc::new(ConnectionLifecycle::new());
    let lifecycle_task = attach_lifecycle(queue.clone(), lifecycle.subscribe());

    tracing::info!(
        connection_id = %connection_id,
        owner = %owner,
        "WebSocket connection established"
    );

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Task for sending messages from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize message");
                    continue;
                }
            };

            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Task for receiving messages from WebSocket
    let recv_lifecycle = lifecycle.clone();
    let recv_tx = tx.clone();
    let recv_connection_id = connection_id.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(msg) => {
                    if !process_message(msg, &recv_connection_id, &recv_lifecycle, &recv_tx).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    // Wait for either task to complete
    tokio::select! {
        _ = send_task => {
            tracing::debug!(connection_id = %connection_id, "Send task completed");
        }
        _ = recv_task => {
            tracing::debug!(connection_id = %connection_id, "Receive task completed");
        }
    }

    end_connection(&state.registry, &connection_id, &lifecycle, lifecycle_task).await;

    tracing::info!(
        connection_id = %connection_id,
        owner = %owner,
        duration_secs = connection_start.elapsed().as_secs_f64(),
        "WebSocket connection closed"
    );
}

/// Tear down a finished connection. Removal closes the queue, so it happens
/// before `Closed` is published and a closed queue is never left registered.
async fn end_connection(
    registry: &MessageQueueRegistry,
    connection_id: &str,
    lifecycle: &ConnectionLifecycle,
    lifecycle_task: JoinHandle<()>,
) {
    registry.remove(connection_id).await;
    lifecycle.set(ConnectionPhase::Closed);
    if let Err(e) = lifecycle_task.await {
        tracing::warn!(connection_id = %connection_id, error = %e, "Lifecycle task failed");
    }
}

/// Process a received WebSocket message
/// Returns false if the connection should be closed
async fn process_message(
    msg: Message,
    connection_id: &str,
    lifecycle: &ConnectionLifecycle,
    tx: &mpsc::Sender<ServerMessage>,
) -> bool {
    match msg {
        Message::Text(text) => {
            let client_msg: ClientMessage = match serde_json::from_str(&text) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to parse client message");
                    let _ = tx
                        .send(ServerMessage::error("INVALID_MESSAGE", e.to_string()))
                        .await;
                    return true;
                }
            };

            handle_client_message(client_msg, connection_id, lifecycle, tx).await;
            true
        }
        Message::Binary(_) => {
            let _ = tx
                .send(ServerMessage::error(
                    "UNSUPPORTED_FORMAT",
                    "Binary messages are not supported",
                ))
                .await;
            true
        }
        // Axum answers pings itself
        Message::Ping(_) | Message::Pong(_) => true,
        Message::Close(_) => {
            tracing::debug!(connection_id = %connection_id, "Received close frame");
            false
        }
    }
}

#[tracing::instrument(
    name = "ws.message",
    skip(lifecycle, tx),
    fields(message_type = ?msg)
)]
async fn handle_client_message(
    msg: ClientMessage,
    connection_id: &str,
    lifecycle: &ConnectionLifecycle,
    tx: &mpsc::Sender<ServerMessage>,
) {
    match msg {
        ClientMessage::Ready => lifecycle.set(ConnectionPhase::Ready),
        ClientMessage::Pause => lifecycle.set(ConnectionPhase::Degraded),
        ClientMessage::Ping => {
            let _ = tx.send(ServerMessage::Pong).await;
        }
    }
}
