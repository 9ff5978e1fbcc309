//! Producer endpoints and per-connection queue inspection.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::queue::{Priority, QueueStats};
use crate::server::AppState;

/// Request to enqueue a message for one connection
#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    /// Type tag (e.g., "order.created")
    pub message_type: String,
    /// Opaque payload; missing or null is rejected
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub connection_id: String,
    /// `false` when the queue was full with nothing lower to evict, or closed
    pub accepted: bool,
}

/// POST /api/v1/connections/{id}/messages
pub async fn enqueue_message(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
    Json(request): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>)> {
    let queue = state
        .registry
        .get(&connection_id)
        .ok_or_else(|| AppError::NotFound(format!("Connection {}", connection_id)))?;

    let accepted = queue
        .enqueue(request.payload, request.message_type, request.priority)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            connection_id,
            accepted,
        }),
    ))
}

/// GET /api/v1/connections/{id}/stats
pub async fn connection_stats(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
) -> Result<Json<QueueStats>> {
    let queue = state
        .registry
        .get(&connection_id)
        .ok_or_else(|| AppError::NotFound(format!("Connection {}", connection_id)))?;

    Ok(Json(queue.stats().await))
}
