use axum::{
    routing::{get, post},
    Router,
};

use crate::server::AppState;

use super::handlers::{connection_stats, enqueue_message};
use super::health::{health, stats};
use super::metrics::prometheus_metrics;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        // Health, stats & metrics
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(prometheus_metrics))
        // Producer endpoints
        .nest(
            "/api/v1",
            Router::new()
                .route("/connections/{id}/messages", post(enqueue_message))
                .route("/connections/{id}/stats", get(connection_stats)),
        )
}
