//! API layer - HTTP endpoints for producers and operators.

mod handlers;
mod health;
mod metrics;
mod routes;

pub use handlers::{connection_stats, enqueue_message, EnqueueRequest, EnqueueResponse};
pub use health::{health, stats, HealthResponse};
pub use metrics::prometheus_metrics;
pub use routes::api_routes;
