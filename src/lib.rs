// Core queue engine
pub mod lifecycle;
pub mod queue;
pub mod registry;

// Shared infrastructure
pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;

// Service surface
pub mod api;
pub mod server;
pub mod websocket;

// Supporting modules
pub mod shutdown;

pub use lifecycle::{attach_lifecycle, ConnectionLifecycle, ConnectionPhase};
pub use queue::{
    Clock, Deliver, DeliveryError, ManualClock, MessageQueue, Priority, QueueConfig, QueueState,
    QueueStats, QueuedMessage, Readiness, RetryPolicy, SystemClock,
};
pub use registry::{MessageQueueRegistry, RegistryStats};
