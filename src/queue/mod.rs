//! Per-connection outbound message queue.
//!
//! A [`MessageQueue`] buffers messages for one connection while it is being
//! established or is degraded, drains them in priority order once the
//! connection is ready, and hands failed deliveries to a background retry
//! loop with exponential backoff.
//!
//! # Design
//!
//! - Messages live in four FIFO tiers, one per [`Priority`]
//! - Capacity is enforced at admission by evicting the oldest message of the
//!   lowest tier strictly below the incoming priority
//! - Expired messages are purged lazily on enqueue, drain and retry rounds
//! - Mode changes go through the [`QueueState`] transition function
//!
//! # Example
//!
//! ```rust,ignore
//! let queue = Arc::new(MessageQueue::new("conn-1", "user-1", QueueConfig::default()));
//! queue.register_delivery_function(Arc::new(socket_deliverer)).await;
//! queue.start_retry_loop().await;
//!
//! queue.enqueue(json!({"text": "hi"}), "chat.message", Priority::High).await?;
//! queue.drain().await;
//! ```

mod clock;
mod delivery;
mod message;
mod message_queue;
mod retry;
mod state;
mod stats;

use std::time::Duration;

pub use clock::{Clock, ManualClock, SystemClock};
pub use delivery::{Deliver, DeliveryError};
pub use message::{Priority, QueuedMessage, RetryPolicy};
pub use message_queue::MessageQueue;
pub use retry::RetryRound;
pub use state::{QueueEvent, QueueState, Readiness};
pub use stats::QueueStats;

use crate::config::QueueSettings;

/// Runtime configuration for a single queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum number of messages held (pending, in flight and awaiting retry)
    pub max_size: usize,
    /// Messages older than this are discarded; `None` disables aging
    pub max_message_age: Option<Duration>,
    /// Interval between retry loop rounds
    pub retry_poll_interval: Duration,
    /// Retry schedule stamped on every admitted message
    pub retry_policy: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            max_message_age: None,
            retry_poll_interval: Duration::from_millis(500),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl From<&QueueSettings> for QueueConfig {
    fn from(settings: &QueueSettings) -> Self {
        let max_message_age = match settings.max_message_age_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        Self {
            max_size: settings.max_size,
            max_message_age,
            retry_poll_interval: Duration::from_millis(settings.retry_poll_interval_ms.max(1)),
            retry_policy: RetryPolicy {
                max_retries: settings.max_retries,
                base_retry_delay: Duration::from_millis(settings.base_retry_delay_ms),
                max_retry_delay: Duration::from_millis(settings.max_retry_delay_ms),
            },
        }
    }
}
