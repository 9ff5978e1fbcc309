//! Graceful shutdown of the queue service.
//!
//! Shutdown runs in two phases:
//! 1. Flush: one last drain of every queue whose connection is ready,
//!    bounded by a deadline
//! 2. Close: every queue is closed and unregistered; whatever is still held
//!    is discarded and reported

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::timeout;

use crate::config::ShutdownSettings;
use crate::registry::MessageQueueRegistry;

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time allowed for the flush phase (default: 5 seconds)
    pub flush_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            flush_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&ShutdownSettings> for ShutdownConfig {
    fn from(settings: &ShutdownSettings) -> Self {
        Self {
            flush_timeout: Duration::from_millis(settings.flush_timeout_ms),
        }
    }
}

/// Flushes and closes every registered queue
pub struct GracefulShutdown {
    registry: Arc<MessageQueueRegistry>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(registry: Arc<MessageQueueRegistry>) -> Self {
        Self::with_config(registry, ShutdownConfig::default())
    }

    pub fn with_config(registry: Arc<MessageQueueRegistry>, config: ShutdownConfig) -> Self {
        Self { registry, config }
    }

    /// Execute the shutdown sequence
    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(total_queues = self.registry.len())
    )]
    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Flushing ready queues");
        let (flushed, completed) = self.flush_ready_queues().await;
        result.queues_flushed = flushed;
        result.flush_completed = completed;

        tracing::info!("Phase 2: Closing message queues");
        result.queues_closed = self.registry.len();
        result.messages_discarded = self.registry.close_all().await;

        result.duration = start.elapsed();
        result.success = true;

        tracing::info!(
            queues_flushed = result.queues_flushed,
            queues_closed = result.queues_closed,
            messages_discarded = result.messages_discarded,
            flush_completed = result.flush_completed,
            duration_ms = result.duration.as_millis() as u64,
            "Graceful shutdown completed"
        );

        result
    }

    /// Drain every ready queue with a backlog. Returns how many drains ran
    /// and whether they all finished inside the deadline.
    async fn flush_ready_queues(&self) -> (usize, bool) {
        let mut candidates = Vec::new();
        for queue in self.registry.queues() {
            let stats = queue.stats().await;
            if stats.connection_ready && stats.pending > 0 {
                candidates.push(queue);
            }
        }

        if candidates.is_empty() {
            return (0, true);
        }

        tracing::info!(queues = candidates.len(), "Flushing queues with pending messages");

        let mut drains: FuturesUnordered<_> = candidates
            .into_iter()
            .map(|queue| async move { queue.drain().await })
            .collect();

        let mut flushed = 0;
        let flush = async {
            while let Some(performed) = drains.next().await {
                if performed {
                    flushed += 1;
                }
            }
        };

        let completed = timeout(self.config.flush_timeout, flush).await.is_ok();
        if !completed {
            tracing::warn!(
                flushed = flushed,
                timeout_ms = self.config.flush_timeout.as_millis() as u64,
                "Queue flush timed out, remaining messages will be discarded"
            );
        }

        (flushed, completed)
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    pub success: bool,
    /// Queues that completed a final drain
    pub queues_flushed: usize,
    /// Queues closed in the second phase
    pub queues_closed: usize,
    /// Messages still held when their queue was closed
    pub messages_discarded: usize,
    /// Whether the flush phase finished before its deadline
    pub flush_completed: bool,
    /// Total time taken for shutdown
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Deliver, DeliveryError, Priority, QueueConfig, QueuedMessage, Readiness};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting(AtomicUsize);

    #[async_trait]
    impl Deliver for Counting {
        async fn deliver(&self, _message: &QueuedMessage) -> Result<(), DeliveryError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Never completes, simulating a stuck transport
    struct Stuck;

    #[async_trait]
    impl Deliver for Stuck {
        async fn deliver(&self, _message: &QueuedMessage) -> Result<(), DeliveryError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_shutdown_empty_registry() {
        let registry = Arc::new(MessageQueueRegistry::new(QueueConfig::default()));
        let result = GracefulShutdown::new(registry).execute("test shutdown").await;

        assert!(result.success);
        assert!(result.flush_completed);
        assert_eq!(result.queues_flushed, 0);
        assert_eq!(result.queues_closed, 0);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_ready_and_discards_buffered() {
        let registry = Arc::new(MessageQueueRegistry::new(QueueConfig::default()));
        let sink = Arc::new(Counting::default());

        // Ready connection whose backlog has not been drained yet
        let ready = registry.create("ready", "user-1", None).unwrap();
        ready.register_delivery_function(sink.clone()).await;
        ready.enqueue(json!({"n": 1}), "test.event", Priority::Normal).await.unwrap();
        ready.enqueue(json!({"n": 2}), "test.event", Priority::High).await.unwrap();
        ready.inner.lock().await.readiness = Readiness::Ready;

        // Connection that never became ready
        let buffering = registry.create("buffering", "user-2", None).unwrap();
        buffering.enqueue(json!({"n": 3}), "test.event", Priority::Low).await.unwrap();

        let result = GracefulShutdown::new(registry.clone()).execute("test").await;

        assert_eq!(result.queues_flushed, 1);
        assert_eq!(result.queues_closed, 2);
        assert_eq!(result.messages_discarded, 1);
        assert_eq!(sink.0.load(Ordering::SeqCst), 2);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_deadline() {
        let registry = Arc::new(MessageQueueRegistry::new(QueueConfig::default()));
        let queue = registry.create("stuck", "user-1", None).unwrap();
        queue.register_delivery_function(Arc::new(Stuck)).await;
        queue.enqueue(json!({"n": 1}), "test.event", Priority::Normal).await.unwrap();
        queue.inner.lock().await.readiness = Readiness::Ready;

        let config = ShutdownConfig {
            flush_timeout: Duration::from_millis(100),
        };
        let result = GracefulShutdown::with_config(registry, config).execute("test").await;

        assert!(!result.flush_completed);
        assert_eq!(result.queues_flushed, 0);
        assert_eq!(result.queues_closed, 1);
    }

    #[test]
    fn test_shutdown_config_from_settings() {
        let config = ShutdownConfig::from(&ShutdownSettings {
            flush_timeout_ms: 1500,
        });
        assert_eq!(config.flush_timeout, Duration::from_millis(1500));
    }
}
