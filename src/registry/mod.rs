//! Process-wide map from connection id to its message queue.
//!
//! Constructed once at startup and shared through `AppState`. Each id maps
//! to at most one live queue; create and remove for the same id are
//! serialized by the map's per-key locking.

mod stats;

pub use stats::RegistryStats;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

use crate::error::QueueError;
use crate::metrics::RegistryMetrics;
use crate::queue::{Clock, MessageQueue, QueueConfig, SystemClock};

pub struct MessageQueueRegistry {
    /// connection_id -> queue
    queues: DashMap<String, Arc<MessageQueue>>,
    defaults: QueueConfig,
    clock: Arc<dyn Clock>,
}

impl MessageQueueRegistry {
    pub fn new(defaults: QueueConfig) -> Self {
        Self::with_clock(defaults, Arc::new(SystemClock))
    }

    pub fn with_clock(defaults: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            queues: DashMap::new(),
            defaults,
            clock,
        }
    }

    pub fn defaults(&self) -> &QueueConfig {
        &self.defaults
    }

    fn build(&self, connection_id: &str, owner: &str, config: Option<QueueConfig>) -> Arc<MessageQueue> {
        Arc::new(MessageQueue::with_clock(
            connection_id,
            owner,
            config.unwrap_or_else(|| self.defaults.clone()),
            self.clock.clone(),
        ))
    }

    /// Create the queue for `connection_id`.
    ///
    /// Fails with `QueueError::AlreadyRegistered` when a live queue exists.
    /// `config` overrides the registry defaults for this queue.
    pub fn create(
        &self,
        connection_id: &str,
        owner: &str,
        config: Option<QueueConfig>,
    ) -> Result<Arc<MessageQueue>, QueueError> {
        match self.queues.entry(connection_id.to_string()) {
            Entry::Occupied(_) => Err(QueueError::AlreadyRegistered(connection_id.to_string())),
            Entry::Vacant(slot) => {
                let queue = self.build(connection_id, owner, config);
                slot.insert(queue.clone());
                RegistryMetrics::record_queue_created();
                tracing::info!(connection_id = %connection_id, owner = %owner, "Message queue registered");
                Ok(queue)
            }
        }
    }

    /// Return the live queue for `connection_id`, creating it if absent.
    pub fn get_or_create(
        &self,
        connection_id: &str,
        owner: &str,
        config: Option<QueueConfig>,
    ) -> Arc<MessageQueue> {
        match self.queues.entry(connection_id.to_string()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => {
                let queue = self.build(connection_id, owner, config);
                slot.insert(queue.clone());
                RegistryMetrics::record_queue_created();
                tracing::info!(connection_id = %connection_id, owner = %owner, "Message queue registered");
                queue
            }
        }
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<MessageQueue>> {
        self.queues.get(connection_id).map(|q| q.value().clone())
    }

    /// Close and unregister a queue. Returns `false` for an unknown id.
    pub async fn remove(&self, connection_id: &str) -> bool {
        // Unlink first so no caller can fetch a queue that is closing
        let Some((_, queue)) = self.queues.remove(connection_id) else {
            return false;
        };

        let discarded = queue.close().await;
        RegistryMetrics::record_queue_removed();
        tracing::info!(
            connection_id = %connection_id,
            owner = %queue.owner(),
            discarded = discarded,
            "Message queue unregistered"
        );
        true
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn connection_ids(&self) -> Vec<String> {
        self.queues.iter().map(|e| e.key().clone()).collect()
    }

    /// Snapshot of every live queue
    pub fn queues(&self) -> Vec<Arc<MessageQueue>> {
        self.queues.iter().map(|e| e.value().clone()).collect()
    }

    /// Aggregate counts over all live queues.
    pub async fn stats(&self) -> RegistryStats {
        // Collect before awaiting so no shard lock is held across a suspension
        let queues = self.queues();

        let mut stats = RegistryStats::default();
        for queue in queues {
            stats.add(&queue.stats().await);
        }

        RegistryMetrics::set_total_size(stats.total_size);
        stats
    }

    /// Close and unregister every queue. Returns the number of messages
    /// discarded.
    pub async fn close_all(&self) -> usize {
        let mut discarded = 0;
        for connection_id in self.connection_ids() {
            if let Some((_, queue)) = self.queues.remove(&connection_id) {
                discarded += queue.close().await;
                RegistryMetrics::record_queue_removed();
            }
        }

        tracing::info!(discarded = discarded, "All message queues closed");
        discarded
    }
}

impl Default for MessageQueueRegistry {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{ManualClock, Priority, QueueState};
    use serde_json::json;

    fn registry() -> MessageQueueRegistry {
        MessageQueueRegistry::with_clock(QueueConfig::default(), Arc::new(ManualClock::default()))
    }

    #[test]
    fn test_create_and_get() {
        let registry = registry();
        let queue = registry.create("conn-1", "user-1", None).unwrap();

        let fetched = registry.get("conn-1").unwrap();
        assert!(Arc::ptr_eq(&queue, &fetched));
        assert_eq!(fetched.owner(), "user-1");
        assert!(registry.get("conn-2").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_create_fails() {
        let registry = registry();
        registry.create("conn-1", "user-1", None).unwrap();

        let err = registry.create("conn-1", "user-2", None).unwrap_err();
        assert_eq!(err, QueueError::AlreadyRegistered("conn-1".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_or_create_returns_existing() {
        let registry = registry();
        let first = registry.get_or_create("conn-1", "user-1", None);
        let second = registry.get_or_create("conn-1", "user-1", None);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_per_queue_config_override() {
        let registry = registry();
        let config = QueueConfig {
            max_size: 3,
            ..Default::default()
        };
        let queue = registry.create("conn-1", "user-1", Some(config)).unwrap();
        assert_eq!(queue.config().max_size, 3);

        let other = registry.create("conn-2", "user-1", None).unwrap();
        assert_eq!(other.config().max_size, 1000);
    }

    #[tokio::test]
    async fn test_remove_closes_queue() {
        let registry = registry();
        let queue = registry.create("conn-1", "user-1", None).unwrap();

        assert!(registry.remove("conn-1").await);
        assert!(!registry.remove("conn-1").await);
        assert!(registry.get("conn-1").is_none());
        assert_eq!(queue.state().await, QueueState::Closed);

        // The id can be reused for a fresh queue
        let fresh = registry.create("conn-1", "user-1", None).unwrap();
        assert!(!Arc::ptr_eq(&queue, &fresh));
        assert_eq!(fresh.state().await, QueueState::Buffering);
    }

    #[tokio::test]
    async fn test_aggregate_stats() {
        let registry = registry();
        let a = registry.create("conn-a", "user-1", None).unwrap();
        let b = registry.create("conn-b", "user-2", None).unwrap();

        a.enqueue(json!({"n": 1}), "test.event", Priority::Normal).await.unwrap();
        a.enqueue(json!({"n": 2}), "test.event", Priority::Low).await.unwrap();
        b.enqueue(json!({"n": 3}), "test.event", Priority::High).await.unwrap();
        b.close().await;

        let stats = registry.stats().await;
        assert_eq!(stats.queues, 2);
        assert_eq!(stats.total_size, 2);
        assert_eq!(stats.queued, 3);
        assert_eq!(stats.by_state.get("BUFFERING"), Some(&1));
        assert_eq!(stats.by_state.get("CLOSED"), Some(&1));
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = registry();
        for i in 0..3 {
            let queue = registry.create(&format!("conn-{i}"), "user-1", None).unwrap();
            queue.enqueue(json!({"n": i}), "test.event", Priority::Normal).await.unwrap();
        }

        assert_eq!(registry.close_all().await, 3);
        assert!(registry.is_empty());
    }
}
