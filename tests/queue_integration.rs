//! End-to-end behaviour of a single connection queue
//!
//! Covers ordering, capacity, drain exclusivity, aging and the
//! buffering -> flushing -> pass-through cycle through the public API only.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_test::assert_ok;

use ara_outbound_queue::queue::{
    Deliver, DeliveryError, ManualClock, MessageQueue, Priority, QueueConfig, QueueState,
    QueuedMessage,
};

/// Records every delivered message, yielding once per delivery so that
/// concurrent callers get a chance to interleave.
#[derive(Default)]
struct Recorder {
    delivered: Mutex<Vec<(i64, Priority)>>,
    calls: AtomicUsize,
}

impl Recorder {
    fn ids(&self) -> Vec<i64> {
        self.delivered.lock().unwrap().iter().map(|(n, _)| *n).collect()
    }

    fn priorities(&self) -> Vec<Priority> {
        self.delivered.lock().unwrap().iter().map(|(_, p)| *p).collect()
    }
}

#[async_trait]
impl Deliver for Recorder {
    async fn deliver(&self, message: &QueuedMessage) -> Result<(), DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        let n = message.payload["n"].as_i64().unwrap_or_default();
        self.delivered.lock().unwrap().push((n, message.priority));
        Ok(())
    }
}

fn queue(max_size: usize) -> MessageQueue {
    let config = QueueConfig {
        max_size,
        ..Default::default()
    };
    MessageQueue::new("conn-int", "owner-int", config)
}

async fn put(queue: &MessageQueue, n: i64, priority: Priority) -> bool {
    assert_ok!(queue.enqueue(json!({ "n": n }), "test.event", priority).await)
}

#[tokio::test]
async fn drain_respects_priority_tiers() {
    let queue = queue(100);
    let recorder = Arc::new(Recorder::default());
    queue.register_delivery_function(recorder.clone()).await;

    let order = [
        Priority::Low,
        Priority::High,
        Priority::Normal,
        Priority::Critical,
        Priority::Low,
        Priority::Critical,
        Priority::Normal,
        Priority::High,
    ];
    for (n, priority) in order.iter().enumerate() {
        put(&queue, n as i64, *priority).await;
    }

    assert!(queue.drain().await);

    let priorities = recorder.priorities();
    let mut sorted = priorities.clone();
    sorted.sort_by(|a, b| b.cmp(a));
    assert_eq!(priorities, sorted);

    // FIFO inside each tier
    assert_eq!(recorder.ids(), vec![3, 5, 1, 7, 2, 6, 0, 4]);
}

#[tokio::test]
async fn concurrent_drains_have_one_winner() {
    let queue = Arc::new(queue(100));
    let recorder = Arc::new(Recorder::default());
    queue.register_delivery_function(recorder.clone()).await;

    for n in 0..20 {
        put(&queue, n, Priority::Normal).await;
    }

    let (a, b, c, d) = tokio::join!(queue.drain(), queue.drain(), queue.drain(), queue.drain());
    let winners = [a, b, c, d].iter().filter(|won| **won).count();
    assert_eq!(winners, 1);

    let mut ids = recorder.ids();
    assert_eq!(ids.len(), 20);
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 20);
    assert_eq!(recorder.calls.load(Ordering::SeqCst), 20);
}

#[tokio::test]
async fn ready_signal_flushes_then_passes_through() {
    let queue = queue(10);
    let recorder = Arc::new(Recorder::default());
    queue.register_delivery_function(recorder.clone()).await;

    put(&queue, 1, Priority::Normal).await;
    put(&queue, 2, Priority::Critical).await;
    assert_eq!(queue.state().await, QueueState::Buffering);
    assert!(recorder.ids().is_empty());

    assert!(queue.mark_ready().await);
    assert_eq!(recorder.ids(), vec![2, 1]);
    assert_eq!(queue.state().await, QueueState::PassThrough);

    put(&queue, 3, Priority::Low).await;
    assert_eq!(recorder.ids(), vec![2, 1, 3]);

    let stats = queue.stats().await;
    assert_eq!(stats.delivered, 3);
    assert_eq!(stats.total_size, 0);
}

#[tokio::test]
async fn concurrent_producers_lose_nothing() {
    let queue = Arc::new(queue(100));

    let producers: Vec<_> = (0..5)
        .map(|producer| {
            let queue = queue.clone();
            tokio::spawn(async move {
                for i in 0..10 {
                    let n = producer * 10 + i;
                    queue
                        .enqueue(json!({ "n": n }), "test.event", Priority::Normal)
                        .await
                        .unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }

    let stats = queue.stats().await;
    assert_eq!(stats.total_size, 50);
    assert_eq!(stats.queued, 50);
    assert_eq!(stats.dropped, 0);

    let recorder = Arc::new(Recorder::default());
    queue.register_delivery_function(recorder.clone()).await;
    queue.drain().await;

    let mut ids = recorder.ids();
    ids.sort_unstable();
    assert_eq!(ids, (0..50).collect::<Vec<_>>());
}

#[tokio::test]
async fn capacity_holds_under_mixed_priorities() {
    let queue = queue(8);
    let priorities = [
        Priority::Normal,
        Priority::Low,
        Priority::Critical,
        Priority::High,
        Priority::Low,
    ];

    for n in 0..100 {
        put(&queue, n, priorities[n as usize % priorities.len()]).await;
        assert!(queue.stats().await.total_size <= 8);
    }

    let stats = queue.stats().await;
    assert_eq!(stats.total_size, 8);
    assert!(stats.overflow_events > 0);
}

#[tokio::test]
async fn full_queue_rejects_equal_priority() {
    let queue = queue(3);
    for n in 0..3 {
        put(&queue, n, Priority::High).await;
    }

    assert!(!put(&queue, 10, Priority::High).await);
    assert!(!put(&queue, 11, Priority::Normal).await);
    assert!(put(&queue, 12, Priority::Critical).await);

    let recorder = Arc::new(Recorder::default());
    queue.register_delivery_function(recorder.clone()).await;
    queue.drain().await;
    assert_eq!(recorder.ids(), vec![12, 1, 2]);
}

#[tokio::test]
async fn stale_messages_expire_before_delivery() {
    let clock = ManualClock::default();
    let config = QueueConfig {
        max_size: 10,
        max_message_age: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    let queue = MessageQueue::with_clock("conn-int", "owner-int", config, Arc::new(clock.clone()));
    let recorder = Arc::new(Recorder::default());
    queue.register_delivery_function(recorder.clone()).await;

    put(&queue, 1, Priority::Normal).await;
    clock.advance(Duration::from_millis(50));
    put(&queue, 2, Priority::Normal).await;
    clock.advance(Duration::from_millis(110));

    // First message is 160ms old, second 110ms: both stale
    queue.drain().await;
    assert!(recorder.ids().is_empty());
    assert_eq!(queue.stats().await.expired, 2);
}

#[tokio::test]
async fn closed_queue_only_reports_stats() {
    let queue = queue(10);
    let recorder = Arc::new(Recorder::default());
    queue.register_delivery_function(recorder.clone()).await;
    put(&queue, 1, Priority::Normal).await;

    assert_eq!(queue.close().await, 1);

    assert!(!put(&queue, 2, Priority::Critical).await);
    assert!(!queue.drain().await);
    assert!(!queue.mark_ready().await);
    assert!(recorder.ids().is_empty());

    let stats = queue.stats().await;
    assert_eq!(stats.state, QueueState::Closed);
    assert_eq!(stats.queued, 1);
}
