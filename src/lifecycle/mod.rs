//! Bridge between a connection's state machine and its queue.
//!
//! The transport publishes [`ConnectionPhase`] changes on a watch channel;
//! [`attach_lifecycle`] follows them and drives the queue: `Ready` drains,
//! `Negotiating` and `Degraded` buffer, `Closed` closes.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::queue::MessageQueue;

/// Connection state as seen by the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    #[default]
    Negotiating,
    Ready,
    Degraded,
    Closed,
}

impl ConnectionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionPhase::Negotiating => "negotiating",
            ConnectionPhase::Ready => "ready",
            ConnectionPhase::Degraded => "degraded",
            ConnectionPhase::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publisher side of one connection's phase stream
#[derive(Debug)]
pub struct ConnectionLifecycle {
    tx: watch::Sender<ConnectionPhase>,
}

impl ConnectionLifecycle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionPhase::Negotiating);
        Self { tx }
    }

    /// Publish a phase. `Closed` is terminal; later phases are ignored.
    pub fn set(&self, phase: ConnectionPhase) {
        self.tx.send_if_modified(|current| {
            if *current == phase || *current == ConnectionPhase::Closed {
                return false;
            }
            *current = phase;
            true
        });
    }

    pub fn phase(&self) -> ConnectionPhase {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionPhase> {
        self.tx.subscribe()
    }
}

impl Default for ConnectionLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageQueue {
    /// Apply one connection phase to the queue.
    pub async fn handle_phase(&self, phase: ConnectionPhase) {
        tracing::debug!(connection_id = %self.connection_id(), phase = %phase, "Connection phase changed");
        match phase {
            ConnectionPhase::Ready => {
                self.mark_ready().await;
            }
            ConnectionPhase::Negotiating | ConnectionPhase::Degraded => {
                self.mark_not_ready().await;
            }
            ConnectionPhase::Closed => {
                self.close().await;
            }
        }
    }
}

/// Follow `phases` until the connection closes or the publisher goes away,
/// closing the queue in both cases.
pub fn attach_lifecycle(
    queue: Arc<MessageQueue>,
    mut phases: watch::Receiver<ConnectionPhase>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let initial = *phases.borrow_and_update();
        queue.handle_phase(initial).await;

        while initial != ConnectionPhase::Closed && phases.changed().await.is_ok() {
            let phase = *phases.borrow_and_update();
            queue.handle_phase(phase).await;
            if phase == ConnectionPhase::Closed {
                return;
            }
        }

        if !queue.is_closed().await {
            tracing::debug!(
                connection_id = %queue.connection_id(),
                "Lifecycle publisher dropped, closing queue"
            );
            queue.close().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Deliver, DeliveryError, Priority, QueueConfig, QueueState, QueuedMessage};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    #[async_trait]
    impl Deliver for Collect {
        async fn deliver(&self, message: &QueuedMessage) -> Result<(), DeliveryError> {
            self.0.lock().unwrap().push(message.message_type.clone());
            Ok(())
        }
    }

    async fn wait_for_state(queue: &MessageQueue, state: QueueState) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while queue.state().await != state {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("queue should reach expected state");
    }

    #[test]
    fn test_closed_is_terminal() {
        let lifecycle = ConnectionLifecycle::new();
        lifecycle.set(ConnectionPhase::Ready);
        lifecycle.set(ConnectionPhase::Closed);
        lifecycle.set(ConnectionPhase::Ready);
        assert_eq!(lifecycle.phase(), ConnectionPhase::Closed);
    }

    #[tokio::test]
    async fn test_phases_drive_queue() {
        let queue = Arc::new(MessageQueue::new("conn-1", "user-1", QueueConfig::default()));
        let sink = Arc::new(Collect::default());
        queue.register_delivery_function(sink.clone()).await;

        let lifecycle = ConnectionLifecycle::new();
        let task = attach_lifecycle(queue.clone(), lifecycle.subscribe());

        queue.enqueue(json!({"n": 1}), "first", Priority::Normal).await.unwrap();
        lifecycle.set(ConnectionPhase::Ready);
        wait_for_state(&queue, QueueState::PassThrough).await;
        assert_eq!(*sink.0.lock().unwrap(), vec!["first".to_string()]);

        lifecycle.set(ConnectionPhase::Degraded);
        wait_for_state(&queue, QueueState::Buffering).await;
        queue.enqueue(json!({"n": 2}), "second", Priority::Normal).await.unwrap();
        assert_eq!(queue.stats().await.pending, 1);

        lifecycle.set(ConnectionPhase::Closed);
        task.await.unwrap();
        assert_eq!(queue.state().await, QueueState::Closed);
    }

    #[tokio::test]
    async fn test_dropped_publisher_closes_queue() {
        let queue = Arc::new(MessageQueue::new("conn-1", "user-1", QueueConfig::default()));
        let lifecycle = ConnectionLifecycle::new();
        let task = attach_lifecycle(queue.clone(), lifecycle.subscribe());

        drop(lifecycle);
        task.await.unwrap();
        assert!(queue.is_closed().await);
    }
}
