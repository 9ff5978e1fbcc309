//! The per-connection queue: admission, eviction, aging and drain.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::QueueError;
use crate::metrics::{DropReason, QueueMetrics};

use super::retry::RetryLoopHandle;
use super::stats::{QueueCounters, QueueStats};
use super::{
    Clock, Deliver, Priority, QueueConfig, QueueEvent, QueueState, QueuedMessage, Readiness,
    SystemClock,
};

/// Lowest tier first, the order eviction searches in.
const ASCENDING: [Priority; 4] = [
    Priority::Low,
    Priority::Normal,
    Priority::High,
    Priority::Critical,
];

/// Mutable queue contents, guarded by one lock.
///
/// Every message is in exactly one of: a pending tier, `in_flight` (owned by
/// a delivering task, only counted here), or the retry pool.
pub(crate) struct QueueInner {
    pub state: QueueState,
    pub readiness: Readiness,
    /// Pending backlog, one FIFO per priority, index 0 = Critical
    pub tiers: [VecDeque<QueuedMessage>; 4],
    pub in_flight: usize,
    pub retry_pool: Vec<QueuedMessage>,
    pub deliverer: Option<Arc<dyn Deliver>>,
    next_sequence: u64,
}

impl QueueInner {
    fn new() -> Self {
        Self {
            state: QueueState::default(),
            readiness: Readiness::Unknown,
            tiers: Default::default(),
            in_flight: 0,
            retry_pool: Vec::new(),
            deliverer: None,
            next_sequence: 0,
        }
    }

    pub fn pending(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    pub fn held(&self) -> usize {
        self.pending() + self.in_flight + self.retry_pool.len()
    }

    /// Run `event` through the state machine. Rejected events leave the
    /// state as it was.
    pub fn apply(&mut self, event: QueueEvent, connection_id: &str) -> bool {
        match self.state.on(event) {
            Ok(next) => {
                if next != self.state {
                    tracing::debug!(
                        connection_id = %connection_id,
                        from = %self.state,
                        to = %next,
                        "Queue state changed"
                    );
                }
                self.state = next;
                true
            }
            Err(e) => {
                tracing::debug!(connection_id = %connection_id, error = %e, "Ignoring queue event");
                false
            }
        }
    }

    fn push(&mut self, mut message: QueuedMessage) {
        message.sequence = self.next_sequence;
        self.next_sequence += 1;
        self.tiers[message.priority.tier_index()].push_back(message);
    }

    /// Take the highest-priority, oldest pending message.
    fn pop_next(&mut self) -> Option<QueuedMessage> {
        self.tiers.iter_mut().find_map(VecDeque::pop_front)
    }

    /// Remove the oldest message of the lowest tier strictly below
    /// `incoming`, looking at both the backlog and the retry pool.
    fn evict_below(&mut self, incoming: Priority) -> Option<QueuedMessage> {
        for priority in ASCENDING.into_iter().take_while(|p| *p < incoming) {
            let tier = &self.tiers[priority.tier_index()];
            let pending_oldest = tier.front().map(|m| m.sequence);
            let retry_oldest = self
                .retry_pool
                .iter()
                .enumerate()
                .filter(|(_, m)| m.priority == priority)
                .min_by_key(|(_, m)| m.sequence)
                .map(|(idx, m)| (idx, m.sequence));

            match (pending_oldest, retry_oldest) {
                (Some(p), Some((idx, r))) if r < p => return Some(self.retry_pool.swap_remove(idx)),
                (Some(_), _) => return self.tiers[priority.tier_index()].pop_front(),
                (None, Some((idx, _))) => return Some(self.retry_pool.swap_remove(idx)),
                (None, None) => continue,
            }
        }
        None
    }

    /// Drop every message older than `max_age`. Tiers are in admission
    /// order, so only their heads need checking.
    fn purge_expired(&mut self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let mut removed = 0;

        for tier in self.tiers.iter_mut() {
            while tier.front().is_some_and(|m| m.is_expired(now, max_age)) {
                tier.pop_front();
                removed += 1;
            }
        }

        let before = self.retry_pool.len();
        self.retry_pool.retain(|m| !m.is_expired(now, max_age));
        removed + (before - self.retry_pool.len())
    }

    fn clear(&mut self) -> usize {
        let discarded = self.pending() + self.retry_pool.len();
        for tier in self.tiers.iter_mut() {
            tier.clear();
        }
        self.retry_pool.clear();
        self.in_flight = 0;
        self.deliverer = None;
        discarded
    }
}

/// Releases the drain slot when the drain ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Outbound queue for a single connection.
///
/// Producers call [`enqueue`](Self::enqueue) concurrently; admission is
/// serialized by the inner lock, which is never held across a delivery.
/// At most one [`drain`](Self::drain) runs at a time, competing calls return
/// `false` immediately.
pub struct MessageQueue {
    connection_id: String,
    owner: String,
    config: QueueConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) inner: Mutex<QueueInner>,
    draining: AtomicBool,
    pub(crate) counters: QueueCounters,
    pub(crate) retry_task: Mutex<Option<RetryLoopHandle>>,
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("connection_id", &self.connection_id)
            .field("owner", &self.owner)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MessageQueue {
    /// Create a queue on the wall clock
    pub fn new(
        connection_id: impl Into<String>,
        owner: impl Into<String>,
        config: QueueConfig,
    ) -> Self {
        Self::with_clock(connection_id, owner, config, Arc::new(SystemClock))
    }

    /// Create a queue with an explicit time source
    pub fn with_clock(
        connection_id: impl Into<String>,
        owner: impl Into<String>,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            owner: owner.into(),
            config,
            clock,
            inner: Mutex::new(QueueInner::new()),
            draining: AtomicBool::new(false),
            counters: QueueCounters::default(),
            retry_task: Mutex::new(None),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub async fn state(&self) -> QueueState {
        self.inner.lock().await.state
    }

    pub async fn is_closed(&self) -> bool {
        self.state().await.is_closed()
    }

    /// Admit a message.
    ///
    /// At capacity the oldest message of the lowest tier strictly below
    /// `priority` is evicted; with no such victim the message is rejected
    /// and `Ok(false)` returned. A closed queue also returns `Ok(false)`.
    /// In pass-through mode the message is delivered before returning.
    ///
    /// Fails only with `QueueError::InvalidMessage`.
    pub async fn enqueue(
        &self,
        payload: serde_json::Value,
        message_type: impl Into<String>,
        priority: Priority,
    ) -> Result<bool, QueueError> {
        let now = self.clock.now();
        let message = QueuedMessage::with_policy(
            payload,
            message_type,
            priority,
            now,
            self.config.retry_policy,
        )?;

        let deliver_now = {
            let mut inner = self.inner.lock().await;
            if inner.state.is_closed() {
                tracing::debug!(
                    connection_id = %self.connection_id,
                    message_id = %message.id,
                    "Enqueue on closed queue ignored"
                );
                return Ok(false);
            }

            self.expire_locked(&mut inner, now);

            if inner.held() >= self.config.max_size {
                QueueCounters::add(&self.counters.overflow_events, 1);
                QueueCounters::add(&self.counters.dropped, 1);
                QueueMetrics::record_overflow();

                match inner.evict_below(priority) {
                    Some(victim) => {
                        QueueMetrics::record_dropped(DropReason::Overflow);
                        tracing::debug!(
                            connection_id = %self.connection_id,
                            dropped_id = %victim.id,
                            dropped_priority = %victim.priority,
                            incoming_priority = %priority,
                            "Evicted message from full queue"
                        );
                    }
                    None => {
                        QueueMetrics::record_dropped(DropReason::Rejected);
                        tracing::warn!(
                            connection_id = %self.connection_id,
                            message_id = %message.id,
                            priority = %priority,
                            max_size = self.config.max_size,
                            "Queue full, rejecting message"
                        );
                        return Ok(false);
                    }
                }
            }

            tracing::debug!(
                connection_id = %self.connection_id,
                message_id = %message.id,
                message_type = %message.message_type,
                priority = %priority,
                queue_size = inner.held() + 1,
                "Message enqueued"
            );

            inner.push(message);
            QueueCounters::add(&self.counters.queued, 1);
            QueueMetrics::record_enqueued();

            inner.readiness.is_ready()
                && matches!(inner.state, QueueState::PassThrough | QueueState::Retrying)
        };

        if deliver_now {
            self.drain().await;
        }

        Ok(true)
    }

    /// Set the delivery function used by drain and retry.
    ///
    /// A drain already running keeps the function it started with.
    pub async fn register_delivery_function(&self, deliverer: Arc<dyn Deliver>) {
        let mut inner = self.inner.lock().await;
        if inner.state.is_closed() {
            return;
        }
        inner.deliverer = Some(deliverer);
        tracing::debug!(connection_id = %self.connection_id, "Delivery function registered");
    }

    /// Deliver the pending backlog in priority order, FIFO within a tier.
    ///
    /// Returns `false` without doing anything when another drain is active,
    /// the queue is closed or no delivery function is registered. Each
    /// message gets exactly one attempt; failures move to the retry pool.
    pub async fn drain(&self) -> bool {
        let mut performed = false;

        loop {
            let Some(guard) = DrainGuard::acquire(&self.draining) else {
                if !performed {
                    QueueMetrics::record_drain_rejected();
                    tracing::debug!(connection_id = %self.connection_id, "Drain already active");
                }
                return performed;
            };

            let deliverer = {
                let mut inner = self.inner.lock().await;
                if inner.state.is_closed() {
                    return performed;
                }
                let Some(deliverer) = inner.deliverer.clone() else {
                    tracing::warn!(
                        connection_id = %self.connection_id,
                        pending = inner.pending(),
                        "Drain requested with no delivery function registered"
                    );
                    return performed;
                };
                if !inner.apply(QueueEvent::DrainStarted, &self.connection_id) {
                    return performed;
                }
                deliverer
            };

            performed = true;
            QueueMetrics::record_drain();
            self.flush_backlog(deliverer.as_ref()).await;
            drop(guard);

            // Go round again for messages admitted after the last pop, and for
            // a ready signal that arrived while this drain held the slot: a
            // ready connection must not be left buffering.
            let inner = self.inner.lock().await;
            let resume = !inner.state.is_closed()
                && inner.readiness.is_ready()
                && (inner.pending() > 0 || inner.state == QueueState::Buffering);
            drop(inner);

            if !resume {
                return performed;
            }
        }
    }

    async fn flush_backlog(&self, deliverer: &dyn Deliver) {
        let mut delivered = 0usize;
        let mut failed = 0usize;

        loop {
            let message = {
                let mut inner = self.inner.lock().await;
                if inner.state != QueueState::Flushing {
                    break;
                }
                self.expire_locked(&mut inner, self.clock.now());
                match inner.pop_next() {
                    Some(message) => {
                        inner.in_flight += 1;
                        message
                    }
                    None => break,
                }
            };

            match deliverer.deliver(&message).await {
                Ok(()) => {
                    self.complete_delivery(&message).await;
                    delivered += 1;
                }
                Err(e) => {
                    tracing::debug!(
                        connection_id = %self.connection_id,
                        message_id = %message.id,
                        error = %e,
                        "Delivery failed during drain"
                    );
                    self.schedule_retry(message).await;
                    failed += 1;
                }
            }
        }

        let mut inner = self.inner.lock().await;
        if inner.state == QueueState::Flushing {
            let event = QueueEvent::DrainFinished {
                readiness: inner.readiness,
                retries_pending: !inner.retry_pool.is_empty(),
            };
            inner.apply(event, &self.connection_id);
        }

        tracing::debug!(
            connection_id = %self.connection_id,
            delivered = delivered,
            failed = failed,
            state = %inner.state,
            "Drain pass completed"
        );
    }

    /// Account for a message the transport accepted.
    pub(crate) async fn complete_delivery(&self, message: &QueuedMessage) {
        let mut inner = self.inner.lock().await;
        inner.in_flight = inner.in_flight.saturating_sub(1);
        drop(inner);

        QueueCounters::add(&self.counters.delivered, 1);
        let waited = self.clock.now().signed_duration_since(message.enqueued_at);
        QueueMetrics::record_delivered(waited.num_milliseconds() as f64 / 1000.0);
    }

    /// Mark the connection ready and drain the backlog.
    ///
    /// Returns `false` when a drain is already running; that drain picks up
    /// the backlog before it releases the slot.
    pub async fn mark_ready(&self) -> bool {
        {
            let mut inner = self.inner.lock().await;
            if inner.state.is_closed() {
                return false;
            }
            inner.readiness = Readiness::Ready;
        }
        tracing::debug!(connection_id = %self.connection_id, "Connection ready");
        self.drain().await
    }

    /// Mark the connection not ready; subsequent enqueues buffer.
    pub async fn mark_not_ready(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state.is_closed() {
            return;
        }
        inner.readiness = Readiness::NotReady;
        inner.apply(QueueEvent::ConnectionNotReady, &self.connection_id);
    }

    /// Read-only snapshot; safe alongside any other operation.
    pub async fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().await;
        QueueStats::snapshot(
            &self.connection_id,
            &self.owner,
            inner.state,
            inner.readiness.is_ready(),
            inner.pending(),
            inner.in_flight,
            inner.retry_pool.len(),
            &self.counters,
        )
    }

    /// Close the queue: discard held messages, stop the retry loop and drop
    /// the delivery function. Returns the number of discarded messages;
    /// repeated calls return 0.
    pub async fn close(&self) -> usize {
        let discarded = {
            let mut inner = self.inner.lock().await;
            if inner.state.is_closed() {
                return 0;
            }
            inner.apply(QueueEvent::Close, &self.connection_id);
            inner.clear()
        };

        if let Some(handle) = self.retry_task.lock().await.take() {
            handle.abort();
        }

        tracing::info!(
            connection_id = %self.connection_id,
            owner = %self.owner,
            discarded = discarded,
            "Message queue closed"
        );

        discarded
    }

    pub(crate) fn expire_locked(&self, inner: &mut QueueInner, now: DateTime<Utc>) {
        let Some(max_age) = self.config.max_message_age else {
            return;
        };

        let expired = inner.purge_expired(now, max_age);
        if expired > 0 {
            QueueCounters::add(&self.counters.expired, expired as u64);
            QueueMetrics::record_expired(expired as u64);
            tracing::debug!(
                connection_id = %self.connection_id,
                expired = expired,
                max_age_ms = max_age.as_millis() as u64,
                "Discarded expired messages"
            );
        }
    }
}
