//! Retry pool scheduling and the background retry loop.

use std::cmp::Reverse;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::metrics::{DropReason, QueueMetrics};

use super::message_queue::QueueInner;
use super::stats::QueueCounters;
use super::{MessageQueue, QueueEvent, QueuedMessage, Readiness};

/// Outcome of one retry round
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryRound {
    pub delivered: usize,
    pub rescheduled: usize,
    pub dropped: usize,
}

impl RetryRound {
    pub fn attempted(&self) -> usize {
        self.delivered + self.rescheduled + self.dropped
    }
}

/// Handle to a running retry loop
pub(crate) struct RetryLoopHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RetryLoopHandle {
    /// Ask the loop to exit at its next iteration boundary and wait for it
    async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            if e.is_panic() {
                tracing::error!(error = %e, "Retry loop panicked");
            }
        }
    }

    pub(crate) fn abort(self) {
        let _ = self.stop_tx.send(true);
        self.task.abort();
    }
}

impl QueueInner {
    /// Remove every retry-pool message due at `now`, highest priority first,
    /// oldest first within a tier.
    fn take_due_retries(&mut self, now: DateTime<Utc>) -> Vec<QueuedMessage> {
        let (mut due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.retry_pool)
            .into_iter()
            .partition(|m| m.is_retry_due(now));
        self.retry_pool = waiting;

        due.sort_by_key(|m| (Reverse(m.priority), m.sequence));
        due
    }

    fn return_to_pool(&mut self, messages: impl IntoIterator<Item = QueuedMessage>) {
        for message in messages {
            self.in_flight = self.in_flight.saturating_sub(1);
            self.retry_pool.push(message);
        }
    }
}

impl MessageQueue {
    /// Move a message whose delivery just failed into the retry pool.
    ///
    /// Returns `false` when the message was dropped instead: its retry
    /// budget is spent or the queue closed while it was in flight.
    pub(crate) async fn schedule_retry(&self, mut message: QueuedMessage) -> bool {
        let mut inner = self.inner.lock().await;
        inner.in_flight = inner.in_flight.saturating_sub(1);

        if inner.state.is_closed() {
            return false;
        }

        if message.record_failure(self.clock.now()) {
            tracing::debug!(
                connection_id = %self.connection_id(),
                message_id = %message.id,
                retry_count = message.retry_count,
                next_retry_at = ?message.next_retry_at,
                "Message scheduled for retry"
            );
            inner.retry_pool.push(message);
            let readiness = inner.readiness;
            inner.apply(QueueEvent::RetryScheduled { readiness }, self.connection_id());
            QueueMetrics::record_retry_scheduled();
            return true;
        }

        QueueCounters::add(&self.counters.dropped, 1);
        QueueMetrics::record_dropped(DropReason::RetriesExhausted);
        tracing::warn!(
            connection_id = %self.connection_id(),
            message_id = %message.id,
            message_type = %message.message_type,
            retry_count = message.retry_count,
            "Dropping message after exhausting retries"
        );

        if inner.retry_pool.is_empty() {
            let readiness = inner.readiness;
            inner.apply(QueueEvent::RetriesSettled { readiness }, self.connection_id());
        }
        false
    }

    /// Attempt every retry-pool message whose backoff has elapsed.
    ///
    /// Does nothing once the connection has reported not ready, so waiting
    /// messages keep their budget. A queue that never got a lifecycle signal
    /// still retries what an explicit drain failed to deliver. One attempt
    /// per message per round.
    pub async fn process_due_retries(&self) -> RetryRound {
        let mut round = RetryRound::default();

        let (deliverer, due) = {
            let mut inner = self.inner.lock().await;
            if inner.state.is_closed() || inner.readiness == Readiness::NotReady {
                return round;
            }
            let Some(deliverer) = inner.deliverer.clone() else {
                return round;
            };

            let now = self.clock.now();
            self.expire_locked(&mut inner, now);
            let due = inner.take_due_retries(now);
            inner.in_flight += due.len();
            (deliverer, due)
        };

        let mut due = due.into_iter();
        while let Some(message) = due.next() {
            {
                let mut inner = self.inner.lock().await;
                if inner.state.is_closed() {
                    return round;
                }
                if inner.readiness == Readiness::NotReady {
                    inner.return_to_pool(std::iter::once(message).chain(due.by_ref()));
                    tracing::debug!(
                        connection_id = %self.connection_id(),
                        "Connection lost readiness, retry round paused"
                    );
                    break;
                }
            }

            match deliverer.deliver(&message).await {
                Ok(()) => {
                    tracing::debug!(
                        connection_id = %self.connection_id(),
                        message_id = %message.id,
                        retry_count = message.retry_count,
                        "Retry delivered"
                    );
                    self.complete_delivery(&message).await;
                    round.delivered += 1;
                }
                Err(e) => {
                    tracing::debug!(
                        connection_id = %self.connection_id(),
                        message_id = %message.id,
                        error = %e,
                        "Retry attempt failed"
                    );
                    if self.schedule_retry(message).await {
                        round.rescheduled += 1;
                    } else {
                        round.dropped += 1;
                    }
                }
            }
        }

        let mut inner = self.inner.lock().await;
        if inner.retry_pool.is_empty() {
            let readiness = inner.readiness;
            inner.apply(QueueEvent::RetriesSettled { readiness }, self.connection_id());
        }

        round
    }

    /// Spawn the background retry loop. Returns `false` when it is already
    /// running or the queue is closed.
    pub async fn start_retry_loop(self: &Arc<Self>) -> bool {
        if self.is_closed().await {
            return false;
        }

        let mut slot = self.retry_task.lock().await;
        if slot.as_ref().is_some_and(|h| !h.task.is_finished()) {
            return false;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_retry_loop(
            Arc::downgrade(self),
            self.connection_id().to_string(),
            self.config().retry_poll_interval,
            stop_rx,
        ));
        *slot = Some(RetryLoopHandle { stop_tx, task });
        true
    }

    /// Stop the retry loop, letting an in-flight delivery finish first.
    /// Returns `false` when no loop was running.
    pub async fn stop_retry_loop(&self) -> bool {
        let handle = self.retry_task.lock().await.take();
        match handle {
            Some(handle) => {
                handle.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn is_retry_loop_running(&self) -> bool {
        self.retry_task
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.task.is_finished())
    }
}

async fn run_retry_loop(
    queue: Weak<MessageQueue>,
    connection_id: String,
    poll_interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Skip immediate first tick
    ticker.tick().await;

    tracing::info!(
        connection_id = %connection_id,
        poll_interval_ms = poll_interval.as_millis() as u64,
        "Retry loop started"
    );

    loop {
        tokio::select! {
            biased;
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let Some(queue) = queue.upgrade() else {
                    break;
                };
                let round = queue.process_due_retries().await;
                if round.attempted() > 0 {
                    tracing::debug!(
                        connection_id = %connection_id,
                        delivered = round.delivered,
                        rescheduled = round.rescheduled,
                        dropped = round.dropped,
                        "Retry round completed"
                    );
                }
            }
        }
    }

    tracing::info!(connection_id = %connection_id, "Retry loop stopped");
}
