//! Queued message model and priority tiers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;

/// Priority tiers, ordered `Low < Normal < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "PascalCase")]
pub enum Priority {
    /// Low priority, first to be evicted
    Low,
    /// Normal priority (default)
    #[default]
    Normal,
    /// High priority, should be delivered promptly
    High,
    /// Critical priority, never evicted in favour of anything else
    Critical,
}

impl Priority {
    /// All tiers from highest to lowest, the order a drain visits them in.
    pub const DESCENDING: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Slot of this tier in a priority-partitioned store (0 = Critical).
    pub(crate) fn tier_index(self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry configuration carried by every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Cumulative failed attempts after which the message is dropped
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_retry_delay: Duration,
    /// Ceiling for the exponential schedule
    pub max_retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// `base * 2^retry_count`, capped at `max_retry_delay`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = match 2u32.checked_pow(retry_count) {
            Some(factor) => factor,
            None => return self.max_retry_delay,
        };

        self.base_retry_delay
            .checked_mul(factor)
            .map_or(self.max_retry_delay, |delay| delay.min(self.max_retry_delay))
    }
}

/// A message held by a [`MessageQueue`](super::MessageQueue).
///
/// The payload and type tag are immutable once constructed; the retry
/// bookkeeping (`retry_count`, `next_retry_at`) is only touched by the
/// queue's retry path.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedMessage {
    /// Unique message ID
    pub id: Uuid,
    /// Opaque payload, forwarded untouched to the delivery function
    pub payload: serde_json::Value,
    /// Type tag supplied by the producer
    pub message_type: String,
    pub priority: Priority,
    /// When the message was admitted
    pub enqueued_at: DateTime<Utc>,
    /// Failed delivery attempts so far
    pub retry_count: u32,
    /// Earliest instant the retry loop may attempt the message again
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub retry_policy: RetryPolicy,
    /// Admission order within the owning queue, used for FIFO and eviction age
    #[serde(skip)]
    pub(crate) sequence: u64,
}

impl QueuedMessage {
    /// Build a message with the default retry policy.
    ///
    /// Returns `QueueError::InvalidMessage` for a null payload or an empty
    /// type tag.
    pub fn new(
        payload: serde_json::Value,
        message_type: impl Into<String>,
        priority: Priority,
        enqueued_at: DateTime<Utc>,
    ) -> Result<Self, QueueError> {
        Self::with_policy(
            payload,
            message_type,
            priority,
            enqueued_at,
            RetryPolicy::default(),
        )
    }

    pub fn with_policy(
        payload: serde_json::Value,
        message_type: impl Into<String>,
        priority: Priority,
        enqueued_at: DateTime<Utc>,
        retry_policy: RetryPolicy,
    ) -> Result<Self, QueueError> {
        if payload.is_null() {
            return Err(QueueError::InvalidMessage("payload is null".to_string()));
        }

        let message_type = message_type.into();
        if message_type.trim().is_empty() {
            return Err(QueueError::InvalidMessage(
                "message type is empty".to_string(),
            ));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            payload,
            message_type,
            priority,
            enqueued_at,
            retry_count: 0,
            next_retry_at: None,
            retry_policy,
            sequence: 0,
        })
    }

    /// Delay the retry schedule assigns to the next failure of this message.
    pub fn next_retry_delay(&self) -> Duration {
        self.retry_policy.delay_for(self.retry_count)
    }

    /// True when the message is strictly older than `max_age` at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        let age = now.signed_duration_since(self.enqueued_at);
        match chrono::Duration::from_std(max_age) {
            Ok(max_age) => age > max_age,
            Err(_) => false,
        }
    }

    /// Record a failed attempt at `now`.
    ///
    /// Returns `false` once the failure exhausts the retry budget; the
    /// message must then be dropped. Otherwise `next_retry_at` is moved out
    /// by the backoff delay for the failure just recorded.
    pub(crate) fn record_failure(&mut self, now: DateTime<Utc>) -> bool {
        let delay = self.next_retry_delay();
        self.retry_count = self.retry_count.saturating_add(1);

        if self.retry_count >= self.retry_policy.max_retries {
            self.next_retry_at = None;
            return false;
        }

        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        self.next_retry_at = Some(now.checked_add_signed(delay).unwrap_or(now));
        true
    }

    /// Whether a retry is due at `now`.
    pub fn is_retry_due(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.is_some_and(|at| at <= now)
    }
}
