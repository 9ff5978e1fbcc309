//! Queue counters and the read-only stats snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::QueueState;

/// Cumulative counters of one queue.
#[derive(Debug, Default)]
pub(crate) struct QueueCounters {
    pub queued: AtomicU64,
    pub delivered: AtomicU64,
    pub dropped: AtomicU64,
    pub expired: AtomicU64,
    pub overflow_events: AtomicU64,
}

impl QueueCounters {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of a queue
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub connection_id: String,
    pub owner: String,
    pub state: QueueState,
    pub connection_ready: bool,
    /// Messages held: pending + in flight + awaiting retry
    pub total_size: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub retrying: usize,
    pub queued: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub expired: u64,
    pub overflow_events: u64,
}

impl QueueStats {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn snapshot(
        connection_id: &str,
        owner: &str,
        state: QueueState,
        connection_ready: bool,
        pending: usize,
        in_flight: usize,
        retrying: usize,
        counters: &QueueCounters,
    ) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            owner: owner.to_string(),
            state,
            connection_ready,
            total_size: pending + in_flight + retrying,
            pending,
            in_flight,
            retrying,
            queued: QueueCounters::get(&counters.queued),
            delivered: QueueCounters::get(&counters.delivered),
            dropped: QueueCounters::get(&counters.dropped),
            expired: QueueCounters::get(&counters.expired),
            overflow_events: QueueCounters::get(&counters.overflow_events),
        }
    }
}
