//! Aggregate statistics across all registered queues

use serde::Serialize;
use std::collections::HashMap;

use crate::queue::QueueStats;

/// Registry-wide totals
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RegistryStats {
    pub queues: usize,
    pub total_size: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub retrying: usize,
    pub queued: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub expired: u64,
    pub overflow_events: u64,
    pub ready_connections: usize,
    /// Queue count per state name
    pub by_state: HashMap<String, usize>,
}

impl RegistryStats {
    pub(crate) fn add(&mut self, stats: &QueueStats) {
        self.queues += 1;
        self.total_size += stats.total_size;
        self.pending += stats.pending;
        self.in_flight += stats.in_flight;
        self.retrying += stats.retrying;
        self.queued += stats.queued;
        self.delivered += stats.delivered;
        self.dropped += stats.dropped;
        self.expired += stats.expired;
        self.overflow_events += stats.overflow_events;
        if stats.connection_ready {
            self.ready_connections += 1;
        }
        *self
            .by_state
            .entry(stats.state.as_str().to_string())
            .or_default() += 1;
    }
}
