//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use super::{
    QUEUES_ACTIVE, QUEUE_DELIVERED_TOTAL, QUEUE_DELIVERY_LATENCY, QUEUE_DRAINS_TOTAL,
    QUEUE_DRAIN_REJECTED_TOTAL, QUEUE_DROPPED_TOTAL, QUEUE_ENQUEUED_TOTAL, QUEUE_EXPIRED_TOTAL,
    QUEUE_OVERFLOW_EVENTS_TOTAL, QUEUE_RETRIES_TOTAL, QUEUE_SIZE_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Why a message left a queue without being delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Evicted to make room for a higher-priority message
    Overflow,
    /// Refused at admission, no evictable victim
    Rejected,
    /// Failed delivery with the retry budget spent
    RetriesExhausted,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Overflow => "overflow",
            DropReason::Rejected => "rejected",
            DropReason::RetriesExhausted => "retries_exhausted",
        }
    }
}

/// Helper struct for recording queue metrics
pub struct QueueMetrics;

impl QueueMetrics {
    pub fn record_enqueued() {
        QUEUE_ENQUEUED_TOTAL.inc();
    }

    pub fn record_overflow() {
        QUEUE_OVERFLOW_EVENTS_TOTAL.inc();
    }

    pub fn record_dropped(reason: DropReason) {
        QUEUE_DROPPED_TOTAL.with_label_values(&[reason.as_str()]).inc();
    }

    pub fn record_expired(count: u64) {
        QUEUE_EXPIRED_TOTAL.inc_by(count);
    }

    /// Record a delivery and how long the message waited for it
    pub fn record_delivered(latency_secs: f64) {
        QUEUE_DELIVERED_TOTAL.inc();
        QUEUE_DELIVERY_LATENCY.observe(latency_secs.max(0.0));
    }

    pub fn record_retry_scheduled() {
        QUEUE_RETRIES_TOTAL.inc();
    }

    pub fn record_drain() {
        QUEUE_DRAINS_TOTAL.inc();
    }

    pub fn record_drain_rejected() {
        QUEUE_DRAIN_REJECTED_TOTAL.inc();
    }
}

/// Helper struct for recording registry metrics
pub struct RegistryMetrics;

impl RegistryMetrics {
    pub fn record_queue_created() {
        QUEUES_ACTIVE.inc();
    }

    pub fn record_queue_removed() {
        QUEUES_ACTIVE.dec();
    }

    pub fn set_total_size(total: usize) {
        QUEUE_SIZE_TOTAL.set(total as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_reason_labels() {
        assert_eq!(DropReason::Overflow.as_str(), "overflow");
        assert_eq!(DropReason::Rejected.as_str(), "rejected");
        assert_eq!(DropReason::RetriesExhausted.as_str(), "retries_exhausted");
    }

    #[test]
    fn test_helpers_record_without_panicking() {
        QueueMetrics::record_enqueued();
        QueueMetrics::record_overflow();
        QueueMetrics::record_dropped(DropReason::RetriesExhausted);
        QueueMetrics::record_expired(2);
        QueueMetrics::record_delivered(-1.0);
        QueueMetrics::record_retry_scheduled();
        QueueMetrics::record_drain();
        QueueMetrics::record_drain_rejected();
        RegistryMetrics::set_total_size(3);

        let output = encode_metrics().unwrap();
        assert!(output.contains("retries_exhausted"));
    }
}
