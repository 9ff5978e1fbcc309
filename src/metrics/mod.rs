//! Prometheus metrics for the outbound queue service.
//!
//! Process-wide mirrors of the per-queue counters plus registry gauges:
//! - Queue admission metrics (enqueued, overflow, dropped by reason)
//! - Delivery metrics (delivered, latency, retries, drains)
//! - Registry metrics (active queues, total held messages)

mod helpers;

pub use helpers::{encode_metrics, DropReason, QueueMetrics, RegistryMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "ara";

lazy_static! {
    // ============================================================================
    // Admission Metrics
    // ============================================================================

    /// Messages admitted into a queue
    pub static ref QUEUE_ENQUEUED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_queue_enqueued_total", METRIC_PREFIX),
        "Total messages admitted into connection queues"
    ).unwrap();

    /// Admissions that found the queue at capacity
    pub static ref QUEUE_OVERFLOW_EVENTS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_queue_overflow_events_total", METRIC_PREFIX),
        "Total enqueues that hit queue capacity"
    ).unwrap();

    /// Messages dropped, by reason
    pub static ref QUEUE_DROPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_queue_dropped_total", METRIC_PREFIX),
        "Total messages dropped",
        &["reason"]
    ).unwrap();

    /// Messages discarded because they outlived the maximum age
    pub static ref QUEUE_EXPIRED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_queue_expired_total", METRIC_PREFIX),
        "Total messages discarded due to age"
    ).unwrap();

    // ============================================================================
    // Delivery Metrics
    // ============================================================================

    /// Successful deliveries
    pub static ref QUEUE_DELIVERED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_queue_delivered_total", METRIC_PREFIX),
        "Total messages delivered to connections"
    ).unwrap();

    /// Failed deliveries parked for retry
    pub static ref QUEUE_RETRIES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_queue_retries_total", METRIC_PREFIX),
        "Total failed deliveries scheduled for retry"
    ).unwrap();

    /// Drain passes performed
    pub static ref QUEUE_DRAINS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_queue_drains_total", METRIC_PREFIX),
        "Total drain passes performed"
    ).unwrap();

    /// Drain calls refused because another drain was active
    pub static ref QUEUE_DRAIN_REJECTED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_queue_drain_rejected_total", METRIC_PREFIX),
        "Total drain calls rejected while another drain was active"
    ).unwrap();

    /// Time from admission to successful delivery
    pub static ref QUEUE_DELIVERY_LATENCY: Histogram = register_histogram!(
        format!("{}_queue_delivery_latency_seconds", METRIC_PREFIX),
        "Time from enqueue to successful delivery in seconds",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]
    ).unwrap();

    // ============================================================================
    // Registry Metrics
    // ============================================================================

    /// Live queues in the registry
    pub static ref QUEUES_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_queues_active", METRIC_PREFIX),
        "Number of live connection queues"
    ).unwrap();

    /// Messages held across all queues
    pub static ref QUEUE_SIZE_TOTAL: IntGauge = register_int_gauge!(
        format!("{}_queue_size_total", METRIC_PREFIX),
        "Total messages currently held across all queues"
    ).unwrap();
}
