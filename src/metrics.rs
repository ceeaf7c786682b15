//! Prometheus metrics (§6 metrics surface, §9 "pass a `MetricsSink`
//! capability"). The HTTP `/metrics` scrape endpoint itself is out of scope
//! (that's transport); this module only owns registration and recording.

#![allow(dead_code)]

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, GaugeVec,
    HistogramVec,
};

lazy_static! {
    pub static ref PAYMENT_PROCESSING_OPERATIONS: CounterVec = register_counter_vec!(
        "payment_processing_operations_total",
        "Total lifecycle commands processed",
        &["team", "result", "priority"]
    )
    .unwrap();

    pub static ref PAYMENT_CANCELLATION_OPERATIONS: CounterVec = register_counter_vec!(
        "payment_cancellation_operations_total",
        "Total cancel/reversal/refund operations",
        &["team", "result", "priority"]
    )
    .unwrap();

    pub static ref NOTIFICATION_DELIVERY_OPERATIONS: CounterVec = register_counter_vec!(
        "notification_delivery_operations_total",
        "Total webhook delivery attempts",
        &["team", "result", "priority"]
    )
    .unwrap();

    pub static ref RATE_LIMIT_HITS: CounterVec = register_counter_vec!(
        "rate_limit_hits_total",
        "Total rate-limit deny decisions",
        &["policy", "identifier_type"]
    )
    .unwrap();

    pub static ref PAYMENT_STATE_TRANSITIONS: CounterVec = register_counter_vec!(
        "payment_state_transitions_total",
        "Total successful state-machine transitions",
        &["from", "to"]
    )
    .unwrap();

    pub static ref PAYMENT_PROCESSING_DURATION: HistogramVec = register_histogram_vec!(
        "payment_processing_duration_seconds",
        "Lifecycle command wall-clock duration",
        &["priority"],
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .unwrap();

    pub static ref NOTIFICATION_DELIVERY_DURATION: HistogramVec = register_histogram_vec!(
        "notification_delivery_duration_seconds",
        "Webhook delivery attempt duration",
        &["type", "method"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .unwrap();

    pub static ref PAYMENT_STATE_TRANSITION_DURATION: HistogramVec = register_histogram_vec!(
        "payment_state_transition_duration_seconds",
        "Time spent inside the state machine per transition",
        &["from"],
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05]
    )
    .unwrap();

    pub static ref ACTIVE_PAYMENT_PROCESSING: GaugeVec = register_gauge_vec!(
        "active_payment_processing",
        "In-flight lifecycle commands",
        &["team"]
    )
    .unwrap();

    pub static ref PAYMENT_PROCESSING_QUEUE_LENGTH: GaugeVec = register_gauge_vec!(
        "payment_processing_queue_length",
        "Items waiting in the dispatcher queue",
        &["priority"]
    )
    .unwrap();

    pub static ref PENDING_NOTIFICATIONS: GaugeVec = register_gauge_vec!(
        "pending_notifications_total",
        "Webhook notifications not yet delivered",
        &["team", "type", "priority"]
    )
    .unwrap();
}

/// Capability boundary (§9): callers depend on this trait, not on the
/// `lazy_static` registry directly, so tests can swap in a no-op sink.
pub trait MetricsSink: Send + Sync {
    fn record_processing(&self, team: &str, result: &str, priority: u8, duration_secs: f64);
    fn record_cancellation(&self, team: &str, result: &str, priority: u8);
    fn record_notification_delivery(&self, team: &str, result: &str, priority: u8, kind: &str, method: &str, duration_secs: f64);
    fn record_rate_limit_hit(&self, policy: &str, identifier_type: &str);
    fn record_state_transition(&self, from: &str, to: &str, duration_secs: f64);
    fn set_active_processing(&self, team: &str, value: f64);
    fn set_queue_length(&self, priority: u8, value: f64);
    fn set_pending_notifications(&self, team: &str, kind: &str, priority: u8, value: f64);
}

/// Default sink backed by the process-wide Prometheus registry above. One
/// instance is constructed at startup and shared; no module-level mutable
/// state outside the registry itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusMetricsSink;

impl MetricsSink for PrometheusMetricsSink {
    fn record_processing(&self, team: &str, result: &str, priority: u8, duration_secs: f64) {
        let priority = priority.to_string();
        PAYMENT_PROCESSING_OPERATIONS
            .with_label_values(&[team, result, &priority])
            .inc();
        PAYMENT_PROCESSING_DURATION
            .with_label_values(&[&priority])
            .observe(duration_secs);
    }

    fn record_cancellation(&self, team: &str, result: &str, priority: u8) {
        PAYMENT_CANCELLATION_OPERATIONS
            .with_label_values(&[team, result, &priority.to_string()])
            .inc();
    }

    fn record_notification_delivery(
        &self,
        team: &str,
        result: &str,
        priority: u8,
        kind: &str,
        method: &str,
        duration_secs: f64,
    ) {
        NOTIFICATION_DELIVERY_OPERATIONS
            .with_label_values(&[team, result, &priority.to_string()])
            .inc();
        NOTIFICATION_DELIVERY_DURATION
            .with_label_values(&[kind, method])
            .observe(duration_secs);
    }

    fn record_rate_limit_hit(&self, policy: &str, identifier_type: &str) {
        RATE_LIMIT_HITS.with_label_values(&[policy, identifier_type]).inc();
    }

    fn record_state_transition(&self, from: &str, to: &str, duration_secs: f64) {
        PAYMENT_STATE_TRANSITIONS.with_label_values(&[from, to]).inc();
        PAYMENT_STATE_TRANSITION_DURATION
            .with_label_values(&[from])
            .observe(duration_secs);
    }

    fn set_active_processing(&self, team: &str, value: f64) {
        ACTIVE_PAYMENT_PROCESSING.with_label_values(&[team]).set(value);
    }

    fn set_queue_length(&self, priority: u8, value: f64) {
        PAYMENT_PROCESSING_QUEUE_LENGTH
            .with_label_values(&[&priority.to_string()])
            .set(value);
    }

    fn set_pending_notifications(&self, team: &str, kind: &str, priority: u8, value: f64) {
        PENDING_NOTIFICATIONS
            .with_label_values(&[team, kind, &priority.to_string()])
            .set(value);
    }
}

/// No-op sink for tests that don't care about metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn record_processing(&self, _: &str, _: &str, _: u8, _: f64) {}
    fn record_cancellation(&self, _: &str, _: &str, _: u8) {}
    fn record_notification_delivery(&self, _: &str, _: &str, _: u8, _: &str, _: &str, _: f64) {}
    fn record_rate_limit_hit(&self, _: &str, _: &str) {}
    fn record_state_transition(&self, _: &str, _: &str, _: f64) {}
    fn set_active_processing(&self, _: &str, _: f64) {}
    fn set_queue_length(&self, _: u8, _: f64) {}
    fn set_pending_notifications(&self, _: &str, _: &str, _: u8, _: f64) {}
}
