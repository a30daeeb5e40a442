//! Metrics collection module for the webhook delivery service
//!
//! Prometheus collectors for:
//! - Dispatch outcomes per lifecycle event and endpoint
//! - Delivery attempts by outcome and their duration
//! - Dead-lettered deliveries
//! - Worker and queue occupancy

use crate::error::{WebhookDeliveryError, WebhookDeliveryResult};
use crate::queue::QueueDepth;
use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Default namespace for all collectors
pub const DEFAULT_NAMESPACE: &str = "webhook_delivery";

/// Metrics collector for the webhook delivery service
#[derive(Clone)]
pub struct WebhookMetrics {
    registry: Arc<Registry>,

    // Counters
    dispatch_total: IntCounterVec,
    attempts_total: IntCounterVec,
    dead_letters_total: IntCounter,

    // Gauges
    in_flight: IntGauge,
    queue_depth: IntGaugeVec,

    // Histograms
    attempt_duration: HistogramVec,
}

impl WebhookMetrics {
    /// Create a collector set registered under `namespace`
    pub fn new(namespace: &str) -> WebhookDeliveryResult<Self> {
        let registry = Registry::new();

        let dispatch_total = IntCounterVec::new(
            Opts::new(
                "dispatch_total",
                "Endpoint matches per lifecycle event by dispatch outcome",
            )
            .namespace(namespace),
            &["outcome"],
        )
        .map_err(|e| metric_error("dispatch_total", e))?;

        let attempts_total = IntCounterVec::new(
            Opts::new("attempts_total", "Delivery attempts by outcome").namespace(namespace),
            &["outcome"],
        )
        .map_err(|e| metric_error("attempts_total", e))?;

        let dead_letters_total = IntCounter::with_opts(
            Opts::new(
                "dead_letters_total",
                "Deliveries that exhausted their retry budget",
            )
            .namespace(namespace),
        )
        .map_err(|e| metric_error("dead_letters_total", e))?;

        let in_flight = IntGauge::with_opts(
            Opts::new("worker_in_flight", "Deliveries currently being attempted")
                .namespace(namespace),
        )
        .map_err(|e| metric_error("worker_in_flight", e))?;

        let queue_depth = IntGaugeVec::new(
            Opts::new("queue_depth", "Jobs in the delivery queue by state").namespace(namespace),
            &["state"],
        )
        .map_err(|e| metric_error("queue_depth", e))?;

        let attempt_duration = HistogramVec::new(
            HistogramOpts::new(
                "attempt_duration_seconds",
                "Duration of outbound webhook HTTP calls",
            )
            .namespace(namespace)
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["outcome"],
        )
        .map_err(|e| metric_error("attempt_duration_seconds", e))?;

        let collectors: Vec<Box<dyn Collector>> = vec![
            Box::new(dispatch_total.clone()),
            Box::new(attempts_total.clone()),
            Box::new(dead_letters_total.clone()),
            Box::new(in_flight.clone()),
            Box::new(queue_depth.clone()),
            Box::new(attempt_duration.clone()),
        ];
        for collector in collectors {
            registry
                .register(collector)
                .map_err(|e| metric_error("registry", e))?;
        }

        info!(namespace = %namespace, "Webhook delivery metrics initialized");

        Ok(Self {
            registry: Arc::new(registry),
            dispatch_total,
            attempts_total,
            dead_letters_total,
            in_flight,
            queue_depth,
            attempt_duration,
        })
    }

    /// Record one endpoint's dispatch outcome (`created`, `duplicate`, `filtered`, `error`)
    pub fn record_dispatch(&self, outcome: &str) {
        self.dispatch_total.with_label_values(&[outcome]).inc();
    }

    /// Record an executed or aborted attempt
    pub fn record_attempt(&self, outcome: &str, duration: Option<Duration>) {
        self.attempts_total.with_label_values(&[outcome]).inc();
        if let Some(duration) = duration {
            self.attempt_duration
                .with_label_values(&[outcome])
                .observe(duration.as_secs_f64());
        }
    }

    pub fn record_dead_letter(&self) {
        self.dead_letters_total.inc();
    }

    pub fn worker_started(&self) {
        self.in_flight.inc();
    }

    pub fn worker_finished(&self) {
        self.in_flight.dec();
    }

    pub fn set_queue_depth(&self, depth: QueueDepth) {
        self.queue_depth
            .with_label_values(&["scheduled"])
            .set(depth.scheduled as i64);
        self.queue_depth
            .with_label_values(&["in_flight"])
            .set(depth.in_flight as i64);
    }

    pub fn dead_letters(&self) -> u64 {
        self.dead_letters_total.get()
    }

    pub fn attempts(&self, outcome: &str) -> u64 {
        self.attempts_total.with_label_values(&[outcome]).get()
    }

    /// Render all collectors in the Prometheus text exposition format
    pub fn render(&self) -> WebhookDeliveryResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| WebhookDeliveryError::internal(format!("metrics encoding failed: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| WebhookDeliveryError::internal(format!("metrics are not UTF-8: {}", e)))
    }
}

impl std::fmt::Debug for WebhookMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookMetrics").finish_non_exhaustive()
    }
}

fn metric_error(name: &str, error: prometheus::Error) -> WebhookDeliveryError {
    WebhookDeliveryError::internal(format!("Failed to set up metric {}: {}", name, error))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render() {
        let metrics = WebhookMetrics::new("test_webhooks").unwrap();
        metrics.record_dispatch("created");
        metrics.record_attempt("delivered", Some(Duration::from_millis(120)));
        metrics.record_dead_letter();
        metrics.set_queue_depth(QueueDepth {
            scheduled: 4,
            in_flight: 1,
        });

        let text = metrics.render().unwrap();
        assert!(text.contains("test_webhooks_dispatch_total{outcome=\"created\"} 1"));
        assert!(text.contains("test_webhooks_dead_letters_total 1"));
        assert!(text.contains("test_webhooks_queue_depth{state=\"scheduled\"} 4"));
        assert_eq!(metrics.attempts("delivered"), 1);
    }
}
