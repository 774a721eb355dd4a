//! Prometheus metrics for consumers and producers

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder.
///
/// Call this once at startup. Subsequent calls are no-ops. If another
/// recorder is already installed, metrics keep flowing to it and rendering
/// returns an empty string.
pub fn init_metrics() {
    let _ = PROMETHEUS_HANDLE.get_or_try_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .inspect(|_| info!("Prometheus metrics initialized"))
            .inspect_err(|e| warn!(error = %e, "Failed to install Prometheus recorder"))
    });
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    PROMETHEUS_HANDLE
        .get()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Consumer metrics, labelled by queue and handler
#[derive(Debug, Clone)]
pub struct ConsumerMetrics {
    queue: String,
    handler: String,
}

impl ConsumerMetrics {
    pub fn new(queue: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            handler: handler.into(),
        }
    }

    pub fn delivery_received(&self) {
        counter!(
            "broker_worker_deliveries_received_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone()
        )
        .increment(1);
    }

    pub fn empty_payload(&self) {
        counter!(
            "broker_worker_empty_payloads_total",
            "queue" => self.queue.clone()
        )
        .increment(1);
    }

    /// Record a handler outcome and its duration
    pub fn handled(&self, status: &'static str, duration: Duration) {
        counter!(
            "broker_worker_deliveries_handled_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone(),
            "status" => status
        )
        .increment(1);

        histogram!(
            "broker_worker_handler_duration_seconds",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone()
        )
        .record(duration.as_secs_f64());
    }

    pub fn acked(&self) {
        counter!(
            "broker_worker_acks_total",
            "queue" => self.queue.clone()
        )
        .increment(1);
    }

    pub fn rejected(&self) {
        counter!(
            "broker_worker_rejects_total",
            "queue" => self.queue.clone()
        )
        .increment(1);
    }

    pub fn handler_panicked(&self) {
        counter!(
            "broker_worker_handler_panics_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone()
        )
        .increment(1);
    }

    pub fn in_flight(&self, count: usize) {
        gauge!(
            "broker_worker_in_flight",
            "queue" => self.queue.clone()
        )
        .set(count as f64);
    }
}

/// Producer metrics, labelled by destination
#[derive(Debug, Clone, Default)]
pub struct PublisherMetrics;

impl PublisherMetrics {
    pub fn published(&self, destination: &str) {
        counter!(
            "broker_worker_published_total",
            "destination" => destination.to_string()
        )
        .increment(1);
    }

    pub fn failed(&self, destination: &str, kind: &'static str) {
        counter!(
            "broker_worker_publish_failures_total",
            "destination" => destination.to_string(),
            "kind" => kind
        )
        .increment(1);
    }

    pub fn reconnected(&self) {
        counter!("broker_worker_channel_reconnects_total").increment(1);
    }
}
