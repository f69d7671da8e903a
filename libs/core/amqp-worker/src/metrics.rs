//! Prometheus metrics for publishers and subscribers
//!
//! Recording is a no-op until `init_metrics` installs the recorder.

use crate::tracker::ConfirmOutcome;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() -> Result<(), BuildError> {
    PROMETHEUS_HANDLE
        .get_or_try_init(|| {
            let handle = PrometheusBuilder::new().install_recorder()?;
            info!("Prometheus metrics initialized");
            Ok(handle)
        })
        .map(|_| ())
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Assured publisher metrics helper
#[derive(Clone)]
pub struct PublisherMetrics {
    /// Publisher name for labeling
    publisher: String,
}

impl PublisherMetrics {
    pub fn new(publisher: impl Into<String>) -> Self {
        Self {
            publisher: publisher.into(),
        }
    }

    /// Record a message accepted by a channel
    pub fn published(&self, exchange: &str) {
        counter!(
            "amqp_publisher_published_total",
            "publisher" => self.publisher.clone(),
            "exchange" => exchange.to_string()
        )
        .increment(1);
    }

    /// Record a synchronous publish rejection
    pub fn rejected(&self, exchange: &str) {
        counter!(
            "amqp_publisher_rejected_total",
            "publisher" => self.publisher.clone(),
            "exchange" => exchange.to_string()
        )
        .increment(1);
    }

    /// Record a final confirmation outcome
    pub fn confirmed(&self, outcome: ConfirmOutcome) {
        counter!(
            "amqp_publisher_confirmations_total",
            "publisher" => self.publisher.clone(),
            "outcome" => outcome.to_string()
        )
        .increment(1);
    }

    /// Record a republish after a nack or channel loss
    pub fn republished(&self, reason: &'static str) {
        counter!(
            "amqp_publisher_republished_total",
            "publisher" => self.publisher.clone(),
            "reason" => reason
        )
        .increment(1);
    }

    /// Update pending confirmation gauge
    pub fn pending(&self, count: usize) {
        gauge!(
            "amqp_publisher_pending_confirmations",
            "publisher" => self.publisher.clone()
        )
        .set(count as f64);
    }

    pub fn channel_opened(&self) {
        counter!(
            "amqp_publisher_channels_opened_total",
            "publisher" => self.publisher.clone()
        )
        .increment(1);
    }
}

/// Subscriber loop metrics helper
#[derive(Clone)]
pub struct SubscriberMetrics {
    /// Queue name for labeling
    queue: String,
    /// Handler name for labeling
    handler: String,
}

impl SubscriberMetrics {
    pub fn new(queue: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            handler: handler.into(),
        }
    }

    /// Record a delivery being received
    pub fn received(&self) {
        counter!(
            "amqp_subscriber_deliveries_received_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone()
        )
        .increment(1);
    }

    /// Record a handled delivery and how long the handler took
    pub fn handled(&self, accepted: bool, duration: Duration) {
        counter!(
            "amqp_subscriber_deliveries_handled_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone(),
            "status" => if accepted { "accepted" } else { "rejected" }
        )
        .increment(1);

        histogram!(
            "amqp_subscriber_handler_duration_seconds",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a handler panic
    pub fn handler_panicked(&self) {
        counter!(
            "amqp_subscriber_handler_panics_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone()
        )
        .increment(1);
    }

    /// Record a consumer channel being reopened
    pub fn reconnected(&self) {
        counter!(
            "amqp_subscriber_reconnects_total",
            "queue" => self.queue.clone()
        )
        .increment(1);
    }

    /// Adjust the in-flight handler gauge
    pub fn in_flight(&self, delta: f64) {
        gauge!(
            "amqp_subscriber_in_flight",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone()
        )
        .increment(delta);
    }
}
