//! Prometheus metrics for the fulfillment consumers.
//!
//! Metric families:
//! - Inventory consumer: message fates, processing latency, redeliveries
//! - Dead-letter router: isolated messages by reason
//! - Analytics consumer: folded events, snapshots
//! - Lag monitor: per-partition and total consumer lag
//! - Broker retries
//!
//! # Example
//!
//! ```rust,no_run
//! use fulfillment_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Serve metrics on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
}

/// Prometheus metrics server.
///
/// Installs the global recorder and exposes `/metrics` over HTTP for
/// Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the recorder and start the HTTP listener.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Build`] if the exporter cannot be built or the
    /// listener cannot bind.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), the new
    /// recorder is discarded with a warning and this returns `Ok`.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }

        tokio::spawn(async move {
            // ExporterError (metrics-exporter-prometheus 0.15) implements neither
            // Debug nor Display, so the error value cannot be logged.
            if exporter.await.is_err() {
                tracing::error!("Metrics exporter stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(
            addr = %self.addr,
            "Metrics server started - available at http://{}/metrics",
            self.addr
        );
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Inventory consumer
    describe_counter!(
        "inventory_messages_total",
        "Messages finished by the inventory consumer, labelled by fate"
    );
    describe_histogram!(
        "inventory_processing_duration_seconds",
        "Time from receiving an order to acknowledging it"
    );
    describe_counter!(
        "inventory_redeliveries_total",
        "Messages left unacknowledged after a transient dependency failure"
    );
    describe_counter!(
        "outcome_events_published_total",
        "InventoryReserved / InventoryFailed events published"
    );

    // Dead letters
    describe_counter!(
        "dead_letters_total",
        "Messages routed to the dead-letter topic, labelled by reason"
    );

    // Analytics
    describe_counter!(
        "analytics_events_folded_total",
        "Outcome events folded into the analytics aggregates"
    );
    describe_counter!(
        "analytics_snapshots_saved_total",
        "Analytics snapshots persisted"
    );

    // Lag
    describe_gauge!(
        "consumer_lag",
        "Published minus committed offset per group, topic and partition"
    );
    describe_gauge!("consumer_lag_total", "Total lag per consumer group");

    // Retry
    describe_counter!("broker_retries_total", "Broker operations retried");
    describe_counter!(
        "broker_retries_exhausted_total",
        "Broker operations that failed after max retries"
    );
}

/// Inventory consumer metrics recorder.
pub struct InventoryMetrics;

impl InventoryMetrics {
    /// Record a message reaching its terminal fate.
    pub fn record_fate(fate: &'static str, duration: Duration) {
        counter!("inventory_messages_total", "fate" => fate).increment(1);
        histogram!("inventory_processing_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a message left for redelivery.
    pub fn record_redelivery() {
        counter!("inventory_redeliveries_total").increment(1);
    }

    /// Record an outcome event publish.
    pub fn record_outcome_published(event_type: &'static str) {
        counter!("outcome_events_published_total", "event_type" => event_type).increment(1);
    }
}

/// Dead-letter metrics recorder.
pub struct DeadLetterMetrics;

impl DeadLetterMetrics {
    /// Record a dead-lettered message.
    pub fn record(reason: &'static str) {
        counter!("dead_letters_total", "reason" => reason).increment(1);
    }
}

/// Analytics consumer metrics recorder.
pub struct AnalyticsMetrics;

impl AnalyticsMetrics {
    /// Record folded events.
    pub fn record_folded(count: u64) {
        counter!("analytics_events_folded_total").increment(count);
    }

    /// Record a snapshot save.
    pub fn record_snapshot() {
        counter!("analytics_snapshots_saved_total").increment(1);
    }
}

/// Lag metrics recorder.
pub struct LagMetrics;

impl LagMetrics {
    /// Record the lag of one partition.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_partition(group: &str, topic: &str, partition: i32, lag: u64) {
        gauge!(
            "consumer_lag",
            "group" => group.to_string(),
            "topic" => topic.to_string(),
            "partition" => partition.to_string()
        )
        .set(lag as f64);
    }

    /// Record the total lag of a group.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_total(group: &str, lag: u64) {
        gauge!("consumer_lag_total", "group" => group.to_string()).set(lag as f64);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_retry() {
        counter!("broker_retries_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("broker_retries_exhausted_total").increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
    }

    #[tokio::test]
    async fn test_metrics_server_render() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        InventoryMetrics::record_fate("reserved", Duration::from_millis(3));
        DeadLetterMetrics::record("missing_field");
        LagMetrics::record_partition("inventory-service", "order.placed", 0, 12);

        // If another test installed the recorder first, handle is None.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("inventory_messages_total"));
            assert!(rendered.contains("dead_letters_total"));
            assert!(rendered.contains("consumer_lag"));
        }
    }
}
