//! Prometheus metrics for the projection engine.
//!
//! Every stage of a shard pass reports through the recorders below:
//! - High-water detection (current mark, skipped gaps)
//! - Aggregation (events folded, cache hits and misses, failed slices)
//! - Update batches (pages committed, commit latency, rollbacks)
//!
//! The `metrics` facade is a no-op until a recorder is installed, so
//! embedding applications that bring their own recorder can skip
//! [`MetricsExporter`] entirely.
//!
//! # Example
//!
//! ```rust,no_run
//! use foldline_projections::metrics::MetricsExporter;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut exporter = MetricsExporter::new();
//! exporter.install()?;
//!
//! // Serve this from the application's /metrics endpoint.
//! let _body = exporter.render();
//! # Ok(())
//! # }
//! ```

use foldline_core::progress::Statistics;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics setup.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder for the projection metrics.
#[derive(Default)]
pub struct MetricsExporter {
    handle: Option<PrometheusHandle>,
}

impl MetricsExporter {
    /// Create an exporter that is not installed yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError` if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// Only one recorder can be installed per process. If one already is,
    /// this logs a warning and succeeds without a handle.
    pub fn install(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Projection metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this exporter did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    // High-water metrics
    describe_gauge!(
        "projection_high_water_mark",
        "Highest sequence known to be contiguously committed"
    );
    describe_gauge!(
        "projection_highest_sequence",
        "Highest sequence assigned by the generator"
    );
    describe_counter!(
        "projection_high_water_gaps_skipped_total",
        "Detections that skipped gaps older than the safe zone"
    );

    // Aggregation metrics
    describe_counter!(
        "projection_events_applied_total",
        "Total number of events folded into aggregates"
    );
    describe_counter!(
        "projection_cache_hits_total",
        "Slices whose prior aggregate came from the cache"
    );
    describe_counter!(
        "projection_cache_misses_total",
        "Slices whose prior aggregate had to be loaded"
    );
    describe_counter!(
        "projection_slice_failures_total",
        "Slices that failed to fold"
    );

    // Batch metrics
    describe_counter!(
        "projection_batch_pages_total",
        "Total number of operation pages committed"
    );
    describe_counter!(
        "projection_batch_rollbacks_total",
        "Total number of update batches rolled back"
    );
    describe_histogram!(
        "projection_batch_duration_seconds",
        "Time taken to execute an update batch"
    );

    // Reported by storage backends
    describe_counter!(
        "postgres_transient_errors_total",
        "Database failures classified as retryable"
    );
}

/// High-water metrics recorder.
pub struct HighWaterMetrics;

impl HighWaterMetrics {
    /// Record a detection result.
    #[allow(clippy::cast_precision_loss)] // Gauges are f64; sequences fit comfortably.
    pub fn record(statistics: &Statistics) {
        gauge!("projection_high_water_mark").set(statistics.current_mark as f64);
        gauge!("projection_highest_sequence").set(statistics.highest_sequence as f64);
        if statistics.skipped_gaps() {
            counter!("projection_high_water_gaps_skipped_total").increment(1);
        }
    }
}

/// Aggregation metrics recorder.
pub struct AggregationMetrics;

impl AggregationMetrics {
    /// Record events folded for one document type.
    pub fn record_applied(document_type: &str, count: usize) {
        counter!("projection_events_applied_total", "document_type" => document_type.to_string())
            .increment(count as u64);
    }

    /// Record cache partitioning of one tenant group.
    pub fn record_cache(document_type: &str, hits: usize, misses: usize) {
        counter!("projection_cache_hits_total", "document_type" => document_type.to_string())
            .increment(hits as u64);
        counter!("projection_cache_misses_total", "document_type" => document_type.to_string())
            .increment(misses as u64);
    }

    /// Record failed slices.
    pub fn record_failures(document_type: &str, count: usize) {
        counter!("projection_slice_failures_total", "document_type" => document_type.to_string())
            .increment(count as u64);
    }
}

/// Update batch metrics recorder.
pub struct BatchMetrics;

impl BatchMetrics {
    /// Record a committed batch.
    pub fn record_commit(pages: usize, duration: Duration) {
        counter!("projection_batch_pages_total").increment(pages as u64);
        histogram!("projection_batch_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a rolled-back batch.
    pub fn record_rollback() {
        counter!("projection_batch_rollbacks_total").increment(1);
    }
}
