//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for the reservation layer:
//! - Hold admission outcomes and the active hold gauge
//! - Releases by reason (explicit, timer, sweep, shutdown, ...)
//! - Best-effort gateway notification failures
//! - Optimistic mutation outcomes and confirmation latency
//!
//! Recording goes through the `metrics` facade, so nothing is exported until a
//! recorder is installed.
//!
//! # Example
//!
//! ```rust,no_run
//! use tickethold_runtime::metrics::MetricsExporter;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut exporter = MetricsExporter::new();
//! exporter.start()?;
//!
//! // ... place holds ...
//!
//! if let Some(text) = exporter.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Holds requested, labelled by `outcome` (`placed`, `replaced`, `out_of_stock`, `rejected`)
pub const HOLDS_TOTAL: &str = "tickethold_holds_total";
/// Holds released, labelled by `reason`
pub const RELEASES_TOTAL: &str = "tickethold_releases_total";
/// Currently active holds
pub const ACTIVE_HOLDS: &str = "tickethold_active_holds";
/// Failed best-effort notifications, labelled by `op`
pub const NOTIFY_FAILURES_TOTAL: &str = "tickethold_gateway_notify_failures_total";
/// Optimistic mutations, labelled by `outcome` (`committed`, `rolled_back`, `abandoned`, `conflict`)
pub const MUTATIONS_TOTAL: &str = "tickethold_mutations_total";
/// Time from optimistic apply to settlement
pub const MUTATION_DURATION_SECONDS: &str = "tickethold_mutation_duration_seconds";

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus exporter.
///
/// Installs the global recorder and renders the text exposition format.
/// Serving it over HTTP is left to the host application.
#[derive(Default)]
pub struct MetricsExporter {
    handle: Option<PrometheusHandle>,
}

impl MetricsExporter {
    /// Create an exporter that has not been started.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Describe all metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., in tests), this logs a warning
    /// and succeeds without a handle, so [`render`](Self::render) returns `None`.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Prometheus recorder installed");
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the exporter hasn't installed a recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(HOLDS_TOTAL, "Hold requests by outcome");
    describe_counter!(RELEASES_TOTAL, "Holds released by reason");
    describe_gauge!(ACTIVE_HOLDS, "Holds currently counted against availability");
    describe_counter!(
        NOTIFY_FAILURES_TOTAL,
        "Best-effort hold/release notifications that failed"
    );
    describe_counter!(MUTATIONS_TOTAL, "Optimistic mutations by outcome");
    describe_histogram!(
        MUTATION_DURATION_SECONDS,
        "Time from optimistic apply to commit or rollback"
    );
}

/// Record the outcome of a hold request.
pub fn record_hold_outcome(outcome: &'static str) {
    counter!(HOLDS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record the number of active holds.
#[allow(clippy::cast_precision_loss)] // hold counts are far below 2^52
pub fn set_active_holds(count: usize) {
    gauge!(ACTIVE_HOLDS).set(count as f64);
}

/// Record released holds.
pub fn record_release(reason: &'static str, count: usize) {
    if count > 0 {
        counter!(RELEASES_TOTAL, "reason" => reason).increment(count as u64);
    }
}

/// Record a failed best-effort notification.
pub fn record_notify_failure(op: &'static str) {
    counter!(NOTIFY_FAILURES_TOTAL, "op" => op).increment(1);
}

/// Record a settled (or refused) optimistic mutation.
pub fn record_mutation(outcome: &'static str, elapsed: Option<Duration>) {
    counter!(MUTATIONS_TOTAL, "outcome" => outcome).increment(1);
    if let Some(elapsed) = elapsed {
        histogram!(MUTATION_DURATION_SECONDS, "outcome" => outcome).record(elapsed.as_secs_f64());
    }
}
