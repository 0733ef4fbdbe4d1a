//! Prometheus metrics for job throughput, failures and reservation health.
//!
//! # Example
//!
//! ```rust,no_run
//! use deferred_core::telemetry::metrics::JobMetrics;
//! use std::time::Duration;
//!
//! JobMetrics::succeeded("SendMail", Duration::from_millis(120));
//! JobMetrics::reservation_failure();
//! ```

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default)]
    pub enabled: bool,

    /// Prometheus exporter listen address (e.g., "0.0.0.0:9090")
    #[serde(default = "default_metrics_endpoint")]
    pub endpoint: String,

    /// Histogram buckets for job durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_metrics_endpoint(),
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_endpoint() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_duration_buckets() -> Vec<f64> {
    vec![
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
    ]
}

/// Handle to the installed recorder.
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// A registry with no recorder installed.
    pub fn disabled() -> Self {
        Self {
            prometheus_handle: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Install the Prometheus recorder and serve it on `config.endpoint`.
///
/// Must be called from within a Tokio runtime.
///
/// # Errors
///
/// Returns an error if the endpoint is invalid or a recorder is already installed.
pub fn init_metrics(config: &MetricsConfig) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let address: SocketAddr = config.endpoint.parse()?;
    let mut builder = PrometheusBuilder::new().with_http_listener(address);

    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }

    builder = builder.set_buckets(&config.duration_buckets)?;

    let (recorder, exporter) = builder.build()?;
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder)
        .map_err(|_| anyhow::anyhow!("a metrics recorder is already installed"))?;
    tokio::spawn(exporter);

    register_metric_descriptions();

    tracing::info!(endpoint = %config.endpoint, "Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

/// Register all metric descriptions.
fn register_metric_descriptions() {
    describe_counter!("deferred_jobs_enqueued_total", "Jobs inserted by the enqueue client");
    describe_counter!("deferred_jobs_reserved_total", "Jobs claimed by a worker");
    describe_counter!(
        "deferred_reservation_conflicts_total",
        "Claims lost to another worker"
    );
    describe_counter!(
        "deferred_reservation_failures_total",
        "Reservation attempts that raised a backend error"
    );
    describe_counter!("deferred_jobs_succeeded_total", "Jobs that completed successfully");
    describe_counter!(
        "deferred_jobs_failed_total",
        "Failed executions by outcome (retry or permanent)"
    );
    describe_histogram!(
        "deferred_job_duration_seconds",
        "Time from the start of a job to its recorded outcome"
    );
    describe_counter!(
        "deferred_job_events_total",
        "Instrumentation notifications by event name"
    );
    describe_counter!("deferred_errors_total", "Errors raised, by code and category");
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Metrics
// ═══════════════════════════════════════════════════════════════════════════════

/// Recorders for job lifecycle metrics.
pub struct JobMetrics;

impl JobMetrics {
    pub fn enqueued(handler: &str, queue: Option<&str>) {
        counter!(
            "deferred_jobs_enqueued_total",
            "handler" => handler.to_string(),
            "queue" => queue.unwrap_or("").to_string(),
        )
        .increment(1);
    }

    pub fn reserved(queue: Option<&str>) {
        counter!(
            "deferred_jobs_reserved_total",
            "queue" => queue.unwrap_or("").to_string(),
        )
        .increment(1);
    }

    pub fn claim_conflict() {
        counter!("deferred_reservation_conflicts_total").increment(1);
    }

    pub fn reservation_failure() {
        counter!("deferred_reservation_failures_total").increment(1);
    }

    pub fn succeeded(handler: &str, duration: Duration) {
        counter!("deferred_jobs_succeeded_total", "handler" => handler.to_string()).increment(1);
        histogram!(
            "deferred_job_duration_seconds",
            "handler" => handler.to_string(),
            "outcome" => "success",
        )
        .record(duration.as_secs_f64());
    }

    /// `terminal` is true when the record failed permanently.
    pub fn failed(handler: &str, terminal: bool, duration: Duration) {
        let outcome = if terminal { "permanent" } else { "retry" };
        counter!(
            "deferred_jobs_failed_total",
            "handler" => handler.to_string(),
            "outcome" => outcome,
        )
        .increment(1);
        histogram!(
            "deferred_job_duration_seconds",
            "handler" => handler.to_string(),
            "outcome" => outcome,
        )
        .record(duration.as_secs_f64());
    }

    pub fn notification(event: &'static str) {
        counter!("deferred_job_events_total", "event" => event).increment(1);
    }
}
