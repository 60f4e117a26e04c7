//! Prometheus metrics for the sync service.
//!
//! Provides metrics for:
//! - HTTP request latency and counts
//! - Sync run outcomes and duration
//! - Billing records read and Sheets write attempts

#[cfg(feature = "prometheus")]
use std::sync::OnceLock;
use std::time::Duration;

#[cfg(feature = "prometheus")]
use metrics::{counter, histogram};
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::config::MetricsConfig;

/// Global Prometheus handle for the metrics endpoint.
#[cfg(feature = "prometheus")]
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the metrics system with the given configuration.
#[cfg(feature = "prometheus")]
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        return Ok(());
    }

    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
            &seconds_from_ms(&config.latency_buckets_ms),
        )
        .map_err(|e| MetricsError::Setup(e.to_string()))?;

    let handle = builder.install_recorder().map_err(MetricsError::Install)?;

    PROMETHEUS_HANDLE
        .set(handle)
        .map_err(|_| MetricsError::Setup("Metrics already initialized".to_string()))?;

    Ok(())
}

/// Initialize the metrics system (no-op without prometheus feature).
#[cfg(not(feature = "prometheus"))]
pub fn init_metrics(_config: &MetricsConfig) -> Result<(), MetricsError> {
    Ok(())
}

/// Convert millisecond buckets to seconds.
#[cfg(feature = "prometheus")]
fn seconds_from_ms(ms_buckets: &[f64]) -> Vec<f64> {
    ms_buckets.iter().map(|ms| ms / 1000.0).collect()
}

/// Render the current metrics in Prometheus text format, if the recorder
/// has been installed.
#[cfg(feature = "prometheus")]
pub fn render() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(PrometheusHandle::render)
}

#[cfg(not(feature = "prometheus"))]
pub fn render() -> Option<String> {
    None
}

// ─────────────────────────────────────────────────────────────────────────────
// Metric Recording Functions
// ─────────────────────────────────────────────────────────────────────────────

/// Record an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    #[cfg(feature = "prometheus")]
    {
        let status_class = format!("{}xx", status / 100);

        counter!("http_requests_total", "method" => method.to_string(), "path" => path.to_string(), "status" => status.to_string(), "status_class" => status_class.clone())
            .increment(1);

        histogram!("http_request_duration_seconds", "method" => method.to_string(), "path" => path.to_string(), "status_class" => status_class)
            .record(duration_secs);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (method, path, status, duration_secs);
    }
}

/// Record the end of a sync run.
///
/// `status` is one of "succeeded", "failed" or "rejected" (another run for
/// the same target was in flight).
pub fn record_sync_run(status: &str, duration: Duration) {
    #[cfg(feature = "prometheus")]
    {
        counter!("sync_runs_total", "status" => status.to_string()).increment(1);
        if status != "rejected" {
            histogram!("sync_run_duration_seconds", "status" => status.to_string())
                .record(duration.as_secs_f64());
        }
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (status, duration);
    }
}

/// Record billing records decoded from one result page.
pub fn record_billing_records_read(count: u64) {
    #[cfg(feature = "prometheus")]
    {
        counter!("billing_records_read_total").increment(count);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = count;
    }
}

/// Record one Sheets write attempt by outcome ("success" or an error kind).
pub fn record_sheet_write_attempt(outcome: &str) {
    #[cfg(feature = "prometheus")]
    {
        counter!("sheet_write_attempts_total", "outcome" => outcome.to_string()).increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = outcome;
    }
}

/// Record a scheduled run trigger.
pub fn record_scheduled_run(spreadsheets: usize, failures: usize) {
    #[cfg(feature = "prometheus")]
    {
        counter!("scheduled_syncs_total").increment(1);
        counter!("scheduled_sync_spreadsheets_total").increment(spreadsheets as u64);
        counter!("scheduled_sync_failures_total").increment(failures as u64);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (spreadsheets, failures);
    }
}

/// Metrics initialization errors.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to set up metrics: {0}")]
    Setup(String),

    #[cfg(feature = "prometheus")]
    #[error("Failed to install metrics recorder: {0}")]
    Install(#[from] metrics_exporter_prometheus::BuildError),
}
