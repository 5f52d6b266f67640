//! Observability module for churnline.
//!
//! Provides logging setup, the Prometheus recorder used by the prediction
//! server, and experiment trackers that receive evaluation metrics.

pub mod tracker;

pub use self::tracker::{ExperimentTracker, MemoryTracker, MetricsTracker};

use crate::config::ObservabilityConfig;
use crate::error::{ChurnlineError, Result};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging. `RUST_LOG` overrides the configured level.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| ChurnlineError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .map_err(|e| ChurnlineError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    info!("Observability initialized");
    Ok(())
}

/// Install the global Prometheus recorder and return the handle that renders it.
pub fn install_prometheus() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| {
            ChurnlineError::Internal(format!("Failed to install metrics recorder: {}", e))
        })?;

    register_metrics();
    Ok(handle)
}

/// Register standard metrics.
fn register_metrics() {
    // Serving
    gauge!("churnline_services_running").set(0.0);
    counter!("churnline_deployments_total").absolute(0);
    counter!("churnline_predictions_total").absolute(0);

    // Inference
    counter!("churnline_inference_requests_total").absolute(0);
    counter!("churnline_inference_errors_total").absolute(0);
}

/// Record an inference request.
pub fn record_inference_request(rows: usize, status: u16) {
    counter!(
        "churnline_inference_requests_total",
        "status" => status.to_string()
    )
    .increment(1);

    if status >= 400 {
        counter!("churnline_inference_errors_total").increment(1);
    } else {
        gauge!("churnline_inference_batch_rows").set(rows as f64);
    }
}

/// Record a finished pipeline run.
pub fn record_pipeline_run(pipeline: &str, succeeded: bool) {
    counter!(
        "churnline_pipeline_runs_total",
        "pipeline" => pipeline.to_string(),
        "status" => if succeeded { "succeeded" } else { "failed" }
    )
    .increment(1);
}
