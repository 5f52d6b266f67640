//! churnline - churn model training with gated deployment to a prediction endpoint.
//!
//! A training run ingests tabular customer data, cleans and splits it, fits a
//! regression model and scores it. The continuous deployment pipeline then
//! compares the model's R² against a minimum and, when it is strictly better,
//! replaces the served model. A separate inference flow loads the deployed
//! service and scores new records.
//!
//! # Features
//!
//! - **Deterministic transforms**: idempotent cleaning and seeded train/test splits.
//! - **Deployment gate**: strict R² threshold; a rejected model never revokes the served one.
//! - **Single endpoint per key**: redeploys stop the old endpoint before starting the new one,
//!   and processes sharing a state directory coordinate through a locked service store.
//! - **Step caching**: content-addressed reuse of step outputs across runs.
//! - **HTTP serving**: `/invocations`, `/health` and Prometheus `/metrics`.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Pipelines: ingest → clean → train → evaluate → trigger     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Service registry: find | deploy | start | stop             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Endpoints: in-memory model | health | bounded workers      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Inference: payload validation → start → predict            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use churnline::compute::ServiceRegistry;
//! use churnline::config::ChurnlineConfig;
//! use churnline::data::CsvDataSource;
//! use churnline::observability::MetricsTracker;
//! use churnline::pipeline::TrainingPipeline;
//! use std::path::Path;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> churnline::Result<()> {
//!     let config = ChurnlineConfig::development();
//!     let registry = Arc::new(ServiceRegistry::open(config.serving.registry_config())?);
//!     let pipeline = TrainingPipeline::new(
//!         Arc::new(CsvDataSource::new()),
//!         Arc::new(MetricsTracker::new()),
//!         registry,
//!         &config,
//!     );
//!
//!     let report = pipeline
//!         .run(Path::new("data/churn.csv"), 0.0, 1, Duration::from_secs(60))
//!         .await?;
//!     println!("deployed: {}", report.decision);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod types;

pub mod compute;
pub mod data;
pub mod health;
pub mod pipeline;
pub mod resilience;

pub mod cli;
pub mod observability;

// Re-exports
pub use error::{ChurnlineError, Result};
pub use types::*;

use compute::{ServerState, ServiceRegistry};
use config::ChurnlineConfig;
use pipeline::InferenceFlow;
use std::sync::Arc;
use tracing::{info, warn};

/// Open the service registry described by `config`.
pub fn open_registry(config: &ChurnlineConfig) -> Result<Arc<ServiceRegistry>> {
    Ok(Arc::new(ServiceRegistry::open(config.serving.registry_config())?))
}

/// Run the prediction server for the configured deployment key until Ctrl+C.
///
/// The server holds the running slot of the service it starts and renews it
/// every third of the lease TTL. Deploys and stops made by other processes
/// against the same state directory take effect at the next request or renewal.
pub async fn serve(config: ChurnlineConfig) -> Result<()> {
    let mut registry_config = config.serving.registry_config();
    registry_config.address = Some(config.serving.bind_addr.to_string());
    let registry = Arc::new(ServiceRegistry::open(registry_config)?);
    let key = config.deployment.clone();

    // Warm the deployed service up front so the first request is not delayed
    match registry.find(&key, false).await {
        Some(record) => {
            registry.start(&record, config.serving.start_timeout).await?;
        }
        None => warn!(key = %key, "No service deployed yet; requests will fail until one is"),
    }

    let heartbeat = {
        let registry = Arc::clone(&registry);
        let period = config.serving.lease_ttl / 3;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(e) = registry.renew_leases().await {
                    warn!(error = %e, "Failed to renew running slots");
                }
            }
        })
    };

    let flow = InferenceFlow::new(Arc::clone(&registry))
        .with_timeout(config.serving.inference_timeout);
    let mut state = ServerState::new(flow, key.clone());
    if config.observability.metrics_enabled {
        state = state.with_metrics(observability::install_prometheus()?);
    }

    let addr = config.serving.bind_addr;
    let server = tokio::spawn(compute::run_prediction_server(state, addr));

    let result = tokio::select! {
        result = server => {
            result.map_err(|e| ChurnlineError::Internal(e.to_string())).and_then(|r| r)
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down prediction server");
            Ok(())
        }
    };

    heartbeat.abort();
    registry.shutdown().await?;
    result?;
    info!("churnline shutdown complete");
    Ok(())
}
