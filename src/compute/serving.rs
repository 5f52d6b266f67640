// Prediction endpoints holding a trained model in memory

use super::model::TrainedModel;
use crate::error::{ChurnlineError, Result};
use crate::health::ComponentHealth;
use crate::types::{DeploymentKey, FeatureVector};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, error, info};

/// Endpoint configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Concurrent prediction requests
    pub workers: usize,
    /// Time spent loading the model before the endpoint reports healthy
    #[serde(with = "crate::config::humantime_serde")]
    pub warmup: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            warmup: Duration::ZERO,
        }
    }
}

/// Endpoint lifecycle state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointState {
    /// Not serving
    Stopped,
    /// Loading the model
    Starting,
    /// Serving predictions
    Running,
    /// Loading failed
    Failed(String),
}

/// A prediction endpoint bound to one trained model.
pub struct ModelEndpoint {
    /// Identity of the deployment
    key: DeploymentKey,
    /// Served model
    model: Arc<TrainedModel>,
    /// Configuration
    config: EndpointConfig,
    /// Lifecycle state
    state: Arc<RwLock<EndpointState>>,
    /// Bumped on every start/stop so stale warm-up tasks are ignored
    generation: Arc<AtomicU64>,
    /// Bounds concurrent predictions to `workers`
    semaphore: Arc<Semaphore>,
    /// Rows scored
    predictions: AtomicU64,
}

impl ModelEndpoint {
    /// Creates a stopped endpoint
    pub fn new(key: DeploymentKey, model: TrainedModel, config: EndpointConfig) -> Result<Self> {
        if config.workers == 0 {
            return Err(ChurnlineError::InvalidArgument(
                "endpoint needs at least one worker".to_string(),
            ));
        }
        Ok(Self {
            key,
            model: Arc::new(model),
            semaphore: Arc::new(Semaphore::new(config.workers)),
            config,
            state: Arc::new(RwLock::new(EndpointState::Stopped)),
            generation: Arc::new(AtomicU64::new(0)),
            predictions: AtomicU64::new(0),
        })
    }

    pub fn key(&self) -> &DeploymentKey {
        &self.key
    }

    pub fn model(&self) -> Arc<TrainedModel> {
        self.model.clone()
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub async fn state(&self) -> EndpointState {
        self.state.read().await.clone()
    }

    pub async fn is_running(&self) -> bool {
        *self.state.read().await == EndpointState::Running
    }

    /// Rows scored since creation
    pub fn predictions_served(&self) -> u64 {
        self.predictions.load(Ordering::Relaxed)
    }

    /// Begins loading the model in the background. Returns immediately; poll
    /// [`health`](Self::health) to learn when the endpoint is serving.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if matches!(*state, EndpointState::Running | EndpointState::Starting) {
            return Ok(());
        }
        *state = EndpointState::Starting;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        drop(state);

        info!(
            key = %self.key,
            warmup_ms = self.config.warmup.as_millis() as u64,
            "Starting prediction endpoint"
        );

        let state = Arc::clone(&self.state);
        let current = Arc::clone(&self.generation);
        let model = Arc::clone(&self.model);
        let warmup = self.config.warmup;
        let key = self.key.clone();

        tokio::spawn(async move {
            if !warmup.is_zero() {
                tokio::time::sleep(warmup).await;
            }
            let loaded = model.feature_positions();

            let mut state = state.write().await;
            if current.load(Ordering::SeqCst) != generation || *state != EndpointState::Starting {
                debug!(key = %key, "Discarding stale endpoint start");
                return;
            }
            *state = match loaded {
                Ok(_) => {
                    info!(key = %key, "Prediction endpoint running");
                    EndpointState::Running
                }
                Err(e) => {
                    error!(key = %key, error = %e, "Prediction endpoint failed to load model");
                    EndpointState::Failed(e.to_string())
                }
            };
        });

        Ok(())
    }

    /// Stops serving. Idempotent.
    pub async fn stop(&self) {
        let mut state = self.state.write().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        if *state != EndpointState::Stopped {
            info!(key = %self.key, "Stopping prediction endpoint");
        }
        *state = EndpointState::Stopped;
    }

    /// Current health
    pub async fn health(&self) -> ComponentHealth {
        let name = self.key.to_string();
        let health = match self.state().await {
            EndpointState::Running => ComponentHealth::healthy(name),
            EndpointState::Starting => ComponentHealth::degraded(name, "loading model"),
            EndpointState::Stopped => ComponentHealth::unhealthy(name, "stopped"),
            EndpointState::Failed(reason) => ComponentHealth::unhealthy(name, reason),
        };
        health
            .with_detail("model", self.model.kind.name())
            .with_detail("workers", self.config.workers.to_string())
    }

    /// Scores feature vectors; one prediction per row.
    pub async fn predict(&self, rows: &[FeatureVector]) -> Result<Vec<f64>> {
        if !self.is_running().await {
            error!(key = %self.key, "Prediction requested from an endpoint that is not running");
            return Err(ChurnlineError::ServiceNotRunning(self.key.to_string()));
        }

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ChurnlineError::ServiceNotRunning(self.key.to_string()))?;

        let predictions = self.model.predict_features(rows)?;
        self.predictions.fetch_add(rows.len() as u64, Ordering::Relaxed);
        counter!("churnline_predictions_total").increment(rows.len() as u64);
        Ok(predictions)
    }
}

impl std::fmt::Debug for ModelEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelEndpoint")
            .field("key", &self.key)
            .field("model", &self.model.kind)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::model::ModelKind;
    use crate::health::HealthStatus;
    use crate::types::{FEATURE_COLUMNS, FEATURE_COUNT};

    fn model() -> TrainedModel {
        TrainedModel {
            kind: ModelKind::LinearRegression,
            feature_names: FEATURE_COLUMNS.iter().map(|s| s.to_string()).collect(),
            coefficients: vec![1.0; FEATURE_COUNT],
            intercept: 0.0,
        }
    }

    async fn wait_running(endpoint: &ModelEndpoint) {
        for _ in 0..100 {
            if endpoint.is_running().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("endpoint never started");
    }

    #[tokio::test]
    async fn test_endpoint_lifecycle() {
        let endpoint =
            ModelEndpoint::new(DeploymentKey::default(), model(), EndpointConfig::default())
                .unwrap();
        assert_eq!(endpoint.state().await, EndpointState::Stopped);
        assert_eq!(endpoint.health().await.status, HealthStatus::Unhealthy);

        endpoint.start().await.unwrap();
        wait_running(&endpoint).await;
        assert!(endpoint.health().await.is_healthy());

        let row = FeatureVector::from_slice(&[1.0; FEATURE_COUNT]).unwrap();
        let predictions = endpoint.predict(&[row, row]).await.unwrap();
        assert_eq!(predictions, vec![14.0, 14.0]);
        assert_eq!(endpoint.predictions_served(), 2);

        endpoint.stop().await;
        assert_eq!(endpoint.state().await, EndpointState::Stopped);
    }

    #[tokio::test]
    async fn test_predict_requires_running() {
        let endpoint =
            ModelEndpoint::new(DeploymentKey::default(), model(), EndpointConfig::default())
                .unwrap();
        let row = FeatureVector::from_slice(&[0.0; FEATURE_COUNT]).unwrap();
        let result = endpoint.predict(&[row]).await;
        assert!(matches!(result, Err(ChurnlineError::ServiceNotRunning(_))));
    }

    #[tokio::test]
    async fn test_stop_during_warmup_wins() {
        let config = EndpointConfig {
            workers: 1,
            warmup: Duration::from_millis(50),
        };
        let endpoint = ModelEndpoint::new(DeploymentKey::default(), model(), config).unwrap();
        endpoint.start().await.unwrap();
        assert_eq!(endpoint.health().await.status, HealthStatus::Degraded);

        endpoint.stop().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(endpoint.state().await, EndpointState::Stopped);
    }

    #[tokio::test]
    async fn test_invalid_artifact_fails_start() {
        let mut broken = model();
        broken.coefficients.pop();
        let endpoint =
            ModelEndpoint::new(DeploymentKey::default(), broken, EndpointConfig::default())
                .unwrap();
        endpoint.start().await.unwrap();

        for _ in 0..100 {
            if matches!(endpoint.state().await, EndpointState::Failed(_)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("endpoint should have failed");
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = EndpointConfig {
            workers: 0,
            warmup: Duration::ZERO,
        };
        assert!(ModelEndpoint::new(DeploymentKey::default(), model(), config).is_err());
    }
}
