//! Configuration module for churnline.

use crate::compute::{DeployOptions, ModelKind, RegistryConfig};
use crate::data::DataTransform;
use crate::error::{ChurnlineError, Result};
use crate::resilience::BackoffPolicy;
use crate::types::DeploymentKey;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for training, deployment and serving.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChurnlineConfig {
    /// Training pipeline configuration.
    pub pipeline: PipelineConfig,
    /// Identity of the deployed service.
    pub deployment: DeploymentKey,
    /// Serving configuration.
    pub serving: ServingConfig,
    /// Observability configuration.
    pub observability: ObservabilityConfig,
}

impl ChurnlineConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ChurnlineError::Config(format!("Failed to read config file: {}", e))
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| {
            ChurnlineError::Config(format!("Failed to parse config: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if let Err(e) = ModelKind::from_name(&self.pipeline.model_name) {
            return Err(ChurnlineError::InvalidConfig {
                field: "pipeline.model_name".to_string(),
                reason: e.to_string(),
            });
        }

        let fraction = self.pipeline.transform.test_fraction;
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(ChurnlineError::InvalidConfig {
                field: "pipeline.transform.test_fraction".to_string(),
                reason: format!("must be in (0, 1), got {}", fraction),
            });
        }

        if !self.pipeline.min_accuracy.is_finite() {
            return Err(ChurnlineError::InvalidConfig {
                field: "pipeline.min_accuracy".to_string(),
                reason: "must be a finite number".to_string(),
            });
        }

        if self.serving.workers == 0 {
            return Err(ChurnlineError::InvalidConfig {
                field: "serving.workers".to_string(),
                reason: "At least one worker is required".to_string(),
            });
        }

        if self.serving.start_timeout.is_zero() {
            return Err(ChurnlineError::InvalidConfig {
                field: "serving.start_timeout".to_string(),
                reason: "Start timeout must be non-zero".to_string(),
            });
        }

        if self.serving.lease_ttl.is_zero() {
            return Err(ChurnlineError::InvalidConfig {
                field: "serving.lease_ttl".to_string(),
                reason: "Lease TTL must be non-zero".to_string(),
            });
        }

        Ok(())
    }

    /// Create a local development configuration.
    pub fn development() -> Self {
        Self {
            pipeline: PipelineConfig {
                data_path: PathBuf::from("data/churn.csv"),
                ..PipelineConfig::default()
            },
            deployment: DeploymentKey::default(),
            serving: ServingConfig {
                state_dir: Some(PathBuf::from("/tmp/churnline")),
                bind_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
                ..ServingConfig::default()
            },
            observability: ObservabilityConfig {
                log_level: "debug".to_string(),
                ..ObservabilityConfig::default()
            },
        }
    }
}

/// Training pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Training data file.
    pub data_path: PathBuf,
    /// Model family to train.
    pub model_name: String,
    /// Minimum R² a model must exceed to be deployed.
    pub min_accuracy: f64,
    /// Reuse cached step outputs. Unset means the pipeline's own default.
    pub enable_cache: Option<bool>,
    /// Cleaning and split settings.
    pub transform: DataTransform,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("data/churn.csv"),
            model_name: ModelKind::LinearRegression.name().to_string(),
            min_accuracy: 0.0,
            enable_cache: None,
            transform: DataTransform::default(),
        }
    }
}

/// Serving configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServingConfig {
    /// Concurrent prediction workers per endpoint.
    pub workers: usize,
    /// How long a deployment waits for its endpoint to become healthy.
    #[serde(with = "humantime_serde")]
    pub start_timeout: Duration,
    /// How long inference waits for a stopped endpoint to start.
    #[serde(with = "humantime_serde")]
    pub inference_timeout: Duration,
    /// Model load time simulated by endpoints before reporting healthy.
    #[serde(with = "humantime_serde")]
    pub warmup: Duration,
    /// How long a serving process keeps a service's running slot without renewing it.
    #[serde(with = "humantime_serde")]
    pub lease_ttl: Duration,
    /// Directory holding services, run history and step cache. None keeps everything in memory.
    pub state_dir: Option<PathBuf>,
    /// Prediction server bind address.
    pub bind_addr: SocketAddr,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            start_timeout: Duration::from_secs(60),
            inference_timeout: Duration::from_secs(10),
            warmup: Duration::ZERO,
            lease_ttl: Duration::from_secs(30),
            state_dir: Some(PathBuf::from(".churnline")),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
        }
    }
}

impl ServingConfig {
    /// Registry settings derived from this section.
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            state_dir: self.state_dir.clone(),
            warmup: self.warmup,
            backoff: BackoffPolicy::default(),
            lease_ttl: self.lease_ttl,
            address: None,
        }
    }

    pub fn deploy_options(&self) -> DeployOptions {
        DeployOptions {
            workers: self.workers,
            timeout: self.start_timeout,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Expose Prometheus metrics from the prediction server.
    pub metrics_enabled: bool,
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Parses `"250ms"`, `"10s"`, `"2m"` or a bare millisecond count.
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}
