// Experiment trackers receiving evaluation metrics

use metrics::gauge;
use parking_lot::RwLock;
use tracing::info;

/// Receives named scalar metrics from pipeline steps.
pub trait ExperimentTracker: Send + Sync {
    fn log_metric(&self, name: &str, value: f64);
}

/// Publishes metrics as `churnline_model_metric{metric=...}` gauges and log events.
#[derive(Debug, Clone, Default)]
pub struct MetricsTracker {
    experiment: Option<String>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Labels every gauge with an experiment name
    pub fn with_experiment(mut self, experiment: impl Into<String>) -> Self {
        self.experiment = Some(experiment.into());
        self
    }
}

impl ExperimentTracker for MetricsTracker {
    fn log_metric(&self, name: &str, value: f64) {
        match &self.experiment {
            Some(experiment) => {
                gauge!(
                    "churnline_model_metric",
                    "metric" => name.to_string(),
                    "experiment" => experiment.clone()
                )
                .set(value);
            }
            None => {
                gauge!("churnline_model_metric", "metric" => name.to_string()).set(value);
            }
        }
        info!(metric = name, value, experiment = ?self.experiment, "Logged metric");
    }
}

/// Keeps every logged metric in memory, in logging order.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    entries: RwLock<Vec<(String, f64)>>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(String, f64)> {
        self.entries.read().clone()
    }

    /// Most recent value logged under `name`.
    pub fn last(&self, name: &str) -> Option<f64> {
        self.entries
            .read()
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl ExperimentTracker for MemoryTracker {
    fn log_metric(&self, name: &str, value: f64) {
        self.entries.write().push((name.to_string(), value));
    }
}
