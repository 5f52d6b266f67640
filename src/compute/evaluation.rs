// Regression evaluation metrics

use crate::error::{ChurnlineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{error, info};

/// Scalar regression metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Mean squared error
    MeanSquaredError,
    /// Square root of the mean squared error
    RootMeanSquaredError,
    /// Coefficient of determination; negative when worse than the mean
    RSquared,
}

impl Metric {
    /// Name under which the metric is logged.
    pub fn name(&self) -> &'static str {
        match self {
            Metric::MeanSquaredError => "mse",
            Metric::RootMeanSquaredError => "rmse",
            Metric::RSquared => "r2_score",
        }
    }

    /// Resolves a logged metric name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "mse" => Ok(Metric::MeanSquaredError),
            "rmse" => Ok(Metric::RootMeanSquaredError),
            "r2_score" => Ok(Metric::RSquared),
            other => Err(ChurnlineError::InvalidArgument(format!("unknown metric '{}'", other))),
        }
    }

    /// Scores predictions against ground truth.
    pub fn score(&self, y_true: &[f64], y_pred: &[f64]) -> Result<f64> {
        if y_true.len() != y_pred.len() {
            error!(
                metric = self.name(),
                truth = y_true.len(),
                predictions = y_pred.len(),
                "Length mismatch while scoring"
            );
            return Err(ChurnlineError::Evaluation(format!(
                "{} ground truth values but {} predictions",
                y_true.len(),
                y_pred.len()
            )));
        }
        if y_true.is_empty() {
            return Err(ChurnlineError::Evaluation("cannot score empty inputs".to_string()));
        }

        let value = match self {
            Metric::MeanSquaredError => mean_squared_error(y_true, y_pred),
            Metric::RootMeanSquaredError => mean_squared_error(y_true, y_pred).sqrt(),
            Metric::RSquared => r2_score(y_true, y_pred),
        };
        info!(metric = self.name(), value, "Calculated score");
        Ok(value)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn mean_squared_error(y_true: &[f64], y_pred: &[f64]) -> f64 {
    let sum: f64 = y_true.iter().zip(y_pred).map(|(t, p)| (t - p).powi(2)).sum();
    sum / y_true.len() as f64
}

fn r2_score(y_true: &[f64], y_pred: &[f64]) -> f64 {
    let mean = y_true.iter().sum::<f64>() / y_true.len() as f64;
    let ss_res: f64 = y_true.iter().zip(y_pred).map(|(t, p)| (t - p).powi(2)).sum();
    let ss_tot: f64 = y_true.iter().map(|t| (t - mean).powi(2)).sum();

    if ss_tot == 0.0 {
        // Constant truth: perfect predictions score 1, anything else 0
        return if ss_res == 0.0 { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}
