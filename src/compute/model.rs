// Regression model families and fitted model artifacts

use crate::error::{ChurnlineError, Result};
use crate::types::{FeatureVector, Table, FEATURE_COLUMNS};
use linfa::traits::Fit;
use linfa::Dataset;
use linfa_linear::LinearRegression;
use ndarray::{concatenate, Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, error};

/// Ridge penalty, relative to the mean feature variance, used when the
/// design matrix is rank deficient.
const RIDGE_EPSILON: f64 = 1e-12;

/// Supported model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    /// Ordinary least squares with intercept
    LinearRegression,
}

impl ModelKind {
    /// Resolves a configured model name. Unknown names are rejected.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "LinearRegression" => Ok(ModelKind::LinearRegression),
            other => Err(ChurnlineError::UnsupportedModel(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::LinearRegression => "LinearRegression",
        }
    }

    /// Fits this model family on `x` against `y`.
    pub fn fit(&self, x: &Table, y: &[f64]) -> Result<TrainedModel> {
        let result = match self {
            ModelKind::LinearRegression => fit_linear_regression(x, y),
        };
        if let Err(e) = &result {
            error!(model = self.name(), error = %e, "Error in training model");
        }
        result
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelKind {
    type Err = ChurnlineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s)
    }
}

/// A fitted model with the feature order it was trained on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedModel {
    /// Model family
    pub kind: ModelKind,
    /// Training feature names, in coefficient order
    pub feature_names: Vec<String>,
    /// One coefficient per feature
    pub coefficients: Vec<f64>,
    /// Intercept term
    pub intercept: f64,
}

impl TrainedModel {
    /// Predicts one value per row of `x`, matching columns by name.
    pub fn predict(&self, x: &Table) -> Result<Vec<f64>> {
        self.check_shape()?;
        let columns: Vec<&[f64]> = self
            .feature_names
            .iter()
            .map(|name| x.numeric(name))
            .collect::<Result<_>>()?;

        let matrix = Array2::from_shape_fn((x.num_rows(), columns.len()), |(row, col)| {
            columns[col][row]
        });
        Ok(self.score(&matrix))
    }

    /// Predicts one value per feature vector.
    pub fn predict_features(&self, rows: &[FeatureVector]) -> Result<Vec<f64>> {
        let positions = self.feature_positions()?;
        let matrix = Array2::from_shape_fn((rows.len(), positions.len()), |(row, col)| {
            rows[row].values()[positions[col]]
        });
        Ok(self.score(&matrix))
    }

    /// Position of each training feature within [`FEATURE_COLUMNS`].
    pub fn feature_positions(&self) -> Result<Vec<usize>> {
        self.check_shape()?;
        self.feature_names
            .iter()
            .map(|name| {
                FEATURE_COLUMNS.iter().position(|c| *c == name.as_str()).ok_or_else(|| {
                    ChurnlineError::Schema(format!(
                        "model feature '{}' is not in the feature schema",
                        name
                    ))
                })
            })
            .collect()
    }

    fn check_shape(&self) -> Result<()> {
        if self.coefficients.len() != self.feature_names.len() {
            return Err(ChurnlineError::Schema(format!(
                "model has {} coefficients for {} features",
                self.coefficients.len(),
                self.feature_names.len()
            )));
        }
        Ok(())
    }

    fn score(&self, matrix: &Array2<f64>) -> Vec<f64> {
        let coefficients = ArrayView1::from(self.coefficients.as_slice());
        (matrix.dot(&coefficients) + self.intercept).to_vec()
    }
}

fn fit_linear_regression(x: &Table, y: &[f64]) -> Result<TrainedModel> {
    let n = x.num_rows();
    if n == 0 || y.len() != n {
        return Err(ChurnlineError::ModelFit(format!(
            "need matching non-empty inputs, got {} rows and {} targets",
            n,
            y.len()
        )));
    }

    let records = x.to_array()?;
    let targets = Array1::from(y.to_vec());
    if records.iter().chain(targets.iter()).any(|v| !v.is_finite()) {
        return Err(ChurnlineError::ModelFit("input contains NaN or infinity".to_string()));
    }

    let (coefficients, intercept) = match ordinary_least_squares(&records, &targets) {
        Some(fit) => fit,
        None => {
            debug!(
                features = records.ncols(),
                "Design matrix is rank deficient; adding ridge term"
            );
            ridge_least_squares(&records, &targets)?
        }
    };

    debug!(features = records.ncols(), rows = n, intercept, "Fitted linear regression");

    Ok(TrainedModel {
        kind: ModelKind::LinearRegression,
        feature_names: x.column_names().into_iter().map(str::to_string).collect(),
        coefficients: coefficients.to_vec(),
        intercept,
    })
}

/// OLS with intercept. None when the normal equations have no stable solution.
fn ordinary_least_squares(
    records: &Array2<f64>,
    targets: &Array1<f64>,
) -> Option<(Array1<f64>, f64)> {
    let dataset = Dataset::new(records.clone(), targets.clone());
    let fitted = LinearRegression::new().fit(&dataset).ok()?;

    let params = fitted.params().to_owned();
    let intercept = fitted.intercept();
    let finite = params.iter().all(|v| v.is_finite()) && intercept.is_finite();
    finite.then_some((params, intercept))
}

/// Least squares on centered data with a small ridge penalty, appended as
/// extra rows so the solver sees `XᵀX + λI`.
fn ridge_least_squares(records: &Array2<f64>, targets: &Array1<f64>) -> Result<(Array1<f64>, f64)> {
    let p = records.ncols();
    let empty = || ChurnlineError::ModelFit("no rows to fit".to_string());
    let x_mean = records.mean_axis(Axis(0)).ok_or_else(empty)?;
    let y_mean = targets.mean().ok_or_else(empty)?;

    let centered = records - &x_mean;
    let variance = centered.iter().map(|v| v * v).sum::<f64>() / p.max(1) as f64;
    let lambda = RIDGE_EPSILON * variance.max(1.0);
    let penalty = Array2::<f64>::eye(p) * lambda.sqrt();

    let fit_error = |e: ndarray::ShapeError| ChurnlineError::ModelFit(e.to_string());
    let design = concatenate(Axis(0), &[centered.view(), penalty.view()]).map_err(fit_error)?;
    let response = targets - y_mean;
    let padding = Array1::<f64>::zeros(p);
    let response = concatenate(Axis(0), &[response.view(), padding.view()]).map_err(fit_error)?;

    let fitted = LinearRegression::new()
        .with_intercept(false)
        .fit(&Dataset::new(design, response))
        .map_err(|e| ChurnlineError::ModelFit(e.to_string()))?;

    let params = fitted.params().to_owned();
    let intercept = y_mean - x_mean.dot(&params);
    Ok((params, intercept))
}
