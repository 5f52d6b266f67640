//! Core type definitions for churnline.
//!
//! This module contains the data types that flow between pipeline steps,
//! the serving registry and the inference flow.
//!
//! # Key Types
//!
//! - [`Table`]: ordered named columns with aligned rows
//! - [`FeatureVector`]: one customer record in the fixed [`FEATURE_COLUMNS`] order
//! - [`Split`]: train/test partitions produced by the split transform
//! - [`ScorePair`]: R² and RMSE of an evaluated model
//! - [`DeploymentKey`]: identity of a deployed prediction service
//!
//! # Examples
//!
//! ```rust
//! use churnline::types::{Column, Table};
//!
//! let table = Table::new(vec![
//!     Column::numeric("account_length", vec![128.0, 107.0]),
//!     Column::text("state", vec!["KS".into(), "OH".into()]),
//! ]).unwrap();
//!
//! assert_eq!(table.num_rows(), 2);
//! assert!(table.column("state").unwrap().is_text());
//! ```

use crate::error::{ChurnlineError, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Model input features, in the order the served model consumes them.
pub const FEATURE_COLUMNS: [&str; 14] = [
    "account_length",
    "international_plan",
    "voice_mail_plan",
    "number_vmail_messages",
    "total_day_calls",
    "total_eve_calls",
    "total_night_calls",
    "total_intl_calls",
    "number_customer_service_calls",
    "area_code_encoded",
    "total_day_minutes",
    "total_eve_minutes",
    "total_night_minutes",
    "total_intl_minutes",
];

/// Number of fields in a [`FeatureVector`].
pub const FEATURE_COUNT: usize = FEATURE_COLUMNS.len();

/// Charge columns are linear in the matching minutes columns and are dropped during cleaning.
pub const CHARGE_COLUMNS: [&str; 4] = [
    "total_day_charge",
    "total_eve_charge",
    "total_night_charge",
    "total_intl_charge",
];

/// Binary churn label.
pub const TARGET_COLUMN: &str = "churn";

/// Values of a single column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "lowercase")]
pub enum ColumnData {
    /// Numeric values; missing cells are NaN.
    Numeric(Vec<f64>),
    /// Free text values.
    Text(Vec<String>),
}

impl ColumnData {
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Numeric(v) => v.len(),
            ColumnData::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&self, indices: &[usize]) -> ColumnData {
        match self {
            ColumnData::Numeric(v) => ColumnData::Numeric(indices.iter().map(|&i| v[i]).collect()),
            ColumnData::Text(v) => {
                ColumnData::Text(indices.iter().map(|&i| v[i].clone()).collect())
            }
        }
    }
}

/// A named column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Column values
    pub data: ColumnData,
}

impl Column {
    /// Creates a numeric column
    pub fn numeric(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            data: ColumnData::Numeric(values),
        }
    }

    /// Creates a text column
    pub fn text(name: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            name: name.into(),
            data: ColumnData::Text(values),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self.data, ColumnData::Numeric(_))
    }

    pub fn is_text(&self) -> bool {
        matches!(self.data, ColumnData::Text(_))
    }

    /// Numeric values, if this is a numeric column
    pub fn as_numeric(&self) -> Option<&[f64]> {
        match &self.data {
            ColumnData::Numeric(v) => Some(v),
            ColumnData::Text(_) => None,
        }
    }
}

/// Ordered collection of named columns with rows aligned by position.
///
/// Serialized as its list of columns; deserializing applies the same checks
/// as [`Table::new`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Column>", into = "Vec<Column>")]
pub struct Table {
    columns: Vec<Column>,
    num_rows: usize,
}

impl Table {
    /// Builds a table, rejecting ragged columns and duplicate names.
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        let num_rows = columns.first().map(|c| c.data.len()).unwrap_or(0);

        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(ChurnlineError::Schema(format!(
                    "duplicate column '{}'",
                    column.name
                )));
            }
            if column.data.len() != num_rows {
                return Err(ChurnlineError::Schema(format!(
                    "column '{}' has {} rows, expected {}",
                    column.name,
                    column.data.len(),
                    num_rows
                )));
            }
        }

        Ok(Self { columns, num_rows })
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Numeric column by name, failing if absent or not numeric.
    pub fn numeric(&self, name: &str) -> Result<&[f64]> {
        let column = self
            .column(name)
            .ok_or_else(|| ChurnlineError::Schema(format!("missing column '{}'", name)))?;
        column
            .as_numeric()
            .ok_or_else(|| ChurnlineError::Schema(format!("column '{}' is not numeric", name)))
    }

    /// Keeps the columns for which `keep` returns true, preserving order.
    pub fn retain_columns<F>(&self, mut keep: F) -> Table
    where
        F: FnMut(&Column) -> bool,
    {
        let columns: Vec<Column> = self.columns.iter().filter(|c| keep(c)).cloned().collect();
        let num_rows = if columns.is_empty() { 0 } else { self.num_rows };
        Table { columns, num_rows }
    }

    /// Removes a column, returning the remaining table and the removed column.
    pub fn without_column(&self, name: &str) -> Result<(Table, Column)> {
        let removed = self
            .column(name)
            .cloned()
            .ok_or_else(|| ChurnlineError::Schema(format!("missing column '{}'", name)))?;
        let rest = self.retain_columns(|c| c.name != name);
        Ok((rest, removed))
    }

    /// Selects rows by position. Indices must be in bounds.
    pub fn take_rows(&self, indices: &[usize]) -> Table {
        Table {
            columns: self
                .columns
                .iter()
                .map(|c| Column {
                    name: c.name.clone(),
                    data: c.data.take(indices),
                })
                .collect(),
            num_rows: indices.len(),
        }
    }

    /// Numeric matrix with one row per table row and one column per table
    /// column; every column must be numeric.
    pub fn to_array(&self) -> Result<Array2<f64>> {
        let numeric: Vec<&[f64]> = self
            .columns
            .iter()
            .map(|c| {
                c.as_numeric().ok_or_else(|| {
                    ChurnlineError::Schema(format!("column '{}' is not numeric", c.name))
                })
            })
            .collect::<Result<_>>()?;

        Ok(Array2::from_shape_fn((self.num_rows, numeric.len()), |(row, col)| {
            numeric[col][row]
        }))
    }
}

impl TryFrom<Vec<Column>> for Table {
    type Error = ChurnlineError;

    fn try_from(columns: Vec<Column>) -> Result<Self> {
        Table::new(columns)
    }
}

impl From<Table> for Vec<Column> {
    fn from(table: Table) -> Self {
        table.columns
    }
}

/// One customer record in [`FEATURE_COLUMNS`] order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector([f64; FEATURE_COUNT]);

impl FeatureVector {
    /// Builds a vector from exactly [`FEATURE_COUNT`] values.
    pub fn from_slice(values: &[f64]) -> Result<Self> {
        let array: [f64; FEATURE_COUNT] = values.try_into().map_err(|_| {
            ChurnlineError::Schema(format!(
                "feature vector needs {} values, got {}",
                FEATURE_COUNT,
                values.len()
            ))
        })?;
        Ok(Self(array))
    }

    pub fn values(&self) -> &[f64; FEATURE_COUNT] {
        &self.0
    }

    /// Value of a named feature.
    pub fn get(&self, name: &str) -> Option<f64> {
        FEATURE_COLUMNS
            .iter()
            .position(|c| *c == name)
            .map(|i| self.0[i])
    }
}

/// Train/test partitions of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Split {
    pub x_train: Table,
    pub x_test: Table,
    pub y_train: Vec<f64>,
    pub y_test: Vec<f64>,
}

/// Scores of an evaluated model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScorePair {
    /// Coefficient of determination
    pub r2: f64,
    /// Root mean squared error
    pub rmse: f64,
}

/// Identity of a deployed prediction service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentKey {
    /// Pipeline that deployed the service
    pub pipeline_name: String,
    /// Step within the pipeline that deployed it
    pub step_name: String,
    /// Served model name
    pub model_name: String,
}

impl DeploymentKey {
    pub fn new(
        pipeline_name: impl Into<String>,
        step_name: impl Into<String>,
        model_name: impl Into<String>,
    ) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            step_name: step_name.into(),
            model_name: model_name.into(),
        }
    }
}

impl Default for DeploymentKey {
    fn default() -> Self {
        Self::new("continuous_deployment_pipeline", "deployer_step", "model")
    }
}

impl fmt::Display for DeploymentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.pipeline_name, self.step_name, self.model_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_rejects_ragged_columns() {
        let result = Table::new(vec![
            Column::numeric("a", vec![1.0, 2.0]),
            Column::numeric("b", vec![1.0]),
        ]);
        assert!(matches!(result, Err(ChurnlineError::Schema(_))));
    }

    #[test]
    fn test_table_rejects_duplicate_names() {
        let result = Table::new(vec![
            Column::numeric("a", vec![1.0]),
            Column::numeric("a", vec![2.0]),
        ]);
        assert!(matches!(result, Err(ChurnlineError::Schema(_))));
    }

    #[test]
    fn test_deserialize_validates_columns() {
        let ragged = r#"[
            {"name": "a", "data": {"type": "numeric", "values": [1.0, 2.0]}},
            {"name": "b", "data": {"type": "numeric", "values": [1.0]}}
        ]"#;
        assert!(serde_json::from_str::<Table>(ragged).is_err());

        let table = Table::new(vec![
            Column::numeric("a", vec![1.0, 2.0]),
            Column::text("state", vec!["KS".into(), "OH".into()]),
        ])
        .unwrap();
        let json = serde_json::to_string(&table).unwrap();
        let parsed: Table = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, table);
        assert_eq!(parsed.num_rows(), 2);
    }

    #[test]
    fn test_take_rows_and_to_array() {
        let table = Table::new(vec![
            Column::numeric("a", vec![1.0, 2.0, 3.0]),
            Column::numeric("b", vec![10.0, 20.0, 30.0]),
        ])
        .unwrap();

        let picked = table.take_rows(&[2, 0]);
        assert_eq!(picked.num_rows(), 2);
        assert_eq!(
            picked.to_array().unwrap(),
            ndarray::array![[3.0, 30.0], [1.0, 10.0]]
        );
    }

    #[test]
    fn test_to_array_rejects_text() {
        let table = Table::new(vec![Column::text("state", vec!["KS".into()])]).unwrap();
        assert!(matches!(table.to_array(), Err(ChurnlineError::Schema(_))));
    }

    #[test]
    fn test_feature_vector_length_is_exact() {
        assert!(FeatureVector::from_slice(&[0.0; 13]).is_err());
        assert!(FeatureVector::from_slice(&[0.0; 15]).is_err());

        let mut values = [0.0; FEATURE_COUNT];
        values[0] = 42.0;
        let vector = FeatureVector::from_slice(&values).unwrap();
        assert_eq!(vector.get("account_length"), Some(42.0));
        assert_eq!(vector.get("churn"), None);
    }

    #[test]
    fn test_default_deployment_key() {
        let key = DeploymentKey::default();
        assert_eq!(key.to_string(), "continuous_deployment_pipeline/deployer_step/model");
    }
}
