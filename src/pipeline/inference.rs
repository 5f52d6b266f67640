// Inference flow: payload parsing, service loading and prediction

use crate::compute::ServiceRegistry;
use crate::data::{clean, DataSource};
use crate::error::{ChurnlineError, Result};
use crate::types::{Column, DeploymentKey, FeatureVector, Table, FEATURE_COLUMNS, FEATURE_COUNT};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long inference waits for a stopped service to become healthy.
pub const DEFAULT_INFERENCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Loads the deployed service for a key and scores request payloads with it.
#[derive(Clone)]
pub struct InferenceFlow {
    registry: Arc<ServiceRegistry>,
    timeout: Duration,
}

impl InferenceFlow {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            timeout: DEFAULT_INFERENCE_TIMEOUT,
        }
    }

    /// Overrides the start timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Scores a split-oriented JSON payload; one prediction per `data` row.
    ///
    /// The service is looked up whether running or stopped and started
    /// before predicting. Fails with `ServiceBusy` while another process
    /// serves the key.
    pub async fn predict(&self, raw: &str, key: &DeploymentKey) -> Result<Vec<f64>> {
        let rows = parse_payload(raw).map_err(|e| {
            error!(key = %key, error = %e, "Rejected inference payload");
            e
        })?;

        let record = self.registry.lookup(key, false).await?;
        let record = self.registry.start(&record, self.timeout).await?;

        let predictions = record.endpoint.predict(&rows).await?;
        info!(key = %key, version = record.version, rows = predictions.len(), "Served predictions");
        Ok(predictions)
    }
}

/// Parses a request payload into feature vectors.
///
/// `data` holds either row objects keyed by feature name or row arrays.
/// Array rows are read through `columns` when present, otherwise by position.
/// `columns` and `index` are not treated as feature data.
pub fn parse_payload(raw: &str) -> Result<Vec<FeatureVector>> {
    let payload: Value = serde_json::from_str(raw)
        .map_err(|e| ChurnlineError::Schema(format!("payload is not valid JSON: {}", e)))?;
    let payload = payload
        .as_object()
        .ok_or_else(|| ChurnlineError::Schema("payload must be a JSON object".to_string()))?;

    let positions = match payload.get("columns") {
        None | Some(Value::Null) => None,
        Some(Value::Array(columns)) => Some(column_positions(columns)?),
        Some(_) => {
            return Err(ChurnlineError::Schema("'columns' must be an array of names".to_string()));
        }
    };

    let data = payload
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| ChurnlineError::Schema("payload needs a 'data' array".to_string()))?;

    let rows = data
        .iter()
        .enumerate()
        .map(|(i, row)| match row {
            Value::Object(fields) => parse_object_row(i, fields),
            Value::Array(values) => parse_array_row(i, values, positions.as_deref()),
            _ => Err(ChurnlineError::Schema(format!("row {} must be an array or an object", i))),
        })
        .collect::<Result<Vec<_>>>()?;

    debug!(rows = rows.len(), "Parsed inference payload");
    Ok(rows)
}

/// Maps each payload column to its slot in [`FEATURE_COLUMNS`]; the names
/// must be exactly the feature set.
fn column_positions(columns: &[Value]) -> Result<Vec<usize>> {
    let names = columns
        .iter()
        .map(|c| {
            c.as_str().ok_or_else(|| {
                ChurnlineError::Schema("'columns' must contain only names".to_string())
            })
        })
        .collect::<Result<Vec<&str>>>()?;

    check_feature_set(names.iter().copied())?;
    if names.len() != FEATURE_COUNT {
        return Err(ChurnlineError::Schema("'columns' contains duplicate names".to_string()));
    }

    Ok(names
        .iter()
        .filter_map(|name| FEATURE_COLUMNS.iter().position(|f| f == name))
        .collect())
}

fn check_feature_set<'a>(names: impl Iterator<Item = &'a str>) -> Result<()> {
    let given: HashSet<&str> = names.collect();
    let expected: HashSet<&str> = FEATURE_COLUMNS.iter().copied().collect();

    let mut missing: Vec<&str> = expected.difference(&given).copied().collect();
    let mut extra: Vec<&str> = given.difference(&expected).copied().collect();
    if missing.is_empty() && extra.is_empty() {
        return Ok(());
    }
    missing.sort_unstable();
    extra.sort_unstable();
    Err(ChurnlineError::Schema(format!(
        "feature set mismatch: missing {:?}, unexpected {:?}",
        missing, extra
    )))
}

fn parse_object_row(row: usize, fields: &Map<String, Value>) -> Result<FeatureVector> {
    check_feature_set(fields.keys().map(String::as_str))?;

    let mut values = [0.0; FEATURE_COUNT];
    for (slot, feature) in values.iter_mut().zip(FEATURE_COLUMNS) {
        *slot = numeric_value(row, feature, &fields[feature])?;
    }
    FeatureVector::from_slice(&values)
}

fn parse_array_row(
    row: usize,
    cells: &[Value],
    positions: Option<&[usize]>,
) -> Result<FeatureVector> {
    if cells.len() != FEATURE_COUNT {
        return Err(ChurnlineError::Schema(format!(
            "row {} has {} values, expected {}",
            row,
            cells.len(),
            FEATURE_COUNT
        )));
    }

    let mut values = [0.0; FEATURE_COUNT];
    for (i, cell) in cells.iter().enumerate() {
        let slot = positions.map_or(i, |p| p[i]);
        values[slot] = numeric_value(row, FEATURE_COLUMNS[slot], cell)?;
    }
    FeatureVector::from_slice(&values)
}

fn numeric_value(row: usize, feature: &str, value: &Value) -> Result<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    };
    number.ok_or_else(|| {
        ChurnlineError::Schema(format!(
            "row {} feature '{}' is not numeric: {}",
            row, feature, value
        ))
    })
}

/// Builds a request payload from up to `n` randomly sampled rows of the
/// cleaned training data, without the target column.
pub fn sample_payload(source: &dyn DataSource, path: &Path, n: usize, seed: u64) -> Result<String> {
    let table = clean(&source.read(path)?)?;

    let features = Table::new(
        FEATURE_COLUMNS
            .iter()
            .map(|f| Ok(Column::numeric(*f, table.numeric(f)?.to_vec())))
            .collect::<Result<Vec<_>>>()?,
    )?;

    // Rows with missing features would be rejected by the server
    let matrix = features.to_array()?;
    let mut indices: Vec<usize> = matrix
        .outer_iter()
        .enumerate()
        .filter(|(_, row)| row.iter().all(|v| v.is_finite()))
        .map(|(i, _)| i)
        .collect();
    let skipped = matrix.nrows() - indices.len();
    if skipped > 0 {
        warn!(path = %path.display(), rows = skipped, "Skipping rows with missing feature values");
    }

    indices.shuffle(&mut StdRng::seed_from_u64(seed));
    indices.truncate(n);

    let data: Vec<Vec<f64>> = indices.iter().map(|&i| matrix.row(i).to_vec()).collect();
    let payload = json!({
        "columns": FEATURE_COLUMNS,
        "index": indices,
        "data": data,
    });

    info!(path = %path.display(), rows = indices.len(), "Sampled inference payload");
    Ok(serde_json::to_string(&payload)?)
}
