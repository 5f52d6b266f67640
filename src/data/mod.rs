//! Data ingestion and transforms.
//!
//! A [`DataSource`] turns a path into a [`Table`]; [`transform`] holds the
//! cleaning and splitting steps that run on it.

pub mod transform;

pub use transform::{clean, split, DataTransform, DEFAULT_SEED, DEFAULT_TEST_FRACTION};

use crate::error::{ChurnlineError, Result};
use crate::types::{Column, Table};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Source of tabular training data.
pub trait DataSource: Send + Sync {
    /// Reads the table stored at `path`.
    fn read(&self, path: &Path) -> Result<Table>;

    /// Content fingerprint of `path`, used as the ingest step's cache input.
    fn fingerprint(&self, path: &Path) -> Result<String>;
}

/// Reads comma-separated files with a header row.
///
/// A column is numeric when every non-empty cell parses as a float; empty
/// cells in numeric columns become NaN. Everything else is kept as text.
#[derive(Debug, Clone)]
pub struct CsvDataSource {
    delimiter: u8,
}

impl Default for CsvDataSource {
    fn default() -> Self {
        Self { delimiter: b',' }
    }
}

impl CsvDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a different field delimiter
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    fn ingest_error(path: &Path, reason: impl ToString) -> ChurnlineError {
        ChurnlineError::Ingest {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

impl DataSource for CsvDataSource {
    fn read(&self, path: &Path) -> Result<Table> {
        info!(path = %path.display(), "Ingesting data");

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| {
                error!(path = %path.display(), error = %e, "Failed to open data file");
                Self::ingest_error(path, e)
            })?;

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| Self::ingest_error(path, e))?
            .iter()
            .map(str::to_string)
            .collect();

        let mut cells: Vec<Vec<String>> = vec![Vec::new(); headers.len()];
        for (line, record) in reader.records().enumerate() {
            let record = record.map_err(|e| {
                error!(path = %path.display(), line = line + 2, error = %e, "Malformed record");
                Self::ingest_error(path, e)
            })?;
            for (column, value) in cells.iter_mut().zip(record.iter()) {
                column.push(value.to_string());
            }
        }

        let columns = headers
            .into_iter()
            .zip(cells)
            .map(|(name, values)| infer_column(name, values))
            .collect();

        let table = Table::new(columns)?;
        debug!(
            rows = table.num_rows(),
            columns = table.num_columns(),
            "Data ingested"
        );
        Ok(table)
    }

    fn fingerprint(&self, path: &Path) -> Result<String> {
        let bytes = std::fs::read(path).map_err(|e| {
            error!(path = %path.display(), error = %e, "Failed to read data file");
            Self::ingest_error(path, e)
        })?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

fn infer_column(name: String, values: Vec<String>) -> Column {
    let parsed: Option<Vec<f64>> = values
        .iter()
        .map(|v| {
            if v.is_empty() {
                Some(f64::NAN)
            } else {
                v.parse::<f64>().ok()
            }
        })
        .collect();

    match parsed {
        Some(numbers) => Column::numeric(name, numbers),
        None => Column::text(name, values),
    }
}

/// Serves tables registered under synthetic paths.
#[derive(Default)]
pub struct MemoryDataSource {
    tables: RwLock<HashMap<PathBuf, Table>>,
}

impl MemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `table` under `path`
    pub fn insert(&self, path: impl Into<PathBuf>, table: Table) {
        self.tables.write().insert(path.into(), table);
    }
}

impl DataSource for MemoryDataSource {
    fn read(&self, path: &Path) -> Result<Table> {
        self.tables.read().get(path).cloned().ok_or_else(|| ChurnlineError::Ingest {
            path: path.display().to_string(),
            reason: "no such table".to_string(),
        })
    }

    fn fingerprint(&self, path: &Path) -> Result<String> {
        let table = self.read(path)?;
        let bytes = serde_json::to_vec(&table)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_csv(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_csv_infers_column_types() {
        let file = write_csv("state,account_length,churn\nKS,128,0\nOH,,1\n");
        let table = CsvDataSource::new().read(file.path()).unwrap();

        assert_eq!(table.num_rows(), 2);
        assert!(table.column("state").unwrap().is_text());

        let lengths = table.numeric("account_length").unwrap();
        assert_eq!(lengths[0], 128.0);
        assert!(lengths[1].is_nan());
        assert_eq!(table.numeric("churn").unwrap(), &[0.0, 1.0]);
    }

    #[test]
    fn test_csv_missing_file() {
        let result = CsvDataSource::new().read(Path::new("/nonexistent/data.csv"));
        assert!(matches!(result, Err(ChurnlineError::Ingest { .. })));
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = write_csv("x\n1\n");
        let b = write_csv("x\n2\n");
        let source = CsvDataSource::new();

        assert_eq!(
            source.fingerprint(a.path()).unwrap(),
            source.fingerprint(a.path()).unwrap()
        );
        assert_ne!(
            source.fingerprint(a.path()).unwrap(),
            source.fingerprint(b.path()).unwrap()
        );
    }

    #[test]
    fn test_memory_source() {
        let source = MemoryDataSource::new();
        let table = Table::new(vec![Column::numeric("x", vec![1.0])]).unwrap();
        source.insert("mem://train", table.clone());

        assert_eq!(source.read(Path::new("mem://train")).unwrap(), table);
        assert!(source.read(Path::new("mem://other")).is_err());
    }
}
