// Cleaning and train/test splitting of churn tables

use crate::error::{ChurnlineError, Result};
use crate::types::{Split, Table, CHARGE_COLUMNS, FEATURE_COLUMNS, TARGET_COLUMN};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Share of rows held out for evaluation.
pub const DEFAULT_TEST_FRACTION: f64 = 0.2;

/// Seed for the split permutation.
pub const DEFAULT_SEED: u64 = 42;

/// Split settings applied after cleaning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataTransform {
    /// Column to predict
    pub target_column: String,
    /// Fraction of rows in the test partition, in (0, 1)
    pub test_fraction: f64,
    /// Permutation seed
    pub seed: u64,
}

impl Default for DataTransform {
    fn default() -> Self {
        Self {
            target_column: TARGET_COLUMN.to_string(),
            test_fraction: DEFAULT_TEST_FRACTION,
            seed: DEFAULT_SEED,
        }
    }
}

impl DataTransform {
    /// Cleans `table` and splits it with these settings.
    pub fn clean_and_split(&self, table: &Table) -> Result<Split> {
        let cleaned = clean(table)?;
        split(&cleaned, &self.target_column, self.test_fraction, self.seed)
    }
}

/// Keeps numeric columns and drops the redundant charge columns.
///
/// Every feature column must be present and numeric. Charge columns that are
/// already absent are ignored, so cleaning a cleaned table is a no-op.
pub fn clean(table: &Table) -> Result<Table> {
    for feature in FEATURE_COLUMNS {
        if let Err(e) = table.numeric(feature) {
            error!(column = feature, error = %e, "Cleaning failed");
            return Err(e);
        }
    }

    let cleaned =
        table.retain_columns(|c| c.is_numeric() && !CHARGE_COLUMNS.contains(&c.name.as_str()));
    debug!(
        before = table.num_columns(),
        after = cleaned.num_columns(),
        "Cleaned table"
    );
    Ok(cleaned)
}

/// Splits `table` into features and target, then into seeded train/test partitions.
///
/// The test partition holds `ceil(rows * test_fraction)` rows taken from the
/// front of a permutation drawn from `StdRng::seed_from_u64(seed)`; the
/// remaining rows form the training partition.
pub fn split(table: &Table, target_column: &str, test_fraction: f64, seed: u64) -> Result<Split> {
    if !(test_fraction > 0.0 && test_fraction < 1.0) {
        return Err(ChurnlineError::InvalidArgument(format!(
            "test fraction must be in (0, 1), got {}",
            test_fraction
        )));
    }

    debug!(columns = ?table.column_names(), "Data columns before division");
    let (features, target) = table.without_column(target_column).map_err(|e| {
        error!(target = target_column, error = %e, "Split failed");
        e
    })?;
    let y = target.as_numeric().ok_or_else(|| {
        ChurnlineError::Schema(format!("target column '{}' is not numeric", target_column))
    })?;

    let rows = table.num_rows();
    let n_test = (rows as f64 * test_fraction).ceil() as usize;
    if n_test == 0 || n_test >= rows {
        return Err(ChurnlineError::InvalidArgument(format!(
            "cannot split {} rows with test fraction {}",
            rows, test_fraction
        )));
    }

    let mut permutation: Vec<usize> = (0..rows).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    permutation.shuffle(&mut rng);
    let (test_idx, train_idx) = permutation.split_at(n_test);

    debug!(train = train_idx.len(), test = test_idx.len(), "Data split");

    Ok(Split {
        x_train: features.take_rows(train_idx),
        x_test: features.take_rows(test_idx),
        y_train: train_idx.iter().map(|&i| y[i]).collect(),
        y_test: test_idx.iter().map(|&i| y[i]).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Column;
    use std::collections::HashSet;

    fn churn_table(rows: usize) -> Table {
        let mut columns = vec![Column::text("state", vec!["KS".to_string(); rows])];
        for (i, feature) in FEATURE_COLUMNS.iter().enumerate() {
            columns.push(Column::numeric(
                *feature,
                (0..rows).map(|r| (r * (i + 1)) as f64).collect(),
            ));
        }
        for charge in CHARGE_COLUMNS {
            columns.push(Column::numeric(charge, (0..rows).map(|r| r as f64 * 0.17).collect()));
        }
        columns.push(Column::numeric(TARGET_COLUMN, (0..rows).map(|r| (r % 2) as f64).collect()));
        Table::new(columns).unwrap()
    }

    #[test]
    fn test_clean_drops_charges_and_text() {
        let cleaned = clean(&churn_table(5)).unwrap();

        assert!(!cleaned.has_column("total_day_charge"));
        assert!(!cleaned.has_column("state"));
        assert!(cleaned.has_column("account_length"));
        assert!(cleaned.has_column(TARGET_COLUMN));
        assert_eq!(cleaned.num_columns(), FEATURE_COLUMNS.len() + 1);
    }

    #[test]
    fn test_clean_is_idempotent() {
        let once = clean(&churn_table(7)).unwrap();
        let twice = clean(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_clean_requires_features() {
        let table = churn_table(3);
        let without = table.retain_columns(|c| c.name != "total_eve_minutes");
        assert!(matches!(clean(&without), Err(ChurnlineError::Schema(_))));
    }

    #[test]
    fn test_split_sizes_and_disjointness() {
        let table = clean(&churn_table(10)).unwrap();
        let split = split(&table, TARGET_COLUMN, 0.2, 42).unwrap();

        assert_eq!(split.x_test.num_rows(), 2);
        assert_eq!(split.x_train.num_rows(), 8);
        assert_eq!(split.y_train.len(), 8);
        assert_eq!(split.y_test.len(), 2);
        assert!(!split.x_train.has_column(TARGET_COLUMN));

        // account_length holds the row index, so it identifies rows
        let ids = |table: &Table| -> HashSet<u64> {
            table.numeric("account_length").unwrap().iter().map(|v| *v as u64).collect()
        };
        let train = ids(&split.x_train);
        let test = ids(&split.x_test);
        assert!(train.is_disjoint(&test));
        assert_eq!(train.len() + test.len(), 10);
    }

    #[test]
    fn test_split_is_deterministic() {
        let table = clean(&churn_table(50)).unwrap();
        let a = split(&table, TARGET_COLUMN, 0.2, 42).unwrap();
        let b = split(&table, TARGET_COLUMN, 0.2, 42).unwrap();
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );

        let c = split(&table, TARGET_COLUMN, 0.2, 7).unwrap();
        assert_ne!(a.x_test, c.x_test);
    }

    #[test]
    fn test_split_missing_target() {
        let table = clean(&churn_table(10)).unwrap();
        let result = split(&table, "cancelled", 0.2, 42);
        assert!(matches!(result, Err(ChurnlineError::Schema(_))));
    }

    #[test]
    fn test_split_rejects_degenerate_partitions() {
        let table = clean(&churn_table(1)).unwrap();
        assert!(matches!(
            split(&table, TARGET_COLUMN, 0.2, 42),
            Err(ChurnlineError::InvalidArgument(_))
        ));
        let table = clean(&churn_table(10)).unwrap();
        assert!(split(&table, TARGET_COLUMN, 1.0, 42).is_err());
    }
}
