//! Date-based train/eval/test partitioning of a feature table.
//!
//! The same boundaries drive the forecast rollouts; the partitioned tables and
//! [`training_matrix`] feed model fitting outside this crate.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::features::{FeatureBatch, FeatureTable};
use crate::records::{Field, FieldPair};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateSplit {
    pub last_train_date: NaiveDate,
    pub last_eval_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SplitTables {
    pub train: FeatureTable,
    pub eval: FeatureTable,
    pub test: FeatureTable,
}

impl DateSplit {
    /// Train `<= last_train_date`, eval in `(last_train_date, last_eval_date]`,
    /// test after `last_eval_date`. All three share the input schema.
    pub fn split(&self, table: &FeatureTable) -> SplitTables {
        let train = table.retain_dates(|date| date <= self.last_train_date);
        let eval = table
            .retain_dates(|date| date > self.last_train_date && date <= self.last_eval_date);
        let test = table.retain_dates(|date| date > self.last_eval_date);

        info!(
            component = "split",
            event = "split.finish",
            last_train_date = %self.last_train_date,
            last_eval_date = %self.last_eval_date,
            train_rows = train.len(),
            eval_rows = eval.len(),
            test_rows = test.len()
        );

        SplitTables { train, eval, test }
    }
}

/// Model inputs of every row, with observed lags, and the log-increment
/// labels per field (NaN where unobserved).
pub fn training_matrix(table: &FeatureTable) -> (FeatureBatch<'_>, FieldPair<Vec<f64>>) {
    let batch = FeatureBatch {
        schema: table.schema(),
        rows: (0..table.len()).map(|idx| table.observed_input(idx)).collect(),
    };
    let labels = FieldPair::from_fn(|field: Field| {
        table
            .rows()
            .iter()
            .map(|row| *row.log_new.get(field))
            .collect()
    });
    (batch, labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{build_lag_features, LagFeatureConfig};
    use crate::normalize::normalize_series;
    use crate::records::{LocationKey, ObservationRow, ObservationTable};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 3, d).unwrap()
    }

    fn table() -> FeatureTable {
        let rows = (1..=6)
            .map(|d| {
                ObservationRow::new(
                    LocationKey::new("Italy", ""),
                    day(d),
                    FieldPair::new(Some(u64::from(d) * 10), Some(u64::from(d))),
                )
            })
            .collect();
        let normalized = normalize_series(ObservationTable::from_rows(rows)).unwrap();
        let cfg = LagFeatureConfig {
            window: 2,
            ..LagFeatureConfig::default()
        };
        build_lag_features(&normalized, &cfg).unwrap()
    }

    #[test]
    fn split_bounds_are_inclusive_on_the_right() {
        let split = DateSplit {
            last_train_date: day(3),
            last_eval_date: day(5),
        };
        let parts = split.split(&table());
        assert_eq!(parts.train.len(), 3);
        assert_eq!(parts.eval.len(), 2);
        assert_eq!(parts.test.len(), 1);
        assert_eq!(parts.test.rows()[0].date, day(6));
        assert_eq!(parts.train.schema(), parts.test.schema());
    }

    #[test]
    fn training_matrix_excludes_targets_and_counts() {
        let table = table();
        let (batch, labels) = training_matrix(&table);
        assert_eq!(batch.len(), 6);
        assert_eq!(batch.rows[0].len(), table.schema().columns.len());
        assert!(table
            .schema()
            .columns
            .iter()
            .all(|column| !column.name.starts_with("LogNew") || column.name.contains("_prev_day_")));
        assert_eq!(labels.confirmed_cases[1], 10.0_f64.ln_1p());
        assert_eq!(labels.fatalities[0], 1.0_f64.ln_1p());
    }
}
