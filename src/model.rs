//! Regression model seam used by the rollout.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::features::{
    assert_schema_compatible, FeatureBatch, FeatureError, FeatureSchema, FeatureValue,
    FEATURE_SCHEMA_VERSION,
};
use crate::records::FieldPair;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid model file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("incompatible feature schema: {0}")]
    Schema(#[from] FeatureError),
    #[error("model references unknown feature column {0}")]
    UnknownColumn(String),
    #[error("model {model} returned {actual} predictions for {expected} rows")]
    OutputLength {
        model: String,
        expected: usize,
        actual: usize,
    },
    #[error("model {model} returned non-finite prediction {value} at batch row {row}")]
    NonFinite {
        model: String,
        row: usize,
        value: f64,
    },
    #[error("prediction failed: {0}")]
    Predict(String),
}

/// External regression model: one log-increment per batch row, same order.
pub trait Regressor: Send + Sync {
    fn name(&self) -> &str;
    fn predict(&self, batch: &FeatureBatch<'_>) -> Result<Vec<f64>, ModelError>;
}

/// One regressor per forecast field.
pub type FieldModels = FieldPair<Box<dyn Regressor>>;

/// Linear model persisted as JSON. NaN numeric inputs and unseen categories
/// contribute nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearRegressor {
    #[serde(default = "default_linear_name")]
    pub name: String,
    #[serde(default)]
    pub schema_fingerprint: Option<String>,
    #[serde(default)]
    pub intercept: f64,
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
    #[serde(default)]
    pub category_weights: BTreeMap<String, BTreeMap<String, f64>>,
}

fn default_linear_name() -> String {
    "linear".to_string()
}

impl LinearRegressor {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let raw = fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let model: Self = serde_json::from_str(&raw).map_err(|source| ModelError::Json {
            path: path.to_path_buf(),
            source,
        })?;

        info!(
            component = "model",
            event = "model.loaded",
            path = %path.display(),
            name = %model.name,
            numeric_weights = model.weights.len(),
            category_weights = model.category_weights.len()
        );
        Ok(model)
    }

    /// Checks the pinned fingerprint, if any, and that every weighted column exists.
    pub fn check_schema(&self, schema: &FeatureSchema) -> Result<(), ModelError> {
        if let Some(fingerprint) = &self.schema_fingerprint {
            assert_schema_compatible(FEATURE_SCHEMA_VERSION, fingerprint, schema)?;
        }
        for column in self.weights.keys().chain(self.category_weights.keys()) {
            if schema.column_index(column).is_none() {
                return Err(ModelError::UnknownColumn(column.clone()));
            }
        }
        Ok(())
    }
}

impl Regressor for LinearRegressor {
    fn name(&self) -> &str {
        &self.name
    }

    fn predict(&self, batch: &FeatureBatch<'_>) -> Result<Vec<f64>, ModelError> {
        let numeric = resolve(batch.schema, &self.weights)?;
        let categorical = resolve(batch.schema, &self.category_weights)?;

        let predictions = batch
            .rows
            .iter()
            .map(|row| {
                let mut total = self.intercept;
                for &(idx, weight) in &numeric {
                    if let Some(v) = row[idx].as_f64().filter(|v| !v.is_nan()) {
                        total += *weight * v;
                    }
                }
                for (idx, levels) in &categorical {
                    let level = match &row[*idx] {
                        FeatureValue::Category(level) => level.clone(),
                        other => other.to_cell(),
                    };
                    total += levels.get(&level).copied().unwrap_or(0.0);
                }
                total
            })
            .collect();
        Ok(predictions)
    }
}

fn resolve<'m, T>(
    schema: &FeatureSchema,
    weights: &'m BTreeMap<String, T>,
) -> Result<Vec<(usize, &'m T)>, ModelError> {
    weights
        .iter()
        .map(|(name, weight)| {
            schema
                .column_index(name)
                .map(|idx| (idx, weight))
                .ok_or_else(|| ModelError::UnknownColumn(name.clone()))
        })
        .collect()
}

/// Adapts a closure into a [`Regressor`].
pub struct FnRegressor<F> {
    name: String,
    f: F,
}

impl<F> FnRegressor<F>
where
    F: Fn(&FeatureBatch<'_>) -> Result<Vec<f64>, ModelError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Regressor for FnRegressor<F>
where
    F: Fn(&FeatureBatch<'_>) -> Result<Vec<f64>, ModelError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn predict(&self, batch: &FeatureBatch<'_>) -> Result<Vec<f64>, ModelError> {
        (self.f)(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{FeatureColumn, FeatureDType};
    use tempfile::tempdir;

    fn schema() -> FeatureSchema {
        FeatureSchema {
            version: FEATURE_SCHEMA_VERSION,
            fingerprint: "abc".to_string(),
            columns: vec![
                FeatureColumn {
                    name: "Country/Region".to_string(),
                    dtype: FeatureDType::Category,
                },
                FeatureColumn {
                    name: "LogNewConfirmedCases_prev_day_1".to_string(),
                    dtype: FeatureDType::F64,
                },
            ],
        }
    }

    #[test]
    fn linear_model_sums_weights_and_skips_missing_inputs() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("cases.json");
        fs::write(
            &path,
            r#"{
                "intercept": 0.5,
                "weights": {"LogNewConfirmedCases_prev_day_1": 0.9},
                "category_weights": {"Country/Region": {"Italy": 0.25}}
            }"#,
        )
        .unwrap();
        let model = LinearRegressor::load(&path).unwrap();
        let schema = schema();
        model.check_schema(&schema).unwrap();

        let batch = FeatureBatch {
            schema: &schema,
            rows: vec![
                vec![
                    FeatureValue::Category("Italy".to_string()),
                    FeatureValue::Numeric(2.0),
                ],
                vec![
                    FeatureValue::Category("Chad".to_string()),
                    FeatureValue::Numeric(f64::NAN),
                ],
            ],
        };
        let out = model.predict(&batch).unwrap();
        assert_eq!(model.name(), "linear");
        assert!((out[0] - 2.55).abs() < 1e-12);
        assert_eq!(out[1], 0.5);
    }

    #[test]
    fn pinned_fingerprint_and_unknown_columns_are_checked() {
        let schema = schema();
        let pinned = LinearRegressor {
            name: "pinned".to_string(),
            schema_fingerprint: Some("other".to_string()),
            intercept: 0.0,
            weights: BTreeMap::new(),
            category_weights: BTreeMap::new(),
        };
        assert!(matches!(
            pinned.check_schema(&schema),
            Err(ModelError::Schema(FeatureError::SchemaFingerprintMismatch { .. }))
        ));

        let unknown = LinearRegressor {
            schema_fingerprint: None,
            weights: BTreeMap::from([("Nope".to_string(), 1.0)]),
            ..pinned
        };
        assert!(matches!(
            unknown.check_schema(&schema),
            Err(ModelError::UnknownColumn(name)) if name == "Nope"
        ));
    }

    #[test]
    fn malformed_model_file_is_reported_with_path() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();
        match LinearRegressor::load(&path).unwrap_err() {
            ModelError::Json { path: reported, .. } => assert_eq!(reported, path),
            other => panic!("unexpected error: {other}"),
        }
    }
}
