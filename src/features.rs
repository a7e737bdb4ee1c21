//! Lag-window feature table built from normalized log-increment series.

use std::collections::HashSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::normalize::NormalizedTable;
use crate::records::{Field, FieldPair, LocationKey, COUNTRY_COLUMN, PROVINCE_COLUMN};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_LAG_WINDOW: usize = 30;

const LAT_COLUMN: &str = "Lat";
const LONG_COLUMN: &str = "Long";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDType {
    F64,
    Category,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

impl FeatureSchema {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }
}

/// One model-facing cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeatureValue {
    Numeric(f64),
    Category(String),
}

impl FeatureValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Numeric(v) => Some(*v),
            Self::Category(_) => None,
        }
    }

    pub fn as_category(&self) -> Option<&str> {
        match self {
            Self::Numeric(_) => None,
            Self::Category(v) => Some(v),
        }
    }

    pub fn to_cell(&self) -> String {
        match self {
            Self::Numeric(v) => crate::dataset::format_value(*v),
            Self::Category(v) => v.clone(),
        }
    }

    fn category_from_number(v: f64) -> Self {
        if v.is_nan() {
            Self::Category(String::new())
        } else if v.fract() == 0.0 {
            Self::Category(format!("{}", v as i64))
        } else {
            Self::Category(v.to_string())
        }
    }
}

/// Rows handed to a regressor in one call, in schema column order.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureBatch<'a> {
    pub schema: &'a FeatureSchema,
    pub rows: Vec<Vec<FeatureValue>>,
}

impl FeatureBatch<'_> {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LagFeatureConfig {
    pub window: usize,
    /// Attribute columns handed to the model as categories instead of numbers.
    pub cat_features: Vec<String>,
    pub schema_version: u32,
}

impl Default for LagFeatureConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_LAG_WINDOW,
            cat_features: Vec::new(),
            schema_version: FEATURE_SCHEMA_VERSION,
        }
    }
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("invalid lag feature config: {0}")]
    InvalidConfig(String),
    #[error("duplicate feature column: {0}")]
    DuplicateColumn(String),
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub location: LocationKey,
    pub date: NaiveDate,
    pub cumulative: FieldPair<Option<u64>>,
    /// `ln(1 + increment)`; NaN when the increment is unobserved.
    pub log_new: FieldPair<f64>,
    /// `lags.get(field)[k - 1]` holds the value `k` rows back.
    pub lags: FieldPair<Vec<f64>>,
    pub lat: Option<f64>,
    pub long: Option<f64>,
    pub attributes: Vec<f64>,
}

impl FeatureRow {
    /// Observed lag at 1-based `offset`; NaN when out of the window.
    pub fn lag(&self, field: Field, offset: usize) -> f64 {
        offset
            .checked_sub(1)
            .and_then(|idx| self.lags.get(field).get(idx))
            .copied()
            .unwrap_or(f64::NAN)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTable {
    schema: FeatureSchema,
    window: usize,
    attribute_columns: Vec<String>,
    categorical_attributes: Vec<bool>,
    rows: Vec<FeatureRow>,
}

impl FeatureTable {
    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn attribute_columns(&self) -> &[String] {
        &self.attribute_columns
    }

    pub fn rows(&self) -> &[FeatureRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Model-facing values of row `idx`, resolving each lag cell through `lag`.
    pub fn model_input(
        &self,
        idx: usize,
        lag: impl Fn(&FeatureRow, Field, usize) -> f64,
    ) -> Vec<FeatureValue> {
        let row = &self.rows[idx];
        let mut values = Vec::with_capacity(self.schema.columns.len());
        values.push(FeatureValue::Category(row.location.country.clone()));
        values.push(FeatureValue::Category(row.location.province.clone()));
        values.push(FeatureValue::Numeric(row.lat.unwrap_or(f64::NAN)));
        values.push(FeatureValue::Numeric(row.long.unwrap_or(f64::NAN)));

        for (value, categorical) in row.attributes.iter().zip(&self.categorical_attributes) {
            if *categorical {
                values.push(FeatureValue::category_from_number(*value));
            } else {
                values.push(FeatureValue::Numeric(*value));
            }
        }

        for field in Field::ALL {
            for offset in 1..=self.window {
                values.push(FeatureValue::Numeric(lag(row, field, offset)));
            }
        }
        values
    }

    /// Model-facing values of row `idx` using only observed lags.
    pub fn observed_input(&self, idx: usize) -> Vec<FeatureValue> {
        self.model_input(idx, |row, field, offset| row.lag(field, offset))
    }

    /// Same schema, only rows whose date satisfies `keep`.
    pub fn retain_dates(&self, keep: impl Fn(NaiveDate) -> bool) -> FeatureTable {
        FeatureTable {
            schema: self.schema.clone(),
            window: self.window,
            attribute_columns: self.attribute_columns.clone(),
            categorical_attributes: self.categorical_attributes.clone(),
            rows: self
                .rows
                .iter()
                .filter(|row| keep(row.date))
                .cloned()
                .collect(),
        }
    }
}

pub fn build_feature_schema(
    attribute_columns: &[String],
    cfg: &LagFeatureConfig,
) -> Result<FeatureSchema, FeatureError> {
    let mut columns = vec![
        FeatureColumn {
            name: COUNTRY_COLUMN.to_string(),
            dtype: FeatureDType::Category,
        },
        FeatureColumn {
            name: PROVINCE_COLUMN.to_string(),
            dtype: FeatureDType::Category,
        },
        FeatureColumn {
            name: LAT_COLUMN.to_string(),
            dtype: FeatureDType::F64,
        },
        FeatureColumn {
            name: LONG_COLUMN.to_string(),
            dtype: FeatureDType::F64,
        },
    ];

    for name in attribute_columns {
        let dtype = if cfg.cat_features.contains(name) {
            FeatureDType::Category
        } else {
            FeatureDType::F64
        };
        columns.push(FeatureColumn {
            name: name.clone(),
            dtype,
        });
    }

    for field in Field::ALL {
        for offset in 1..=cfg.window {
            columns.push(FeatureColumn {
                name: field.lag_column(offset),
                dtype: FeatureDType::F64,
            });
        }
    }

    let mut seen = HashSet::new();
    for column in &columns {
        if !seen.insert(column.name.as_str()) {
            return Err(FeatureError::DuplicateColumn(column.name.clone()));
        }
    }

    let fingerprint = schema_fingerprint(cfg, &columns);

    info!(
        component = "features",
        event = "features.schema.built",
        version = cfg.schema_version,
        window = cfg.window,
        column_count = columns.len(),
        fingerprint = fingerprint
    );

    Ok(FeatureSchema {
        version: cfg.schema_version,
        fingerprint,
        columns,
    })
}

/// Builds `H` lag columns per field for every surviving row.
///
/// Lag `k` at position `i` of a location's date-ordered series is the
/// log-increment at position `i - k`, or NaN when `i < k`. Windows never
/// cross location boundaries.
pub fn build_lag_features(
    normalized: &NormalizedTable,
    cfg: &LagFeatureConfig,
) -> Result<FeatureTable, FeatureError> {
    validate_config(cfg)?;
    let schema = build_feature_schema(&normalized.attribute_columns, cfg)?;

    let categorical_attributes = normalized
        .attribute_columns
        .iter()
        .map(|name| cfg.cat_features.contains(name))
        .collect();

    let mut rows = Vec::new();
    for series in &normalized.series {
        for (position, obs) in series.rows.iter().enumerate() {
            rows.push(FeatureRow {
                location: obs.location.clone(),
                date: obs.date,
                cumulative: obs.cumulative,
                log_new: FieldPair::from_fn(|field| series.log_new.get(field)[position]),
                lags: FieldPair::from_fn(|field| {
                    lag_window(series.log_new.get(field), position, cfg.window)
                }),
                lat: obs.lat,
                long: obs.long,
                attributes: obs.attributes.clone(),
            });
        }
    }

    info!(
        component = "features",
        event = "features.lags.built",
        locations = normalized.series.len(),
        rows = rows.len(),
        window = cfg.window
    );

    Ok(FeatureTable {
        schema,
        window: cfg.window,
        attribute_columns: normalized.attribute_columns.clone(),
        categorical_attributes,
        rows,
    })
}

/// Trailing window of `window` values strictly before `position`.
pub fn lag_window(values: &[f64], position: usize, window: usize) -> Vec<f64> {
    (1..=window)
        .map(|offset| {
            position
                .checked_sub(offset)
                .map_or(f64::NAN, |idx| values[idx])
        })
        .collect()
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), FeatureError> {
    if expected_version != actual.version {
        return Err(FeatureError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(FeatureError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

fn validate_config(cfg: &LagFeatureConfig) -> Result<(), FeatureError> {
    if cfg.schema_version != FEATURE_SCHEMA_VERSION {
        return Err(FeatureError::InvalidConfig(format!(
            "schema_version must equal FEATURE_SCHEMA_VERSION ({FEATURE_SCHEMA_VERSION})"
        )));
    }

    let mut seen = HashSet::new();
    for name in &cfg.cat_features {
        if !seen.insert(name) {
            return Err(FeatureError::InvalidConfig(format!(
                "cat_features entries must be unique: {name}"
            )));
        }
    }

    Ok(())
}

fn schema_fingerprint(cfg: &LagFeatureConfig, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{};", cfg.schema_version));
    hasher.update(format!("window:{};", cfg.window));
    hasher.update(";columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        match column.dtype {
            FeatureDType::F64 => hasher.update(":f64;"),
            FeatureDType::Category => hasher.update(":category;"),
        }
    }
    hex::encode(hasher.finalize())
}
