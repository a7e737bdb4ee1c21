//! Table-join steps applied to observations before normalization.
//!
//! Each step is a pure `ObservationTable -> ObservationTable` transform that
//! appends attribute columns. Steps run in the order they are listed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDate};
use thiserror::Error;
use tracing::info;

use crate::records::{Field, LocationKey, ObservationTable};

const EARTH_RADIUS_KM: f64 = 6_371.0088;

pub const DISTANCE_TO_ORIGIN_COLUMN: &str = "Distance_to_origin";
pub const DAY_COLUMN: &str = "Day";
pub const WEEKDAY_COLUMN: &str = "WeekDay";

#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{path} line {line}: column {column} has non-numeric value '{value}'")]
    ParseValue {
        path: PathBuf,
        line: u64,
        column: String,
        value: String,
    },
    #[error("reference table {0} has no attribute columns")]
    EmptyReference(PathBuf),
    #[error("attribute column {0} is not present")]
    MissingColumn(String),
    #[error("attribute column {0} already exists")]
    DuplicateColumn(String),
    #[error("origin province {0} has no row with coordinates")]
    OriginNotFound(String),
}

pub trait Enrichment: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, table: ObservationTable) -> Result<ObservationTable, EnrichmentError>;
}

/// Runs `steps` in order.
pub fn apply_enrichments(
    mut table: ObservationTable,
    steps: &[Box<dyn Enrichment>],
) -> Result<ObservationTable, EnrichmentError> {
    for step in steps {
        let before = table.attribute_columns.len();
        table = step.apply(table)?;
        info!(
            component = "enrichment",
            event = "enrichment.step.applied",
            step = step.name(),
            columns_added = table.attribute_columns.len() - before,
            rows = table.rows.len()
        );
    }
    Ok(table)
}

fn add_column(
    mut table: ObservationTable,
    name: &str,
    values: Vec<f64>,
) -> Result<ObservationTable, EnrichmentError> {
    if table.attribute_index(name).is_some() {
        return Err(EnrichmentError::DuplicateColumn(name.to_string()));
    }
    table.attribute_columns.push(name.to_string());
    for (row, value) in table.rows.iter_mut().zip(values) {
        row.attributes.push(value);
    }
    Ok(table)
}

/// Left join of per-country numeric attributes (population, health
/// expenditure, hospital beds, smoking rate, land area, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct CountryAttributeJoin {
    name: String,
    columns: Vec<String>,
    values: HashMap<String, Vec<f64>>,
}

impl CountryAttributeJoin {
    pub fn new(
        name: impl Into<String>,
        columns: Vec<String>,
        values: HashMap<String, Vec<f64>>,
    ) -> Self {
        Self {
            name: name.into(),
            columns,
            values,
        }
    }

    /// Loads a reference CSV whose first column is the country name and whose
    /// remaining columns are numeric. Reference names found in `remap` are
    /// rewritten to the names used by the observation data; empty cells are NaN.
    pub fn from_csv(path: &Path, remap: &HashMap<String, String>) -> Result<Self, EnrichmentError> {
        let csv_err = |source| EnrichmentError::Csv {
            path: path.to_path_buf(),
            source,
        };
        let mut reader = csv::Reader::from_path(path).map_err(csv_err)?;
        let headers = reader.headers().map_err(csv_err)?.clone();
        let columns: Vec<String> = headers.iter().skip(1).map(str::to_string).collect();
        if columns.is_empty() {
            return Err(EnrichmentError::EmptyReference(path.to_path_buf()));
        }

        let mut values = HashMap::new();
        for record in reader.records() {
            let record = record.map_err(csv_err)?;
            let line = record.position().map(|pos| pos.line()).unwrap_or_default();
            let raw_country = record.get(0).unwrap_or_default().trim();
            let country = remap
                .get(raw_country)
                .cloned()
                .unwrap_or_else(|| raw_country.to_string());

            let mut row = Vec::with_capacity(columns.len());
            for (idx, column) in columns.iter().enumerate() {
                let raw = record.get(idx + 1).unwrap_or_default().trim();
                if raw.is_empty() {
                    row.push(f64::NAN);
                    continue;
                }
                let value = raw.parse::<f64>().map_err(|_| EnrichmentError::ParseValue {
                    path: path.to_path_buf(),
                    line,
                    column: column.clone(),
                    value: raw.to_string(),
                })?;
                row.push(value);
            }
            // first occurrence wins, as with a left join on a deduplicated table
            values.entry(country).or_insert(row);
        }

        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| "country_attributes".to_string());
        Ok(Self::new(name, columns, values))
    }

    /// Prepends `prefix` to every added column name.
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        for column in &mut self.columns {
            column.insert_str(0, prefix);
        }
        self
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

impl Enrichment for CountryAttributeJoin {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, mut table: ObservationTable) -> Result<ObservationTable, EnrichmentError> {
        let mut per_column: Vec<Vec<f64>> = vec![Vec::with_capacity(table.rows.len()); self.columns.len()];
        for row in &table.rows {
            let found = self.values.get(&row.location.country);
            for (idx, column) in per_column.iter_mut().enumerate() {
                column.push(found.map_or(f64::NAN, |values| values[idx]));
            }
        }
        for (name, values) in self.columns.iter().zip(per_column) {
            table = add_column(table, name, values)?;
        }
        Ok(table)
    }
}

/// `numerator / denominator`, e.g. population density from population and area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedRatio {
    pub column: String,
    pub numerator: String,
    pub denominator: String,
}

impl Enrichment for DerivedRatio {
    fn name(&self) -> &str {
        &self.column
    }

    fn apply(&self, table: ObservationTable) -> Result<ObservationTable, EnrichmentError> {
        let num = table
            .attribute_index(&self.numerator)
            .ok_or_else(|| EnrichmentError::MissingColumn(self.numerator.clone()))?;
        let den = table
            .attribute_index(&self.denominator)
            .ok_or_else(|| EnrichmentError::MissingColumn(self.denominator.clone()))?;

        let values = table
            .rows
            .iter()
            .map(|row| {
                let d = row.attributes[den];
                if d == 0.0 {
                    f64::NAN
                } else {
                    row.attributes[num] / d
                }
            })
            .collect();
        add_column(table, &self.column, values)
    }
}

/// Great-circle distance from each row to the outbreak origin province.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistanceToOrigin {
    pub origin_province: String,
}

impl Default for DistanceToOrigin {
    fn default() -> Self {
        Self {
            origin_province: "Hubei".to_string(),
        }
    }
}

impl Enrichment for DistanceToOrigin {
    fn name(&self) -> &str {
        DISTANCE_TO_ORIGIN_COLUMN
    }

    fn apply(&self, table: ObservationTable) -> Result<ObservationTable, EnrichmentError> {
        let origin = table
            .rows
            .iter()
            .filter(|row| row.location.province == self.origin_province)
            .find_map(|row| row.lat.zip(row.long))
            .ok_or_else(|| EnrichmentError::OriginNotFound(self.origin_province.clone()))?;

        let values = table
            .rows
            .iter()
            .map(|row| match row.lat.zip(row.long) {
                Some(coords) => haversine_km(coords, origin),
                None => f64::NAN,
            })
            .collect();
        add_column(table, DISTANCE_TO_ORIGIN_COLUMN, values)
    }
}

pub fn haversine_km(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

/// Calendar position plus days since each count threshold was first reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayFeatures {
    pub thresholds: Vec<u64>,
}

impl Default for DayFeatures {
    fn default() -> Self {
        Self {
            thresholds: vec![1, 10, 100],
        }
    }
}

pub fn days_since_column(field: Field, threshold: u64) -> String {
    format!("Days_since_{}={threshold}", field.as_str())
}

impl Enrichment for DayFeatures {
    fn name(&self) -> &str {
        "day_features"
    }

    fn apply(&self, table: ObservationTable) -> Result<ObservationTable, EnrichmentError> {
        let Some(first_date) = table.rows.iter().map(|row| row.date).min() else {
            return Ok(table);
        };

        let day: Vec<f64> = table
            .rows
            .iter()
            .map(|row| (row.date - first_date).num_days() as f64)
            .collect();
        let weekday: Vec<f64> = table
            .rows
            .iter()
            .map(|row| row.date.weekday().num_days_from_monday() as f64)
            .collect();

        let mut table = add_column(table, DAY_COLUMN, day)?;
        table = add_column(table, WEEKDAY_COLUMN, weekday)?;

        for field in Field::ALL {
            for threshold in &self.thresholds {
                let mut reached: HashMap<&LocationKey, NaiveDate> = HashMap::new();
                for row in &table.rows {
                    if row.cumulative.get(field).is_some_and(|v| v >= *threshold) {
                        reached
                            .entry(&row.location)
                            .and_modify(|date| *date = (*date).min(row.date))
                            .or_insert(row.date);
                    }
                }

                let values = table
                    .rows
                    .iter()
                    .map(|row| match reached.get(&row.location) {
                        None => f64::NAN,
                        Some(first) if row.date < *first => -1.0,
                        Some(first) => (row.date - *first).num_days() as f64,
                    })
                    .collect();
                table = add_column(table, &days_since_column(field, *threshold), values)?;
            }
        }

        Ok(table)
    }
}
