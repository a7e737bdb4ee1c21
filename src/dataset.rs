//! CSV input of daily observations and CSV output of feature and forecast tables.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use csv::StringRecord;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::features::FeatureTable;
use crate::records::{
    Field, FieldPair, LocationKey, ObservationRow, ObservationTable, COUNTRY_COLUMN,
    PROVINCE_COLUMN,
};
use crate::rollout::ForecastTable;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{path} line {line}: invalid date '{value}', expected YYYY-MM-DD")]
    InvalidDate {
        path: PathBuf,
        line: u64,
        value: String,
    },
    #[error("{path} line {line}: invalid {field} count {value}")]
    InvalidCount {
        path: PathBuf,
        line: u64,
        field: Field,
        value: f64,
    },
}

#[derive(Debug, Deserialize)]
struct RawObservation {
    #[serde(rename = "Province/State", default)]
    province: Option<String>,
    #[serde(rename = "Country/Region")]
    country: String,
    #[serde(rename = "Lat", default)]
    lat: Option<f64>,
    #[serde(rename = "Long", default)]
    long: Option<f64>,
    #[serde(rename = "Date")]
    date: String,
    #[serde(rename = "ConfirmedCases", default)]
    confirmed_cases: Option<f64>,
    #[serde(rename = "Fatalities", default)]
    fatalities: Option<f64>,
}

/// Reads one observation CSV. A missing province becomes the empty string.
pub fn read_observations(path: &Path) -> Result<Vec<ObservationRow>, DatasetError> {
    let csv_err = |source| DatasetError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::Reader::from_path(path).map_err(csv_err)?;
    let headers = reader.headers().map_err(csv_err)?.clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        let line = record.position().map(|pos| pos.line()).unwrap_or_default();
        rows.push(parse_observation(path, line, &record, &headers)?);
    }

    Ok(rows)
}

fn parse_observation(
    path: &Path,
    line: u64,
    record: &StringRecord,
    headers: &StringRecord,
) -> Result<ObservationRow, DatasetError> {
    let raw: RawObservation = record
        .deserialize(Some(headers))
        .map_err(|source| DatasetError::Csv {
            path: path.to_path_buf(),
            source,
        })?;

    let date = NaiveDate::parse_from_str(raw.date.trim(), DATE_FORMAT).map_err(|_| {
        DatasetError::InvalidDate {
            path: path.to_path_buf(),
            line,
            value: raw.date.clone(),
        }
    })?;

    let count = |field: Field, value: Option<f64>| match value {
        None => Ok(None),
        Some(v) if v.is_finite() && v >= 0.0 && v.fract() == 0.0 => Ok(Some(v as u64)),
        Some(v) => Err(DatasetError::InvalidCount {
            path: path.to_path_buf(),
            line,
            field,
            value: v,
        }),
    };

    let cumulative = FieldPair::new(
        count(Field::ConfirmedCases, raw.confirmed_cases)?,
        count(Field::Fatalities, raw.fatalities)?,
    );

    let mut row = ObservationRow::new(
        LocationKey::new(raw.country, raw.province.unwrap_or_default()),
        date,
        cumulative,
    );
    row.lat = raw.lat;
    row.long = raw.long;
    Ok(row)
}

/// Merges the training file with the forecast-only file.
///
/// Test rows dated on or before the last training date are dropped; the union
/// is stably sorted by date.
pub fn load_observations(
    train_path: &Path,
    test_path: &Path,
) -> Result<ObservationTable, DatasetError> {
    let mut train = read_observations(train_path)?;
    let test = read_observations(test_path)?;
    let test_total = test.len();

    let last_train_date = train.iter().map(|row| row.date).max();
    let mut kept_test: Vec<ObservationRow> = test
        .into_iter()
        .filter(|row| last_train_date.map_or(true, |last| row.date > last))
        .collect();

    info!(
        component = "dataset",
        event = "dataset.load.finish",
        train_path = %train_path.display(),
        test_path = %test_path.display(),
        train_rows = train.len(),
        test_rows = kept_test.len(),
        test_rows_dropped = test_total - kept_test.len(),
        last_train_date = ?last_train_date
    );

    train.append(&mut kept_test);
    train.sort_by_key(|row| row.date);
    Ok(ObservationTable::from_rows(train))
}

/// Writes the feature table: identity columns, raw counts, targets, then the
/// model-facing columns in schema order.
pub fn write_feature_csv(path: &Path, table: &FeatureTable) -> Result<(), DatasetError> {
    let mut writer = open_writer(path)?;
    let schema = table.schema();

    let mut header = vec![
        COUNTRY_COLUMN.to_string(),
        PROVINCE_COLUMN.to_string(),
        "Date".to_string(),
    ];
    for field in Field::ALL {
        header.push(field.as_str().to_string());
    }
    for field in Field::ALL {
        header.push(field.log_new_column().to_string());
    }
    header.extend(
        schema
            .columns
            .iter()
            .skip(2)
            .map(|column| column.name.clone()),
    );
    write_record(&mut writer, path, &header)?;

    for (idx, row) in table.rows().iter().enumerate() {
        let mut record = vec![
            row.location.country.clone(),
            row.location.province.clone(),
            row.date.format(DATE_FORMAT).to_string(),
        ];
        for field in Field::ALL {
            record.push(row.cumulative.get(field).map(|v| v.to_string()).unwrap_or_default());
        }
        for field in Field::ALL {
            record.push(format_value(*row.log_new.get(field)));
        }
        let values = table.observed_input(idx);
        record.extend(values.iter().skip(2).map(|value| value.to_cell()));
        write_record(&mut writer, path, &record)?;
    }

    flush(writer, path)?;
    info!(
        component = "dataset",
        event = "dataset.features.written",
        path = %path.display(),
        rows = table.rows().len(),
        columns = header.len()
    );
    Ok(())
}

pub fn write_forecast_csv(path: &Path, forecast: &ForecastTable) -> Result<(), DatasetError> {
    let mut writer = open_writer(path)?;

    let mut header = vec![
        COUNTRY_COLUMN.to_string(),
        PROVINCE_COLUMN.to_string(),
        "Date".to_string(),
    ];
    for field in Field::ALL {
        header.push(field.predicted_log_new_column());
        header.push(field.predicted_column());
    }
    write_record(&mut writer, path, &header)?;

    for row in forecast.rows() {
        let mut record = vec![
            row.location.country.clone(),
            row.location.province.clone(),
            row.date.format(DATE_FORMAT).to_string(),
        ];
        for field in Field::ALL {
            record.push(format_value(*row.predicted_log_new.get(field)));
            record.push(row.predicted.get(field).to_string());
        }
        write_record(&mut writer, path, &record)?;
    }

    flush(writer, path)?;
    info!(
        component = "dataset",
        event = "dataset.forecast.written",
        path = %path.display(),
        rows = forecast.rows().len()
    );
    Ok(())
}

pub(crate) fn format_value(value: f64) -> String {
    if value.is_nan() {
        String::new()
    } else {
        value.to_string()
    }
}

fn open_writer(path: &Path) -> Result<csv::Writer<fs::File>, DatasetError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| DatasetError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    csv::Writer::from_path(path).map_err(|source| DatasetError::Csv {
        path: path.to_path_buf(),
        source,
    })
}

fn write_record(
    writer: &mut csv::Writer<fs::File>,
    path: &Path,
    record: &[String],
) -> Result<(), DatasetError> {
    writer
        .write_record(record)
        .map_err(|source| DatasetError::Csv {
            path: path.to_path_buf(),
            source,
        })
}

fn flush(mut writer: csv::Writer<fs::File>, path: &Path) -> Result<(), DatasetError> {
    writer.flush().map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })
}
