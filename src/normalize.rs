//! Cumulative-to-increment normalization per location.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::records::{Field, FieldPair, LocationKey, ObservationRow, ObservationTable};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("duplicate observation for {location} on {date}")]
    DuplicateDate {
        location: LocationKey,
        date: NaiveDate,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationGroup {
    pub location: LocationKey,
    /// Row positions in strictly increasing date order.
    pub rows: Vec<usize>,
}

/// Row positions grouped by location, built once per table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationIndex {
    groups: Vec<LocationGroup>,
}

impl LocationIndex {
    /// Groups in first-appearance order; rejects two rows for one location and date.
    pub fn build(rows: &[ObservationRow]) -> Result<Self, NormalizeError> {
        let mut positions: HashMap<&LocationKey, usize> = HashMap::new();
        let mut groups: Vec<LocationGroup> = Vec::new();

        for (idx, row) in rows.iter().enumerate() {
            let group_idx = *positions.entry(&row.location).or_insert_with(|| {
                groups.push(LocationGroup {
                    location: row.location.clone(),
                    rows: Vec::new(),
                });
                groups.len() - 1
            });
            groups[group_idx].rows.push(idx);
        }

        for group in &mut groups {
            group.rows.sort_by_key(|idx| rows[*idx].date);
            if let Some(pair) = group
                .rows
                .windows(2)
                .find(|pair| rows[pair[0]].date == rows[pair[1]].date)
            {
                return Err(NormalizeError::DuplicateDate {
                    location: group.location.clone(),
                    date: rows[pair[0]].date,
                });
            }
        }

        Ok(Self { groups })
    }

    pub fn groups(&self) -> &[LocationGroup] {
        &self.groups
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedSeries {
    pub location: LocationKey,
    /// Date-ordered rows of this location.
    pub rows: Vec<ObservationRow>,
    /// `ln(1 + increment)` aligned with `rows`; NaN where unobserved.
    pub log_new: FieldPair<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedLocation {
    pub location: LocationKey,
    pub field: Field,
    /// Date of the first negative increment.
    pub date: NaiveDate,
    pub increment: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedTable {
    pub attribute_columns: Vec<String>,
    pub series: Vec<NormalizedSeries>,
    pub rejected: Vec<RejectedLocation>,
}

/// Day-over-day deltas; the first element is the first cumulative value.
/// A missing operand yields a missing increment.
pub fn increments(values: &[Option<u64>]) -> Vec<Option<i64>> {
    let mut out = Vec::with_capacity(values.len());
    let mut prev: Option<Option<u64>> = None;
    for value in values {
        let increment = match (prev, value) {
            (None, Some(v)) => Some(*v as i64),
            (Some(Some(p)), Some(v)) => Some(*v as i64 - p as i64),
            _ => None,
        };
        out.push(increment);
        prev = Some(*value);
    }
    out
}

pub fn log_increments(increments: &[Option<i64>]) -> Vec<f64> {
    increments
        .iter()
        .map(|inc| inc.map_or(f64::NAN, |v| (v as f64).ln_1p()))
        .collect()
}

/// Converts every location's cumulative series into log-increments.
///
/// A location with any negative increment, in either field, is dropped whole
/// and reported in [`NormalizedTable::rejected`].
pub fn normalize_series(table: ObservationTable) -> Result<NormalizedTable, NormalizeError> {
    let index = LocationIndex::build(&table.rows)?;
    let mut slots: Vec<Option<ObservationRow>> = table.rows.into_iter().map(Some).collect();

    let mut series = Vec::with_capacity(index.groups().len());
    let mut rejected = Vec::new();

    'locations: for group in index.groups() {
        let rows: Vec<ObservationRow> = group
            .rows
            .iter()
            .filter_map(|idx| slots[*idx].take())
            .collect();

        let mut log_new = FieldPair::<Vec<f64>>::default();
        for field in Field::ALL {
            let values: Vec<Option<u64>> = rows.iter().map(|row| *row.cumulative.get(field)).collect();
            let deltas = increments(&values);

            if let Some((pos, increment)) = deltas
                .iter()
                .enumerate()
                .find_map(|(pos, inc)| inc.filter(|v| *v < 0).map(|v| (pos, v)))
            {
                warn!(
                    component = "normalize",
                    event = "normalize.location.rejected",
                    location = %group.location,
                    field = field.as_str(),
                    date = %rows[pos].date,
                    increment,
                    rows_dropped = rows.len()
                );
                rejected.push(RejectedLocation {
                    location: group.location.clone(),
                    field,
                    date: rows[pos].date,
                    increment,
                });
                continue 'locations;
            }

            *log_new.get_mut(field) = log_increments(&deltas);
        }

        series.push(NormalizedSeries {
            location: group.location.clone(),
            rows,
            log_new,
        });
    }

    info!(
        component = "normalize",
        event = "normalize.finish",
        locations_kept = series.len(),
        locations_rejected = rejected.len()
    );

    Ok(NormalizedTable {
        attribute_columns: table.attribute_columns,
        series,
        rejected,
    })
}
