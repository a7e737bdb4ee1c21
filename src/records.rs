//! Location identity, per-field pairs and raw observation rows.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const COUNTRY_COLUMN: &str = "Country/Region";
pub const PROVINCE_COLUMN: &str = "Province/State";

const CRUISE_SHIP_PROVINCES: [&str; 2] = ["From Diamond Princess", "Grand Princess"];

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocationKey {
    pub country: String,
    pub province: String,
}

impl LocationKey {
    pub fn new(country: impl Into<String>, province: impl Into<String>) -> Self {
        Self {
            country: country.into(),
            province: province.into(),
        }
    }
}

impl fmt::Display for LocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.province.is_empty() {
            write!(f, "{}", self.country)
        } else {
            write!(f, "{}/{}", self.country, self.province)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Field {
    ConfirmedCases,
    Fatalities,
}

impl Field {
    pub const ALL: [Field; 2] = [Field::ConfirmedCases, Field::Fatalities];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfirmedCases => "ConfirmedCases",
            Self::Fatalities => "Fatalities",
        }
    }

    /// Target column holding `ln(1 + increment)`.
    pub fn log_new_column(self) -> &'static str {
        match self {
            Self::ConfirmedCases => "LogNewConfirmedCases",
            Self::Fatalities => "LogNewFatalities",
        }
    }

    pub fn lag_column(self, offset: usize) -> String {
        format!("{}_prev_day_{offset}", self.log_new_column())
    }

    pub fn predicted_column(self) -> String {
        format!("Predicted{}", self.as_str())
    }

    pub fn predicted_log_new_column(self) -> String {
        format!("Predicted{}", self.log_new_column())
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One value per forecast field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldPair<T> {
    pub confirmed_cases: T,
    pub fatalities: T,
}

impl<T> FieldPair<T> {
    pub fn new(confirmed_cases: T, fatalities: T) -> Self {
        Self {
            confirmed_cases,
            fatalities,
        }
    }

    pub fn from_fn(mut f: impl FnMut(Field) -> T) -> Self {
        Self {
            confirmed_cases: f(Field::ConfirmedCases),
            fatalities: f(Field::Fatalities),
        }
    }

    pub fn get(&self, field: Field) -> &T {
        match field {
            Field::ConfirmedCases => &self.confirmed_cases,
            Field::Fatalities => &self.fatalities,
        }
    }

    pub fn get_mut(&mut self, field: Field) -> &mut T {
        match field {
            Field::ConfirmedCases => &mut self.confirmed_cases,
            Field::Fatalities => &mut self.fatalities,
        }
    }

    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> FieldPair<U> {
        FieldPair {
            confirmed_cases: f(self.confirmed_cases),
            fatalities: f(self.fatalities),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRow {
    pub location: LocationKey,
    pub date: NaiveDate,
    /// Cumulative counts; `None` for rows that only exist to be forecast.
    pub cumulative: FieldPair<Option<u64>>,
    pub lat: Option<f64>,
    pub long: Option<f64>,
    /// Aligned with [`ObservationTable::attribute_columns`]; NaN when missing.
    pub attributes: Vec<f64>,
}

impl ObservationRow {
    pub fn new(location: LocationKey, date: NaiveDate, cumulative: FieldPair<Option<u64>>) -> Self {
        Self {
            location,
            date,
            cumulative,
            lat: None,
            long: None,
            attributes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservationTable {
    pub attribute_columns: Vec<String>,
    pub rows: Vec<ObservationRow>,
}

impl ObservationTable {
    pub fn from_rows(rows: Vec<ObservationRow>) -> Self {
        Self {
            attribute_columns: Vec::new(),
            rows,
        }
    }

    pub fn attribute_index(&self, name: &str) -> Option<usize> {
        self.attribute_columns.iter().position(|column| column == name)
    }
}

/// Cruise ship rows arrive with country and province reversed; swap them back.
pub fn canonicalize_locations(mut table: ObservationTable) -> ObservationTable {
    for row in &mut table.rows {
        if CRUISE_SHIP_PROVINCES.contains(&row.location.province.as_str()) {
            let key = &mut row.location;
            std::mem::swap(&mut key.country, &mut key.province);
        }
    }
    table
}
