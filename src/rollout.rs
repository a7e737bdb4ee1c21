//! Day-by-day autoregressive rollout over a feature table.
//!
//! Each day's rows are predicted from their lag columns, predicted
//! log-increments are turned back into cumulative counts against the
//! per-location [`ForecastState`], and, when feature propagation is enabled,
//! written into the lag cells of later rows through a [`PredictionOverlay`].
//! The feature table itself is never mutated.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::features::{FeatureBatch, FeatureRow, FeatureTable};
use crate::model::{FieldModels, ModelError, Regressor};
use crate::records::{Field, FieldPair, LocationKey};

const MAX_LISTED_LOCATIONS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutConfig {
    pub first_date: NaiveDate,
    pub last_date: NaiveDate,
    /// Write each day's predictions into later rows' lag cells.
    pub update_features_data: bool,
}

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("invalid rollout range: first_date {first_date} is after last_date {last_date}")]
    InvalidRange {
        first_date: NaiveDate,
        last_date: NaiveDate,
    },
    #[error("no baseline cumulative count on {date} for {}", format_locations(.locations))]
    MissingBaseline {
        date: NaiveDate,
        locations: Vec<LocationKey>,
    },
    #[error("{field} model failed on {date} for {}: {source}", format_locations(.locations))]
    Model {
        date: NaiveDate,
        field: Field,
        locations: Vec<LocationKey>,
        #[source]
        source: ModelError,
    },
}

fn format_locations(locations: &[LocationKey]) -> String {
    let mut listed: Vec<String> = locations
        .iter()
        .take(MAX_LISTED_LOCATIONS)
        .map(ToString::to_string)
        .collect();
    if locations.len() > MAX_LISTED_LOCATIONS {
        listed.push(format!("and {} more", locations.len() - MAX_LISTED_LOCATIONS));
    }
    format!("[{}]", listed.join(", "))
}

/// Latest known-or-predicted cumulative counts per location.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForecastState {
    latest: HashMap<LocationKey, FieldPair<u64>>,
}

impl ForecastState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ground-truth counts of every location's row on the day before `first_date`.
    pub fn seed_from(table: &FeatureTable, first_date: NaiveDate) -> Self {
        let mut state = Self::new();
        let Some(seed_date) = first_date.pred_opt() else {
            return state;
        };
        for row in table.rows().iter().filter(|row| row.date == seed_date) {
            if let (Some(cases), Some(fatalities)) =
                (row.cumulative.confirmed_cases, row.cumulative.fatalities)
            {
                state.insert(row.location.clone(), FieldPair::new(cases, fatalities));
            }
        }
        state
    }

    pub fn insert(&mut self, location: LocationKey, cumulative: FieldPair<u64>) {
        self.latest.insert(location, cumulative);
    }

    pub fn get(&self, location: &LocationKey) -> Option<&FieldPair<u64>> {
        self.latest.get(location)
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

/// Predicted lag cells keyed by (location, date, field, offset), read before
/// the observed lags of the feature table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredictionOverlay {
    cells: HashMap<LocationKey, HashMap<(NaiveDate, Field, usize), f64>>,
}

impl PredictionOverlay {
    pub fn write(
        &mut self,
        location: &LocationKey,
        date: NaiveDate,
        field: Field,
        offset: usize,
        value: f64,
    ) {
        let cells = match self.cells.get_mut(location) {
            Some(cells) => cells,
            None => self.cells.entry(location.clone()).or_default(),
        };
        cells.insert((date, field, offset), value);
    }

    pub fn get(
        &self,
        location: &LocationKey,
        date: NaiveDate,
        field: Field,
        offset: usize,
    ) -> Option<f64> {
        self.cells.get(location)?.get(&(date, field, offset)).copied()
    }

    /// Overlay value if one was written, otherwise the observed lag.
    pub fn resolve(&self, row: &FeatureRow, field: Field, offset: usize) -> f64 {
        self.get(&row.location, row.date, field, offset)
            .unwrap_or_else(|| row.lag(field, offset))
    }

    pub fn len(&self) -> usize {
        self.cells.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRow {
    pub location: LocationKey,
    pub date: NaiveDate,
    /// Clamped model output, `>= 0`.
    pub predicted_log_new: FieldPair<f64>,
    pub predicted: FieldPair<u64>,
    /// Ground truth when the row carries it.
    pub actual: FieldPair<Option<u64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForecastTable {
    rows: Vec<ForecastRow>,
}

impl ForecastTable {
    pub fn rows(&self) -> &[ForecastRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Root mean squared log error of cumulative predictions against the rows
    /// carrying ground truth; NaN when none do.
    pub fn rmsle(&self, field: Field) -> f64 {
        let errors: Vec<f64> = self
            .rows
            .iter()
            .filter_map(|row| {
                row.actual.get(field).map(|actual| {
                    let predicted = *row.predicted.get(field) as f64;
                    (predicted.ln_1p() - (actual as f64).ln_1p()).powi(2)
                })
            })
            .collect();
        if errors.is_empty() {
            return f64::NAN;
        }
        (errors.iter().sum::<f64>() / errors.len() as f64).sqrt()
    }
}

/// A rollout in progress. Days already completed stay available through
/// [`Rollout::completed`] even if a later day fails.
pub struct Rollout<'a> {
    table: &'a FeatureTable,
    models: &'a FieldModels,
    cfg: RolloutConfig,
    pending: BTreeMap<NaiveDate, Vec<usize>>,
    next_date: Option<NaiveDate>,
    state: ForecastState,
    overlay: PredictionOverlay,
    completed: Vec<ForecastRow>,
}

impl<'a> Rollout<'a> {
    pub fn new(
        table: &'a FeatureTable,
        models: &'a FieldModels,
        seed: ForecastState,
        cfg: RolloutConfig,
    ) -> Result<Self, RolloutError> {
        if cfg.first_date > cfg.last_date {
            return Err(RolloutError::InvalidRange {
                first_date: cfg.first_date,
                last_date: cfg.last_date,
            });
        }

        let mut pending: BTreeMap<NaiveDate, Vec<usize>> = BTreeMap::new();
        for (idx, row) in table.rows().iter().enumerate() {
            if row.date >= cfg.first_date && row.date <= cfg.last_date {
                pending.entry(row.date).or_default().push(idx);
            }
        }

        info!(
            component = "rollout",
            event = "rollout.start",
            first_date = %cfg.first_date,
            last_date = %cfg.last_date,
            update_features_data = cfg.update_features_data,
            seeded_locations = seed.len(),
            days_with_rows = pending.len(),
            rows_in_range = pending.values().map(Vec::len).sum::<usize>()
        );

        Ok(Self {
            table,
            models,
            cfg,
            pending,
            next_date: Some(cfg.first_date),
            state: seed,
            overlay: PredictionOverlay::default(),
            completed: Vec::new(),
        })
    }

    /// Processes the next calendar day. Returns the day processed, or `None`
    /// once `last_date` is done.
    pub fn step(&mut self) -> Result<Option<NaiveDate>, RolloutError> {
        let Some(date) = self.next_date else {
            return Ok(None);
        };

        let Some(indices) = self.pending.remove(&date) else {
            debug!(component = "rollout", event = "rollout.day.empty", date = %date);
            self.next_date = date.succ_opt().filter(|next| *next <= self.cfg.last_date);
            return Ok(Some(date));
        };
        let table = self.table;
        let models = self.models;
        let rows = table.rows();

        let mut baselines = Vec::with_capacity(indices.len());
        let mut missing = Vec::new();
        for idx in &indices {
            match self.state.get(&rows[*idx].location) {
                Some(prev) => baselines.push(*prev),
                None => missing.push(rows[*idx].location.clone()),
            }
        }
        if !missing.is_empty() {
            self.pending.insert(date, indices);
            return Err(RolloutError::MissingBaseline {
                date,
                locations: missing,
            });
        }

        let overlay = &self.overlay;
        let batch = FeatureBatch {
            schema: table.schema(),
            rows: indices
                .iter()
                .map(|idx| {
                    table.model_input(*idx, |row, field, offset| overlay.resolve(row, field, offset))
                })
                .collect(),
        };

        let (cases, fatalities) = rayon::join(
            || predict_field(models.confirmed_cases.as_ref(), &batch),
            || predict_field(models.fatalities.as_ref(), &batch),
        );
        let predicted_log_new = match (cases, fatalities) {
            (Ok(cases), Ok(fatalities)) => FieldPair::new(cases, fatalities),
            (Err(source), _) => {
                return Err(self.fail_day(date, indices, Field::ConfirmedCases, source));
            }
            (_, Err(source)) => {
                return Err(self.fail_day(date, indices, Field::Fatalities, source));
            }
        };

        for (pos, (idx, prev)) in indices.iter().zip(&baselines).enumerate() {
            let row = &rows[*idx];
            let log_new = FieldPair::from_fn(|field| predicted_log_new.get(field)[pos]);
            let predicted = FieldPair::from_fn(|field| {
                prev.get(field)
                    .saturating_add(increment_from_log(*log_new.get(field)))
            });

            self.state.insert(row.location.clone(), predicted);
            self.completed.push(ForecastRow {
                location: row.location.clone(),
                date,
                predicted_log_new: log_new,
                predicted,
                actual: row.cumulative,
            });
        }

        let propagated = if self.cfg.update_features_data {
            self.propagate(date, &indices, &predicted_log_new)
        } else {
            0
        };

        info!(
            component = "rollout",
            event = "rollout.day.finish",
            date = %date,
            rows = indices.len(),
            propagated_cells = propagated
        );

        self.next_date = date.succ_opt().filter(|next| *next <= self.cfg.last_date);
        Ok(Some(date))
    }

    /// Puts the day's rows back so a later `step` retries the same day.
    fn fail_day(
        &mut self,
        date: NaiveDate,
        indices: Vec<usize>,
        field: Field,
        source: ModelError,
    ) -> RolloutError {
        let rows = self.table.rows();
        let locations = indices.iter().map(|idx| rows[*idx].location.clone()).collect();
        self.pending.insert(date, indices);
        RolloutError::Model {
            date,
            field,
            locations,
            source,
        }
    }

    /// Writes `date`'s predictions into the lag cell at offset `(later - date)`
    /// of every later row of the same location.
    fn propagate(
        &mut self,
        date: NaiveDate,
        indices: &[usize],
        predicted_log_new: &FieldPair<Vec<f64>>,
    ) -> usize {
        let table = self.table;
        let rows = table.rows();
        let positions: HashMap<&LocationKey, usize> = indices
            .iter()
            .enumerate()
            .map(|(pos, idx)| (&rows[*idx].location, pos))
            .collect();

        let mut written = 0;
        for (later, later_rows) in &self.pending {
            let offset = (*later - date).num_days() as usize;
            if offset > table.window() {
                break;
            }
            for idx in later_rows {
                let location = &rows[*idx].location;
                let Some(pos) = positions.get(location) else {
                    continue;
                };
                for field in Field::ALL {
                    self.overlay
                        .write(location, *later, field, offset, predicted_log_new.get(field)[*pos]);
                    written += 1;
                }
            }
        }
        written
    }

    pub fn completed(&self) -> &[ForecastRow] {
        &self.completed
    }

    pub fn state(&self) -> &ForecastState {
        &self.state
    }

    pub fn overlay(&self) -> &PredictionOverlay {
        &self.overlay
    }

    pub fn into_forecast(self) -> ForecastTable {
        info!(
            component = "rollout",
            event = "rollout.finish",
            rows = self.completed.len(),
            overlay_cells = self.overlay.len()
        );
        ForecastTable {
            rows: self.completed,
        }
    }
}

/// Runs every day of `cfg`'s range in order.
pub fn run_rollout(
    table: &FeatureTable,
    models: &FieldModels,
    seed: ForecastState,
    cfg: RolloutConfig,
) -> Result<ForecastTable, RolloutError> {
    let mut rollout = Rollout::new(table, models, seed, cfg)?;
    while rollout.step()?.is_some() {}
    Ok(rollout.into_forecast())
}

/// `round(expm1(log_new))` as a whole count.
pub fn increment_from_log(log_new: f64) -> u64 {
    log_new.exp_m1().round().max(0.0) as u64
}

fn predict_field(model: &dyn Regressor, batch: &FeatureBatch<'_>) -> Result<Vec<f64>, ModelError> {
    let predictions = model.predict(batch)?;
    if predictions.len() != batch.len() {
        return Err(ModelError::OutputLength {
            model: model.name().to_string(),
            expected: batch.len(),
            actual: predictions.len(),
        });
    }
    if let Some((row, value)) = predictions
        .iter()
        .enumerate()
        .find(|(_, value)| !value.is_finite())
    {
        return Err(ModelError::NonFinite {
            model: model.name().to_string(),
            row,
            value: *value,
        });
    }
    Ok(predictions.into_iter().map(|value| value.max(0.0)).collect())
}
