//! End-to-end wiring: observations to features, features to forecasts.

use std::path::PathBuf;

use chrono::NaiveDate;
use thiserror::Error;
use tracing::info;

use crate::config::{ConfigError, FeaturesConfig, ModelsConfig, PipelineConfig};
use crate::dataset::{load_observations, write_feature_csv, write_forecast_csv, DatasetError};
use crate::enrichment::{
    apply_enrichments, CountryAttributeJoin, DayFeatures, DerivedRatio, DistanceToOrigin,
    Enrichment, EnrichmentError,
};
use crate::features::{build_lag_features, FeatureError, FeatureTable, LagFeatureConfig};
use crate::model::{FieldModels, LinearRegressor, ModelError};
use crate::normalize::{normalize_series, NormalizeError};
use crate::records::{canonicalize_locations, Field, FieldPair};
use crate::rollout::{run_rollout, ForecastState, ForecastTable, RolloutConfig, RolloutError};

pub const EVAL_FORECAST_FILE: &str = "eval_forecast.csv";
pub const TEST_FORECAST_FILE: &str = "test_forecast.csv";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Enrichment(#[from] EnrichmentError),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Rollout(#[from] RolloutError),
}

/// Enrichment steps in application order: country tables, density, distance
/// to origin, then day features.
pub fn enrichment_steps(
    features: &FeaturesConfig,
) -> Result<Vec<Box<dyn Enrichment>>, EnrichmentError> {
    let mut steps: Vec<Box<dyn Enrichment>> = Vec::new();
    for table in &features.country_tables {
        let join = CountryAttributeJoin::from_csv(&table.path, &table.remap)?;
        steps.push(Box::new(join.with_prefix(&table.prefix)));
    }
    if let Some(density) = &features.density {
        steps.push(Box::new(DerivedRatio {
            column: density.column.clone(),
            numerator: density.numerator.clone(),
            denominator: density.denominator.clone(),
        }));
    }
    if let Some(origin) = &features.origin_province {
        steps.push(Box::new(DistanceToOrigin {
            origin_province: origin.clone(),
        }));
    }
    steps.push(Box::new(DayFeatures {
        thresholds: features.day_thresholds.clone(),
    }));
    Ok(steps)
}

/// Load, canonicalize, enrich, normalize and build lag features.
pub fn build_feature_table(cfg: &PipelineConfig) -> Result<FeatureTable, PipelineError> {
    let observations = load_observations(&cfg.paths.train_csv, &cfg.paths.test_csv)?;
    let observations = canonicalize_locations(observations);
    let steps = enrichment_steps(&cfg.features)?;
    let enriched = apply_enrichments(observations, &steps)?;
    let normalized = normalize_series(enriched)?;

    let lag_cfg = LagFeatureConfig {
        window: cfg.features.lag_window,
        cat_features: cfg.train.cat_features.clone(),
        ..LagFeatureConfig::default()
    };
    let table = build_lag_features(&normalized, &lag_cfg)?;

    info!(
        component = "pipeline",
        event = "pipeline.features.ready",
        rows = table.len(),
        columns = table.schema().columns.len(),
        locations_rejected = normalized.rejected.len(),
        fingerprint = %table.schema().fingerprint
    );
    Ok(table)
}

/// Builds the feature table and writes it to `paths.features_csv`.
pub fn build_and_write_features(cfg: &PipelineConfig) -> Result<FeatureTable, PipelineError> {
    let table = build_feature_table(cfg)?;
    write_feature_csv(&cfg.paths.features_csv, &table)?;
    Ok(table)
}

/// Loads both field models and checks them against `table`'s schema.
pub fn load_models(cfg: &ModelsConfig, table: &FeatureTable) -> Result<FieldModels, ModelError> {
    let confirmed_cases = LinearRegressor::load(&cfg.confirmed_cases)?;
    confirmed_cases.check_schema(table.schema())?;
    let fatalities = LinearRegressor::load(&cfg.fatalities)?;
    fatalities.check_schema(table.schema())?;
    Ok(FieldPair::new(Box::new(confirmed_cases), Box::new(fatalities)))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForecastRun {
    pub eval: ForecastTable,
    pub test: ForecastTable,
    pub eval_rmsle: FieldPair<f64>,
}

/// Evaluation rollout over `(last_train, last_eval]` against observed lags,
/// then the propagating test rollout over `(last_eval, last_test]`.
pub fn run_forecasts(
    cfg: &PipelineConfig,
    table: &FeatureTable,
    models: &FieldModels,
) -> Result<ForecastRun, PipelineError> {
    let split = cfg.date_split();
    let eval = rollout_after(
        table,
        models,
        split.last_train_date,
        split.last_eval_date,
        false,
    )?;
    let eval_rmsle = FieldPair::from_fn(|field: Field| eval.rmsle(field));
    info!(
        component = "pipeline",
        event = "pipeline.eval.scored",
        rows = eval.len(),
        rmsle_confirmed_cases = eval_rmsle.confirmed_cases,
        rmsle_fatalities = eval_rmsle.fatalities
    );

    let test = rollout_after(
        table,
        models,
        split.last_eval_date,
        cfg.test.last_test_date,
        true,
    )?;

    Ok(ForecastRun {
        eval,
        test,
        eval_rmsle,
    })
}

fn rollout_after(
    table: &FeatureTable,
    models: &FieldModels,
    last_known: NaiveDate,
    last_date: NaiveDate,
    update_features_data: bool,
) -> Result<ForecastTable, PipelineError> {
    let first_date = last_known.succ_opt().ok_or_else(|| {
        ConfigError::Invalid(format!("no calendar day follows {last_known}"))
    })?;
    let seed = ForecastState::seed_from(table, first_date);
    let cfg = RolloutConfig {
        first_date,
        last_date,
        update_features_data,
    };
    Ok(run_rollout(table, models, seed, cfg)?)
}

/// Full forecast run: features, models, both rollouts, both CSVs.
pub fn run_forecast_pipeline(cfg: &PipelineConfig) -> Result<ForecastRun, PipelineError> {
    let table = build_feature_table(cfg)?;
    let models = load_models(&cfg.models, &table)?;
    let run = run_forecasts(cfg, &table, &models)?;

    write_forecast_csv(&forecast_path(cfg, EVAL_FORECAST_FILE), &run.eval)?;
    write_forecast_csv(&forecast_path(cfg, TEST_FORECAST_FILE), &run.test)?;
    Ok(run)
}

pub fn forecast_path(cfg: &PipelineConfig, file: &str) -> PathBuf {
    cfg.paths.forecast_dir.join(file)
}
