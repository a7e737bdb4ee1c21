//! casecast core crate.
//!
//! Current implemented scope:
//! - daily observation loading, location canonicalization and enrichment
//! - cumulative-to-increment normalization and lag feature building
//! - day-by-day autoregressive rollout over pluggable regressors

mod config;
mod dataset;
mod enrichment;
mod features;
mod model;
mod normalize;
mod observability;
mod pipeline;
mod records;
mod rollout;
mod split;

pub use config::{
    config_path, ConfigError, CountryTableConfig, DensityConfig, FeaturesConfig, ModelsConfig,
    PathsConfig, PipelineConfig, TestConfig, TrainConfig, CONFIG_ENV_VAR, DEFAULT_CONFIG_PATH,
};
pub use dataset::{
    load_observations, read_observations, write_feature_csv, write_forecast_csv, DatasetError,
};
pub use enrichment::{
    apply_enrichments, days_since_column, haversine_km, CountryAttributeJoin, DayFeatures,
    DerivedRatio, DistanceToOrigin, Enrichment, EnrichmentError, DAY_COLUMN,
    DISTANCE_TO_ORIGIN_COLUMN, WEEKDAY_COLUMN,
};
pub use features::{
    assert_schema_compatible, build_feature_schema, build_lag_features, lag_window, FeatureBatch,
    FeatureColumn, FeatureDType, FeatureError, FeatureRow, FeatureSchema, FeatureTable,
    FeatureValue, LagFeatureConfig, DEFAULT_LAG_WINDOW, FEATURE_SCHEMA_VERSION,
};
pub use model::{FieldModels, FnRegressor, LinearRegressor, ModelError, Regressor};
pub use normalize::{
    increments, log_increments, normalize_series, LocationGroup, LocationIndex, NormalizeError,
    NormalizedSeries, NormalizedTable, RejectedLocation,
};
pub use observability::{
    init_logging, log_app_failed, log_app_finish, log_app_start, logging_config_from_env,
    LogFormat, LoggingConfig, LoggingInitError,
};
pub use pipeline::{
    build_and_write_features, build_feature_table, enrichment_steps, forecast_path, load_models,
    run_forecast_pipeline, run_forecasts, ForecastRun, PipelineError, EVAL_FORECAST_FILE,
    TEST_FORECAST_FILE,
};
pub use records::{
    canonicalize_locations, Field, FieldPair, LocationKey, ObservationRow, ObservationTable,
    COUNTRY_COLUMN, PROVINCE_COLUMN,
};
pub use rollout::{
    increment_from_log, run_rollout, ForecastRow, ForecastState, ForecastTable, PredictionOverlay,
    Rollout, RolloutConfig, RolloutError,
};
pub use split::{training_matrix, DateSplit, SplitTables};
