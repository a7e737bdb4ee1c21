//! Pipeline configuration loaded from a JSON file.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::features::DEFAULT_LAG_WINDOW;
use crate::split::DateSplit;

pub const CONFIG_ENV_VAR: &str = "CASECAST_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub paths: PathsConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
    pub train: TrainConfig,
    pub test: TestConfig,
    pub models: ModelsConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathsConfig {
    pub train_csv: PathBuf,
    pub test_csv: PathBuf,
    #[serde(default = "default_features_csv")]
    pub features_csv: PathBuf,
    #[serde(default = "default_forecast_dir")]
    pub forecast_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_lag_window")]
    pub lag_window: usize,
    #[serde(default = "default_day_thresholds")]
    pub day_thresholds: Vec<u64>,
    /// `null` disables the distance feature.
    #[serde(default = "default_origin_province")]
    pub origin_province: Option<String>,
    #[serde(default)]
    pub country_tables: Vec<CountryTableConfig>,
    #[serde(default)]
    pub density: Option<DensityConfig>,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            lag_window: default_lag_window(),
            day_thresholds: default_day_thresholds(),
            origin_province: default_origin_province(),
            country_tables: Vec::new(),
            density: None,
        }
    }
}

/// One per-country reference CSV joined onto the observations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryTableConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub prefix: String,
    /// Reference country name to observation country name.
    #[serde(default)]
    pub remap: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DensityConfig {
    pub column: String,
    pub numerator: String,
    pub denominator: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub last_train_date: NaiveDate,
    pub last_eval_date: NaiveDate,
    #[serde(default)]
    pub cat_features: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestConfig {
    pub last_test_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub confirmed_cases: PathBuf,
    pub fatalities: PathBuf,
}

fn default_features_csv() -> PathBuf {
    PathBuf::from("data/features.csv")
}

fn default_forecast_dir() -> PathBuf {
    PathBuf::from("forecasts")
}

fn default_lag_window() -> usize {
    DEFAULT_LAG_WINDOW
}

fn default_day_thresholds() -> Vec<u64> {
    vec![1, 10, 100]
}

fn default_origin_province() -> Option<String> {
    Some("Hubei".to_string())
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("paths.train_csv", &self.paths.train_csv),
            ("paths.test_csv", &self.paths.test_csv),
            ("paths.features_csv", &self.paths.features_csv),
            ("paths.forecast_dir", &self.paths.forecast_dir),
            ("models.confirmed_cases", &self.models.confirmed_cases),
            ("models.fatalities", &self.models.fatalities),
        ];
        for (name, path) in required {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(format!("{name} must not be empty")));
            }
        }

        if self.train.last_train_date > self.train.last_eval_date {
            return Err(ConfigError::Invalid(format!(
                "train.last_train_date ({}) must not be after train.last_eval_date ({})",
                self.train.last_train_date, self.train.last_eval_date
            )));
        }
        if self.train.last_eval_date > self.test.last_test_date {
            return Err(ConfigError::Invalid(format!(
                "train.last_eval_date ({}) must not be after test.last_test_date ({})",
                self.train.last_eval_date, self.test.last_test_date
            )));
        }

        if let Some(origin) = &self.features.origin_province {
            if origin.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "features.origin_province must not be empty".to_string(),
                ));
            }
        }
        for table in &self.features.country_tables {
            if table.path.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(
                    "features.country_tables[].path must not be empty".to_string(),
                ));
            }
        }

        Ok(())
    }

    pub fn date_split(&self) -> DateSplit {
        DateSplit {
            last_train_date: self.train.last_train_date,
            last_eval_date: self.train.last_eval_date,
        }
    }
}

/// First CLI argument, else `CASECAST_CONFIG`, else `config/config.json`.
pub fn config_path(mut args: impl Iterator<Item = String>) -> PathBuf {
    if let Some(arg) = args.next().filter(|arg| !arg.trim().is_empty()) {
        return PathBuf::from(arg);
    }
    match env::var(CONFIG_ENV_VAR) {
        Ok(raw) if !raw.trim().is_empty() => PathBuf::from(raw.trim()),
        _ => PathBuf::from(DEFAULT_CONFIG_PATH),
    }
}
