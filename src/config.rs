//! Add-on options and validated engine configuration

use crate::anomaly::{AnomalyParams, DEFAULT_CONTAMINATION, DEFAULT_SEED, DEFAULT_TREES};
use crate::error::EngineError;
use crate::features::FeatureSchema;
use crate::forecast::{ForecastParams, DEFAULT_HORIZON};
use crate::history::DEFAULT_CAPACITY;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Options file written by the add-on supervisor
pub const DEFAULT_OPTIONS_PATH: &str = "/data/options.json";
/// Durable history log location
pub const DEFAULT_HISTORY_PATH: &str = "/data/health_history.csv";
pub const DEFAULT_MQTT_HOST: &str = "core-mosquitto";
/// Standard unsecured broker port
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// What a running instance computes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    /// Isolation-forest flag over a bounded window
    Anomaly,
    /// Weight forecast from day-over-day deltas on a rolling window
    ForecastDelta,
    /// Weight forecast from absolute values over the whole log
    ForecastAbsolute,
}

impl EngineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineMode::Anomaly => "anomaly",
            EngineMode::ForecastDelta => "forecast_delta",
            EngineMode::ForecastAbsolute => "forecast_absolute",
        }
    }

    pub fn schema(&self) -> FeatureSchema {
        match self {
            EngineMode::Anomaly => FeatureSchema::Anomaly,
            EngineMode::ForecastDelta => FeatureSchema::Deltas,
            EngineMode::ForecastAbsolute => FeatureSchema::Absolute,
        }
    }

    pub fn is_forecast(&self) -> bool {
        !matches!(self, EngineMode::Anomaly)
    }
}

impl fmt::Display for EngineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anomaly" => Ok(EngineMode::Anomaly),
            "forecast_delta" => Ok(EngineMode::ForecastDelta),
            "forecast_absolute" => Ok(EngineMode::ForecastAbsolute),
            other => Err(EngineError::Config(format!("unknown mode '{other}'"))),
        }
    }
}

/// Raw options as read from the options file. Every key is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub mode: EngineMode,
    pub history_path: PathBuf,
    pub anomaly_capacity: usize,
    pub contamination: f64,
    pub seed: u64,
    pub trees: usize,
    /// Rolling training window; mode default when absent
    pub forecast_window: Option<usize>,
    /// Minimum history before a forecast; mode default when absent
    pub min_samples: Option<usize>,
    pub horizon_days: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            mqtt_host: DEFAULT_MQTT_HOST.to_string(),
            mqtt_port: DEFAULT_MQTT_PORT,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            mode: EngineMode::Anomaly,
            history_path: PathBuf::from(DEFAULT_HISTORY_PATH),
            anomaly_capacity: DEFAULT_CAPACITY,
            contamination: DEFAULT_CONTAMINATION,
            seed: DEFAULT_SEED,
            trees: DEFAULT_TREES,
            forecast_window: None,
            min_samples: None,
            horizon_days: DEFAULT_HORIZON,
        }
    }
}

impl Options {
    /// Load options from a JSON file
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let content = fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        serde_json::from_str(json).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Broker credentials; empty user means anonymous
    pub fn credentials(&self) -> Option<(&str, &str)> {
        if self.mqtt_user.is_empty() {
            None
        } else {
            Some((self.mqtt_user.as_str(), self.mqtt_pass.as_str()))
        }
    }

    /// Validate into an engine configuration
    pub fn engine_config(&self) -> Result<EngineConfig, EngineError> {
        if self.anomaly_capacity < 2 {
            return Err(EngineError::Config(
                "anomaly_capacity must be at least 2".to_string(),
            ));
        }
        if !(self.contamination > 0.0 && self.contamination <= 0.5) {
            return Err(EngineError::Config(
                "contamination must be in (0, 0.5]".to_string(),
            ));
        }
        if self.trees == 0 {
            return Err(EngineError::Config("trees must be at least 1".to_string()));
        }
        if self.horizon_days == 0 {
            return Err(EngineError::Config(
                "horizon_days must be at least 1".to_string(),
            ));
        }

        let mut forecast = EngineConfig::in_memory(self.mode).forecast;
        if let Some(window) = self.forecast_window {
            if window < 2 {
                return Err(EngineError::Config(
                    "forecast_window must be at least 2".to_string(),
                ));
            }
            forecast.window = Some(window);
        }
        if let Some(min_samples) = self.min_samples {
            if min_samples < 2 {
                return Err(EngineError::Config(
                    "min_samples must be at least 2".to_string(),
                ));
            }
            forecast.min_samples = min_samples;
        }
        forecast.horizon = self.horizon_days;

        Ok(EngineConfig {
            mode: self.mode,
            history_path: self
                .mode
                .is_forecast()
                .then(|| self.history_path.clone()),
            capacity: self.anomaly_capacity,
            anomaly: AnomalyParams {
                trees: self.trees,
                contamination: self.contamination,
                seed: self.seed,
            },
            forecast,
        })
    }
}

/// Validated settings for one engine instance
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub mode: EngineMode,
    /// Durable log for forecast modes; `None` keeps history in memory only
    pub history_path: Option<PathBuf>,
    /// Bounded window size for anomaly mode
    pub capacity: usize,
    pub anomaly: AnomalyParams,
    pub forecast: ForecastParams,
}

impl EngineConfig {
    /// Defaults for a mode with in-memory history
    pub fn in_memory(mode: EngineMode) -> Self {
        Self {
            mode,
            history_path: None,
            capacity: DEFAULT_CAPACITY,
            anomaly: AnomalyParams::default(),
            forecast: match mode {
                EngineMode::ForecastAbsolute => ForecastParams::absolute(),
                _ => ForecastParams::deltas(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_from_empty_options() {
        let options = Options::from_json("{}").unwrap();
        assert_eq!(options.mqtt_host, "core-mosquitto");
        assert_eq!(options.mqtt_port, 1883);
        assert_eq!(options.credentials(), None);

        let config = options.engine_config().unwrap();
        assert_eq!(config.mode, EngineMode::Anomaly);
        assert_eq!(config.capacity, 50);
        assert_eq!(config.anomaly, AnomalyParams::default());
        assert_eq!(config.history_path, None);
    }

    #[test]
    fn test_forecast_mode_defaults() {
        let options =
            Options::from_json(r#"{"mode": "forecast_absolute", "mqtt_user": "ha", "mqtt_pass": "pw"}"#)
                .unwrap();
        assert_eq!(options.credentials(), Some(("ha", "pw")));

        let config = options.engine_config().unwrap();
        assert_eq!(config.forecast, ForecastParams::absolute());
        assert_eq!(config.history_path, Some(PathBuf::from(DEFAULT_HISTORY_PATH)));

        let config = Options::from_json(r#"{"mode": "forecast_delta", "min_samples": 7}"#)
            .unwrap()
            .engine_config()
            .unwrap();
        assert_eq!(config.forecast.min_samples, 7);
        assert_eq!(config.forecast.window, Some(14));
    }

    #[test]
    fn test_invalid_options_rejected() {
        for json in [
            r#"{"anomaly_capacity": 1}"#,
            r#"{"contamination": 0.0}"#,
            r#"{"contamination": 0.7}"#,
            r#"{"trees": 0}"#,
            r#"{"min_samples": 1}"#,
            r#"{"forecast_window": 1}"#,
            r#"{"horizon_days": 0}"#,
        ] {
            let options = Options::from_json(json).unwrap();
            assert!(
                matches!(options.engine_config(), Err(EngineError::Config(_))),
                "{json} should be rejected"
            );
        }
        assert!(Options::from_json(r#"{"mode": "sideways"}"#).is_err());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("forecast_delta".parse::<EngineMode>().unwrap(), EngineMode::ForecastDelta);
        assert!("nope".parse::<EngineMode>().is_err());
        assert_eq!(EngineMode::ForecastAbsolute.schema(), FeatureSchema::Absolute);
    }
}
