//! Core types for the health ML engine
//!
//! This module defines the data that flows through one engine cycle: the
//! recognized metrics, stored observations, derived delta records, feature
//! vectors and the result messages published back onto the channel.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

/// Topic the engine subscribes to
pub const INPUT_TOPIC: &str = "health/ml/input";
/// Anomaly flag for the latest reading
pub const ANOMALY_TOPIC: &str = "health/ml/anomaly";
/// Projected weight at the end of the horizon
pub const FORECAST_TOPIC: &str = "health/ml/weight_30d_forecast";
/// Heuristic risk classification of the forecast
pub const PROBABILITY_TOPIC: &str = "health/ml/metabolic_probability";
/// Data-sufficiency proxy for the forecast
pub const CONFIDENCE_TOPIC: &str = "health/ml/confidence";
/// Forecast model status
pub const STATUS_TOPIC: &str = "health/ml/model_status";

/// Recognized health metrics (the superset any message may carry)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Weight,
    Recovery,
    Sleep,
    Calories,
    Hrv,
    Cardio,
    Systolic,
    HeartRate,
}

impl Metric {
    pub const ALL: [Metric; 8] = [
        Metric::Weight,
        Metric::Recovery,
        Metric::Sleep,
        Metric::Calories,
        Metric::Hrv,
        Metric::Cardio,
        Metric::Systolic,
        Metric::HeartRate,
    ];

    /// Key used in inbound messages and log headers
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Weight => "weight",
            Metric::Recovery => "recovery",
            Metric::Sleep => "sleep",
            Metric::Calories => "calories",
            Metric::Hrv => "hrv",
            Metric::Cardio => "cardio",
            Metric::Systolic => "systolic",
            Metric::HeartRate => "heart_rate",
        }
    }

    pub fn from_key(key: &str) -> Option<Metric> {
        Metric::ALL.iter().copied().find(|m| m.as_str() == key)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One arrival's decoded set of health metrics.
///
/// Absent metrics are stored as 0.0. Observations are immutable once stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Arrival day label (YYYY-MM-DD, UTC). Informational only, never a key.
    pub day: String,
    pub weight: f64,
    pub recovery: f64,
    pub sleep: f64,
    pub calories: f64,
    pub hrv: f64,
    pub cardio: f64,
    pub systolic: f64,
    pub heart_rate: f64,
}

impl Observation {
    pub fn get(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Weight => self.weight,
            Metric::Recovery => self.recovery,
            Metric::Sleep => self.sleep,
            Metric::Calories => self.calories,
            Metric::Hrv => self.hrv,
            Metric::Cardio => self.cardio,
            Metric::Systolic => self.systolic,
            Metric::HeartRate => self.heart_rate,
        }
    }

    pub fn set(&mut self, metric: Metric, value: f64) {
        match metric {
            Metric::Weight => self.weight = value,
            Metric::Recovery => self.recovery = value,
            Metric::Sleep => self.sleep = value,
            Metric::Calories => self.calories = value,
            Metric::Hrv => self.hrv = value,
            Metric::Cardio => self.cardio = value,
            Metric::Systolic => self.systolic = value,
            Metric::HeartRate => self.heart_rate = value,
        }
    }

    /// Builder used mostly by tests and replay fixtures
    pub fn with(mut self, metric: Metric, value: f64) -> Self {
        self.set(metric, value);
        self
    }
}

/// Difference between two temporally adjacent observations for the tracked metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaRecord {
    /// (metric, current - previous), in tracked order
    pub deltas: Vec<(Metric, f64)>,
}

impl DeltaRecord {
    /// Compute the delta of `current` against `previous`.
    ///
    /// With no previous observation every delta is 0.0.
    pub fn between(previous: Option<&Observation>, current: &Observation, tracked: &[Metric]) -> Self {
        let deltas = tracked
            .iter()
            .map(|&metric| {
                let delta = match previous {
                    Some(prev) => current.get(metric) - prev.get(metric),
                    None => 0.0,
                };
                (metric, delta)
            })
            .collect();
        Self { deltas }
    }

    pub fn get(&self, metric: Metric) -> f64 {
        self.deltas
            .iter()
            .find(|(m, _)| *m == metric)
            .map(|(_, d)| *d)
            .unwrap_or(0.0)
    }
}

/// Fixed-order numeric array consumed by the models
pub type FeatureVector = Vec<f64>;

/// Forecast model status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelStatus {
    CollectingData { samples: usize, min_samples: usize },
    Active,
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelStatus::CollectingData {
                samples,
                min_samples,
            } => write!(f, "collecting_data ({samples}/{min_samples})"),
            ModelStatus::Active => f.write_str("active"),
        }
    }
}

/// A single result emitted onto the channel
#[derive(Debug, Clone, PartialEq)]
pub enum ResultMessage {
    Anomaly { anomaly: bool },
    Forecast { forecast: f64 },
    Probability { probability: u8 },
    Confidence { confidence: u8 },
    Status(ModelStatus),
}

impl ResultMessage {
    pub fn topic(&self) -> &'static str {
        match self {
            ResultMessage::Anomaly { .. } => ANOMALY_TOPIC,
            ResultMessage::Forecast { .. } => FORECAST_TOPIC,
            ResultMessage::Probability { .. } => PROBABILITY_TOPIC,
            ResultMessage::Confidence { .. } => CONFIDENCE_TOPIC,
            ResultMessage::Status(_) => STATUS_TOPIC,
        }
    }

    /// JSON payload as published
    pub fn payload(&self) -> serde_json::Value {
        match self {
            ResultMessage::Anomaly { anomaly } => json!({ "anomaly": u8::from(*anomaly) }),
            ResultMessage::Forecast { forecast } => json!({ "forecast": round2(*forecast) }),
            ResultMessage::Probability { probability } => json!({ "probability": probability }),
            ResultMessage::Confidence { confidence } => json!({ "confidence": confidence }),
            ResultMessage::Status(status) => json!({ "status": status.to_string() }),
        }
    }
}

/// Round to two decimal places
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
