//! Feature extraction
//!
//! Maps inbound messages (sparse, possibly malformed) onto observations and
//! fixed-order feature vectors. Vector order is a contract shared by both
//! models; reordering it invalidates any previously fit coefficients.
//!
//! | schema     | order                                          |
//! |------------|------------------------------------------------|
//! | `Anomaly`  | weight, systolic, heart_rate, sleep            |
//! | `Deltas`   | Δrecovery, Δsleep, Δcalories, Δhrv             |
//! | `Absolute` | recovery, cardio, hrv, calories, sleep, weight |

use crate::error::EngineError;
use crate::types::{DeltaRecord, FeatureVector, Metric, Observation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const ANOMALY_METRICS: [Metric; 4] = [
    Metric::Weight,
    Metric::Systolic,
    Metric::HeartRate,
    Metric::Sleep,
];

const DELTA_METRICS: [Metric; 4] = [
    Metric::Recovery,
    Metric::Sleep,
    Metric::Calories,
    Metric::Hrv,
];

const ABSOLUTE_METRICS: [Metric; 6] = [
    Metric::Recovery,
    Metric::Cardio,
    Metric::Hrv,
    Metric::Calories,
    Metric::Sleep,
    Metric::Weight,
];

/// Feature layout used by a running instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureSchema {
    Anomaly,
    Deltas,
    Absolute,
}

impl FeatureSchema {
    /// Metrics feeding the vector, in vector order
    pub fn metrics(&self) -> &'static [Metric] {
        match self {
            FeatureSchema::Anomaly => &ANOMALY_METRICS,
            FeatureSchema::Deltas => &DELTA_METRICS,
            FeatureSchema::Absolute => &ABSOLUTE_METRICS,
        }
    }

    pub fn uses_deltas(&self) -> bool {
        matches!(self, FeatureSchema::Deltas)
    }

    pub fn width(&self) -> usize {
        self.metrics().len()
    }

    /// Index of a metric inside the vector, if it is part of it
    pub fn position(&self, metric: Metric) -> Option<usize> {
        self.metrics().iter().position(|m| *m == metric)
    }

    /// Build the vector for an observation.
    ///
    /// Delta schemas read from `delta`; a missing delta record yields zeros.
    pub fn vector(&self, observation: &Observation, delta: Option<&DeltaRecord>) -> FeatureVector {
        if self.uses_deltas() {
            self.metrics()
                .iter()
                .map(|&m| delta.map(|d| d.get(m)).unwrap_or(0.0))
                .collect()
        } else {
            self.metrics().iter().map(|&m| observation.get(m)).collect()
        }
    }
}

/// Extractor from raw messages to observations and feature vectors
#[derive(Debug, Clone, Copy)]
pub struct FeatureExtractor {
    schema: FeatureSchema,
}

impl FeatureExtractor {
    pub fn new(schema: FeatureSchema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> FeatureSchema {
        self.schema
    }

    /// Decode a message body. Fails only when the body is not a JSON object.
    pub fn decode(payload: &[u8]) -> Result<Map<String, Value>, EngineError> {
        match serde_json::from_slice::<Value>(payload)? {
            Value::Object(map) => Ok(map),
            _ => Err(EngineError::NotAnObject),
        }
    }

    /// Map a decoded message onto an observation. Total: every recognized
    /// metric that is absent or non-numeric becomes 0.0.
    pub fn observation(raw: &Map<String, Value>, day: &str) -> Observation {
        let mut observation = Observation {
            day: day.to_string(),
            ..Default::default()
        };
        for metric in Metric::ALL {
            observation.set(metric, raw.get(metric.as_str()).map(coerce).unwrap_or(0.0));
        }
        observation
    }

    /// Extract the feature vector for a raw message.
    ///
    /// For the delta schema `previous` is the last stored observation; with
    /// none the deltas are all zero.
    pub fn extract(&self, raw: &Map<String, Value>, previous: Option<&Observation>) -> FeatureVector {
        let observation = Self::observation(raw, "");
        if self.schema.uses_deltas() {
            let delta = DeltaRecord::between(previous, &observation, self.schema.metrics());
            self.schema.vector(&observation, Some(&delta))
        } else {
            self.schema.vector(&observation, None)
        }
    }
}

/// Coerce a JSON value to a finite float, falling back to 0.0
fn coerce(value: &Value) -> f64 {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    };
    parsed.filter(|v| v.is_finite()).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("fixture must be an object"),
        }
    }

    #[test]
    fn test_anomaly_vector_order() {
        let raw = object(json!({"sleep": 7.5, "weight": 81.2, "heart_rate": 58, "systolic": 121}));
        let extractor = FeatureExtractor::new(FeatureSchema::Anomaly);
        assert_eq!(extractor.extract(&raw, None), vec![81.2, 121.0, 58.0, 7.5]);
    }

    #[test]
    fn test_missing_fields_default_to_zero() {
        let raw = object(json!({"hrv": 64}));
        let extractor = FeatureExtractor::new(FeatureSchema::Absolute);
        assert_eq!(extractor.extract(&raw, None), vec![0.0, 0.0, 64.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_malformed_values_are_coerced() {
        let raw = object(json!({
            "weight": "80.4",
            "systolic": "high",
            "heart_rate": null,
            "sleep": [7]
        }));
        let extractor = FeatureExtractor::new(FeatureSchema::Anomaly);
        assert_eq!(extractor.extract(&raw, None), vec![80.4, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_delta_vector_against_previous() {
        let previous = Observation::default()
            .with(Metric::Recovery, 50.0)
            .with(Metric::Sleep, 7.0)
            .with(Metric::Calories, 2000.0)
            .with(Metric::Hrv, 60.0);
        let raw = object(json!({"recovery": 65, "sleep": 6.5, "calories": 2100, "hrv": 58}));
        let extractor = FeatureExtractor::new(FeatureSchema::Deltas);

        assert_eq!(
            extractor.extract(&raw, Some(&previous)),
            vec![15.0, -0.5, 100.0, -2.0]
        );
        assert_eq!(extractor.extract(&raw, None), vec![0.0; 4]);
    }

    #[test]
    fn test_decode_rejects_non_objects() {
        assert!(matches!(
            FeatureExtractor::decode(b"[1, 2]"),
            Err(EngineError::NotAnObject)
        ));
        assert!(matches!(
            FeatureExtractor::decode(b"{not json"),
            Err(EngineError::Decode(_))
        ));
        assert!(FeatureExtractor::decode(br#"{"weight": 80}"#).is_ok());
    }

    #[test]
    fn test_schema_positions() {
        assert_eq!(FeatureSchema::Absolute.position(Metric::Weight), Some(5));
        assert_eq!(FeatureSchema::Deltas.position(Metric::Weight), None);
        assert_eq!(FeatureSchema::Anomaly.width(), 4);
    }
}
