//! Forecast model
//!
//! A linear regressor fit from scratch each cycle on (features at day t ->
//! weight target at day t+1) pairs from the rolling history, then projected
//! iteratively over the forecast horizon.
//!
//! Projection modes:
//! - `Deltas`: the predicted next-day weight delta is accumulated onto the
//!   last known weight for every step without re-deriving features.
//! - `Absolute`: each predicted weight is substituted into the weight slot of
//!   the feature vector and the model is re-applied, compounding per step.

use crate::error::EngineError;
use crate::features::FeatureSchema;
use crate::history::HistoryStore;
use crate::types::{FeatureVector, Metric, ModelStatus, ResultMessage};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Days projected ahead
pub const DEFAULT_HORIZON: usize = 30;
/// History length at which confidence saturates
pub const CONFIDENCE_SATURATION: usize = 30;
/// Rolling window in delta mode
pub const DEFAULT_DELTA_WINDOW: usize = 14;
/// Minimum history before training in delta mode
pub const DEFAULT_DELTA_MIN_SAMPLES: usize = 14;
/// Minimum history before training in absolute mode
pub const DEFAULT_ABSOLUTE_MIN_SAMPLES: usize = 30;
/// Singular values below this fraction of the largest are treated as zero
const SINGULAR_CUTOFF: f64 = 1e-10;
const SVD_MAX_ITERATIONS: usize = 1000;

/// How the regressor is rolled forward over the horizon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionMode {
    Deltas,
    Absolute,
}

impl ProjectionMode {
    pub fn for_schema(schema: FeatureSchema) -> Self {
        if schema.uses_deltas() {
            ProjectionMode::Deltas
        } else {
            ProjectionMode::Absolute
        }
    }
}

/// Ordinary least squares with intercept
#[derive(Debug, Clone, PartialEq)]
pub struct LinearModel {
    pub intercept: f64,
    pub coefficients: Vec<f64>,
}

impl LinearModel {
    /// Fit on centered data with an SVD least-squares solve. Directions
    /// without usable variance (constant or collinear columns) get the
    /// minimum-norm answer, so the fit is total on degenerate windows.
    pub fn fit(x: &[FeatureVector], y: &[f64]) -> Result<Self, EngineError> {
        if x.is_empty() || x.len() != y.len() {
            return Err(EngineError::Training(format!(
                "cannot fit {} inputs against {} targets",
                x.len(),
                y.len()
            )));
        }
        let width = x[0].len();
        if x.iter().any(|row| row.len() != width) {
            return Err(EngineError::SchemaMismatch(
                "training rows have differing widths".to_string(),
            ));
        }

        let design = DMatrix::from_fn(x.len(), width, |i, j| x[i][j]);
        let target = DVector::from_column_slice(y);
        let x_mean: Vec<f64> = design.column_iter().map(|c| c.mean()).collect();
        let y_mean = target.mean();

        let centered = DMatrix::from_fn(x.len(), width, |i, j| design[(i, j)] - x_mean[j]);
        let target = target.add_scalar(-y_mean);
        if !centered.norm_squared().is_finite() || !target.norm_squared().is_finite() {
            return Err(EngineError::Training(
                "feature magnitudes out of range for least squares".to_string(),
            ));
        }

        let coefficients: Vec<f64> = if width == 0 {
            Vec::new()
        } else {
            let svd = centered
                .try_svd(true, true, f64::EPSILON, SVD_MAX_ITERATIONS)
                .ok_or_else(|| EngineError::Training("SVD did not converge".to_string()))?;
            let cutoff = svd.singular_values.max() * SINGULAR_CUTOFF;
            svd.solve(&target, cutoff)
                .map_err(|e| EngineError::Training(e.to_string()))?
                .iter()
                .copied()
                .collect()
        };

        let intercept = y_mean
            - coefficients
                .iter()
                .zip(&x_mean)
                .map(|(c, m)| c * m)
                .sum::<f64>();

        if !intercept.is_finite() || coefficients.iter().any(|c| !c.is_finite()) {
            return Err(EngineError::Training("non-finite regression coefficients".to_string()));
        }

        Ok(Self {
            intercept,
            coefficients,
        })
    }

    pub fn predict(&self, x: &[f64]) -> f64 {
        self.intercept
            + self
                .coefficients
                .iter()
                .zip(x)
                .map(|(c, v)| c * v)
                .sum::<f64>()
    }
}

/// Forecast settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastParams {
    pub schema: FeatureSchema,
    /// Rolling window of most recent rows; `None` uses the whole history
    pub window: Option<usize>,
    pub min_samples: usize,
    pub horizon: usize,
    pub projection: ProjectionMode,
}

impl ForecastParams {
    /// Delta-adaptive defaults: 14-row window, 14 minimum samples
    pub fn deltas() -> Self {
        Self {
            schema: FeatureSchema::Deltas,
            window: Some(DEFAULT_DELTA_WINDOW),
            min_samples: DEFAULT_DELTA_MIN_SAMPLES,
            horizon: DEFAULT_HORIZON,
            projection: ProjectionMode::Deltas,
        }
    }

    /// Persistent absolute-value defaults: whole log, 30 minimum samples
    pub fn absolute() -> Self {
        Self {
            schema: FeatureSchema::Absolute,
            window: None,
            min_samples: DEFAULT_ABSOLUTE_MIN_SAMPLES,
            horizon: DEFAULT_HORIZON,
            projection: ProjectionMode::Absolute,
        }
    }
}

/// A produced forecast
#[derive(Debug, Clone, PartialEq)]
pub struct Forecast {
    /// Projected weight at the end of the horizon
    pub projected: f64,
    /// Last known weight
    pub latest: f64,
    /// Model's predicted change for the next step
    pub step_delta: f64,
    pub probability: u8,
    pub confidence: u8,
}

/// Result of one forecast cycle
#[derive(Debug, Clone, PartialEq)]
pub enum ForecastOutcome {
    Collecting { samples: usize, min_samples: usize },
    Active(Forecast),
}

impl ForecastOutcome {
    /// Result messages in publish order
    pub fn messages(&self, include_confidence: bool) -> Vec<ResultMessage> {
        match self {
            ForecastOutcome::Collecting {
                samples,
                min_samples,
            } => vec![ResultMessage::Status(ModelStatus::CollectingData {
                samples: *samples,
                min_samples: *min_samples,
            })],
            ForecastOutcome::Active(forecast) => {
                let mut messages = vec![
                    ResultMessage::Forecast {
                        forecast: forecast.projected,
                    },
                    ResultMessage::Probability {
                        probability: forecast.probability,
                    },
                ];
                if include_confidence {
                    messages.push(ResultMessage::Confidence {
                        confidence: forecast.confidence,
                    });
                }
                messages.push(ResultMessage::Status(ModelStatus::Active));
                messages
            }
        }
    }
}

/// Cold-fit weight forecaster
#[derive(Debug, Clone, Copy)]
pub struct Forecaster {
    params: ForecastParams,
}

impl Forecaster {
    pub fn new(params: ForecastParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ForecastParams {
        &self.params
    }

    /// Build (features at t -> target at t+1) pairs over the rolling window
    pub fn training_pairs(&self, store: &HistoryStore) -> (Vec<FeatureVector>, Vec<f64>) {
        let schema = self.params.schema;
        let window = store.window(self.params.window);

        window
            .windows(2)
            .map(|pair| {
                let (obs, delta) = &pair[0];
                let (next, next_delta) = &pair[1];
                let target = if schema.uses_deltas() {
                    next_delta.get(Metric::Weight)
                } else {
                    next.weight
                };
                (schema.vector(obs, Some(delta)), target)
            })
            .unzip()
    }

    /// Fit a fresh regressor on the current history
    pub fn retrain(&self, store: &HistoryStore) -> Result<LinearModel, EngineError> {
        let (x, y) = self.training_pairs(store);
        let model = LinearModel::fit(&x, &y)?;
        debug!(pairs = x.len(), intercept = model.intercept, "fit regressor");
        Ok(model)
    }

    /// Roll the model forward over the horizon.
    ///
    /// Returns the projected weight and the first-step predicted change.
    pub fn project(
        &self,
        model: &LinearModel,
        latest_features: &[f64],
        latest_weight: f64,
    ) -> Result<(f64, f64), EngineError> {
        let horizon = self.params.horizon;
        match self.params.projection {
            ProjectionMode::Deltas => {
                let step = model.predict(latest_features);
                let mut projected = latest_weight;
                for _ in 0..horizon {
                    projected += step;
                }
                Ok((projected, step))
            }
            ProjectionMode::Absolute => {
                let slot = self.params.schema.position(Metric::Weight).ok_or_else(|| {
                    EngineError::SchemaMismatch(
                        "absolute projection needs weight in the feature vector".to_string(),
                    )
                })?;
                let mut features = latest_features.to_vec();
                let mut projected = latest_weight;
                let mut first_step = None;
                for _ in 0..horizon {
                    projected = model.predict(&features);
                    first_step.get_or_insert(projected - latest_weight);
                    features[slot] = projected;
                }
                Ok((projected, first_step.unwrap_or(0.0)))
            }
        }
    }

    /// Gate, retrain and project from `latest_features`, the vector of the
    /// observation just stored
    pub fn run(
        &self,
        store: &HistoryStore,
        latest_features: &[f64],
    ) -> Result<ForecastOutcome, EngineError> {
        let samples = store.len();
        if samples < self.params.min_samples {
            return Ok(ForecastOutcome::Collecting {
                samples,
                min_samples: self.params.min_samples,
            });
        }

        let model = self.retrain(store)?;

        let latest_weight = store
            .latest()
            .map(|o| o.weight)
            .ok_or_else(|| EngineError::Training("empty history".to_string()))?;

        let (projected, step_delta) = self.project(&model, latest_features, latest_weight)?;
        if !projected.is_finite() {
            return Err(EngineError::Training("projection diverged".to_string()));
        }

        let probability = match self.params.projection {
            ProjectionMode::Deltas => risk_bucket(step_delta),
            ProjectionMode::Absolute => magnitude_risk(projected, latest_weight),
        };

        Ok(ForecastOutcome::Active(Forecast {
            projected,
            latest: latest_weight,
            step_delta,
            probability,
            confidence: confidence(samples),
        }))
    }
}

/// Data-sufficiency proxy: min(100, floor(n / 30 * 100))
pub fn confidence(history_len: usize) -> u8 {
    (history_len.saturating_mul(100) / CONFIDENCE_SATURATION).min(100) as u8
}

/// Rule-based risk on the predicted next-step weight delta
pub fn risk_bucket(step_delta: f64) -> u8 {
    if step_delta > -0.05 {
        70
    } else if step_delta > -0.1 {
        40
    } else {
        10
    }
}

/// Magnitude-scaled risk: min(100, max(0, |projected - latest| * 50))
pub fn magnitude_risk(projected: f64, latest: f64) -> u8 {
    ((projected - latest).abs() * 50.0).clamp(0.0, 100.0).floor() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Observation;
    use pretty_assertions::assert_eq;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    fn run(forecaster: &Forecaster, store: &HistoryStore) -> ForecastOutcome {
        let latest = store
            .window(Some(1))
            .pop()
            .map(|(obs, delta)| forecaster.params().schema.vector(obs, Some(&delta)))
            .unwrap_or_default();
        forecaster.run(store, &latest).unwrap()
    }

    fn delta_store(days: usize, weight_step: f64) -> HistoryStore {
        let mut store = HistoryStore::in_memory(&[
            Metric::Weight,
            Metric::Recovery,
            Metric::Sleep,
            Metric::Calories,
            Metric::Hrv,
        ]);
        for i in 0..days {
            let wiggle = if i % 2 == 0 { 1.0 } else { -1.0 };
            store
                .append(
                    Observation::default()
                        .with(Metric::Weight, 85.0 + weight_step * i as f64)
                        .with(Metric::Recovery, 60.0 + 5.0 * wiggle)
                        .with(Metric::Sleep, 7.0 + 0.1 * (i % 3) as f64)
                        .with(Metric::Calories, 2200.0 + 30.0 * (i % 4) as f64)
                        .with(Metric::Hrv, 55.0 + wiggle),
                )
                .unwrap();
        }
        store
    }

    #[test]
    fn test_confidence_formula() {
        assert_eq!(confidence(0), 0);
        assert_eq!(confidence(15), 50);
        assert_eq!(confidence(29), 96);
        assert_eq!(confidence(30), 100);
        assert_eq!(confidence(90), 100);
    }

    #[test]
    fn test_risk_buckets() {
        assert_eq!(risk_bucket(-0.02), 70);
        assert_eq!(risk_bucket(-0.08), 40);
        assert_eq!(risk_bucket(-0.2), 10);
        assert_eq!(risk_bucket(0.3), 70);
        assert_eq!(risk_bucket(-0.05), 40);
        assert_eq!(risk_bucket(-0.1), 10);
    }

    #[test]
    fn test_magnitude_risk() {
        assert_eq!(magnitude_risk(79.0, 80.0), 50);
        assert_eq!(magnitude_risk(83.0, 80.0), 100);
        assert_eq!(magnitude_risk(80.0, 80.0), 0);
    }

    #[test]
    fn test_ols_recovers_plane() {
        let x: Vec<FeatureVector> = (0..10)
            .map(|i| vec![i as f64, ((i * 7) % 5) as f64])
            .collect();
        let y: Vec<f64> = x.iter().map(|r| 2.0 * r[0] - r[1] + 3.0).collect();

        let model = LinearModel::fit(&x, &y).unwrap();
        assert!(approx(model.coefficients[0], 2.0));
        assert!(approx(model.coefficients[1], -1.0));
        assert!(approx(model.intercept, 3.0));
        assert!(approx(model.predict(&[4.0, 1.0]), 10.0));
    }

    #[test]
    fn test_ols_is_total_on_degenerate_input() {
        let x = vec![vec![1.0, 5.0]; 6];
        let y = vec![2.0, 4.0, 3.0, 5.0, 1.0, 3.0];
        let model = LinearModel::fit(&x, &y).unwrap();
        assert_eq!(model.coefficients, vec![0.0, 0.0]);
        assert!(approx(model.predict(&[9.0, 9.0]), 3.0));

        // Perfectly collinear columns still produce a usable fit
        let x: Vec<FeatureVector> = (0..8).map(|i| vec![i as f64, 2.0 * i as f64]).collect();
        let y: Vec<f64> = (0..8).map(|i| 1.0 + i as f64).collect();
        let model = LinearModel::fit(&x, &y).unwrap();
        assert!(approx(model.predict(&[3.0, 6.0]), 4.0));
    }

    #[test]
    fn test_ols_rejects_overflowing_magnitudes() {
        let x: Vec<FeatureVector> = (0..6)
            .map(|i| vec![if i % 2 == 0 { 1.7e308 } else { -1.7e308 }, i as f64])
            .collect();
        let y = vec![80.0, 79.9, 79.8, 79.7, 79.6, 79.5];
        assert!(matches!(
            LinearModel::fit(&x, &y),
            Err(EngineError::Training(_))
        ));

        let x: Vec<FeatureVector> = (0..6).map(|i| vec![i as f64]).collect();
        let y = vec![1e200, -1e200, 1e200, -1e200, 1e200, -1e200];
        assert!(matches!(
            LinearModel::fit(&x, &y),
            Err(EngineError::Training(_))
        ));
    }

    #[test]
    fn test_gate_below_min_samples() {
        let forecaster = Forecaster::new(ForecastParams::deltas());
        let store = delta_store(13, -0.1);
        assert_eq!(
            run(&forecaster, &store),
            ForecastOutcome::Collecting {
                samples: 13,
                min_samples: 14
            }
        );
    }

    #[test]
    fn test_training_pairs_use_next_day_target() {
        let forecaster = Forecaster::new(ForecastParams::deltas());
        let store = delta_store(20, -0.2);
        let (x, y) = forecaster.training_pairs(&store);

        assert_eq!(x.len(), 13);
        assert_eq!(x[0].len(), 4);
        assert!(y.iter().all(|t| approx(*t, -0.2)));
    }

    #[test]
    fn test_delta_projection_losing_weight() {
        let forecaster = Forecaster::new(ForecastParams::deltas());
        let store = delta_store(20, -0.2);

        match run(&forecaster, &store) {
            ForecastOutcome::Active(forecast) => {
                assert!(approx(forecast.step_delta, -0.2));
                assert!(approx(forecast.latest, 85.0 - 0.2 * 19.0));
                assert!(approx(forecast.projected, forecast.latest - 6.0));
                assert_eq!(forecast.probability, 10);
                assert_eq!(forecast.confidence, 66);
            }
            other => panic!("expected forecast, got {other:?}"),
        }
    }

    #[test]
    fn test_delta_projection_stable_weight() {
        let forecaster = Forecaster::new(ForecastParams::deltas());
        let store = delta_store(14, 0.0);

        match run(&forecaster, &store) {
            ForecastOutcome::Active(forecast) => {
                assert!(approx(forecast.projected, 85.0));
                assert_eq!(forecast.probability, 70);
                assert_eq!(forecast.confidence, 46);
            }
            other => panic!("expected forecast, got {other:?}"),
        }
    }

    #[test]
    fn test_absolute_projection_compounds() {
        let forecaster = Forecaster::new(ForecastParams::absolute());
        let mut store = HistoryStore::in_memory(&[]);
        for i in 0..30 {
            store
                .append(Observation::default().with(Metric::Weight, 90.0 - 0.1 * i as f64))
                .unwrap();
        }

        match run(&forecaster, &store) {
            ForecastOutcome::Active(forecast) => {
                assert!(approx(forecast.latest, 87.1));
                assert!(approx(forecast.step_delta, -0.1));
                assert!(approx(forecast.projected, 84.1));
                assert_eq!(forecast.probability, 100);
                assert_eq!(forecast.confidence, 100);
            }
            other => panic!("expected forecast, got {other:?}"),
        }
    }

    #[test]
    fn test_active_messages_order() {
        let outcome = ForecastOutcome::Active(Forecast {
            projected: 80.123,
            latest: 81.0,
            step_delta: -0.03,
            probability: 70,
            confidence: 50,
        });
        let topics: Vec<&str> = outcome.messages(true).iter().map(|m| m.topic()).collect();
        assert_eq!(
            topics,
            vec![
                crate::types::FORECAST_TOPIC,
                crate::types::PROBABILITY_TOPIC,
                crate::types::CONFIDENCE_TOPIC,
                crate::types::STATUS_TOPIC,
            ]
        );
        assert_eq!(outcome.messages(false).len(), 3);
    }
}
