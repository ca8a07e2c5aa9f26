//! Engine loop
//!
//! One inbound message drives one cycle:
//! decode -> extract -> store -> training gate -> score | forecast -> publish.
//!
//! Only the fallible stages are attributed on failure; extraction is total
//! and publish failures are logged per message without aborting the cycle.
//!
//! The engine owns the history store and nothing else that outlives a cycle;
//! models are fit from scratch inside the cycle and dropped at its end. Any
//! failure aborts only the current cycle: it is logged, nothing is published
//! and the next message is processed normally. Rows appended before the
//! failure stay appended.

use crate::anomaly::AnomalyDetector;
use crate::config::{EngineConfig, EngineMode};
use crate::error::EngineError;
use crate::features::FeatureExtractor;
use crate::forecast::Forecaster;
use crate::history::{HistoryLog, HistoryStore, LogLayout};
use crate::publisher::{publish_all, ResultPublisher};
use crate::types::{FeatureVector, ResultMessage};
use chrono::{DateTime, Utc};
use std::fmt;
use tracing::{debug, debug_span, info, warn};

/// Stage of a cycle, used to attribute failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStage {
    Decoding,
    Storing,
    Scoring,
    Forecasting,
}

impl fmt::Display for CycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CycleStage::Decoding => "decoding",
            CycleStage::Storing => "storing",
            CycleStage::Scoring => "scoring",
            CycleStage::Forecasting => "forecasting",
        };
        f.write_str(name)
    }
}

/// Error that aborted a cycle
#[derive(Debug)]
pub struct CycleFailure {
    pub stage: CycleStage,
    pub error: EngineError,
}

impl fmt::Display for CycleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.stage, self.error)
    }
}

trait AtStage<T> {
    fn at(self, stage: CycleStage) -> Result<T, CycleFailure>;
}

impl<T> AtStage<T> for Result<T, EngineError> {
    fn at(self, stage: CycleStage) -> Result<T, CycleFailure> {
        self.map_err(|error| CycleFailure { stage, error })
    }
}

/// How a handled message ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed { results: usize, published: usize },
    Dropped { stage: CycleStage, reason: String },
}

/// Engine context: configuration plus the history store
pub struct Engine {
    config: EngineConfig,
    extractor: FeatureExtractor,
    store: HistoryStore,
    cycles: u64,
}

impl Engine {
    /// Build the engine, loading the durable log when one is configured
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let schema = config.mode.schema();
        let layout = LogLayout::for_schema(schema);

        let store = match (&config.mode, &config.history_path) {
            (EngineMode::Anomaly, _) => HistoryStore::bounded(config.capacity, &[]),
            (_, Some(path)) => HistoryStore::durable(HistoryLog::open(path, layout)?)?,
            (_, None) => HistoryStore::in_memory(&layout.delta_metrics),
        };

        info!(
            mode = %config.mode,
            durable = store.is_durable(),
            history = store.len(),
            "engine ready"
        );

        Ok(Self {
            config,
            extractor: FeatureExtractor::new(schema),
            store,
            cycles: 0,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn history(&self) -> &HistoryStore {
        &self.store
    }

    /// Run one cycle and publish its results. Never fails: errors are
    /// logged and the message is dropped.
    pub fn handle_message(
        &mut self,
        payload: &[u8],
        publisher: &mut dyn ResultPublisher,
    ) -> CycleOutcome {
        match self.process(payload) {
            Ok(messages) => {
                let published = publish_all(publisher, &messages);
                CycleOutcome::Completed {
                    results: messages.len(),
                    published,
                }
            }
            Err(failure) => {
                warn!(stage = %failure.stage, error = %failure.error, "dropped message");
                CycleOutcome::Dropped {
                    stage: failure.stage,
                    reason: failure.error.to_string(),
                }
            }
        }
    }

    /// Run one cycle and return the messages it would publish
    pub fn process(&mut self, payload: &[u8]) -> Result<Vec<ResultMessage>, CycleFailure> {
        self.process_at(payload, Utc::now())
    }

    /// Run one cycle with an explicit arrival time
    pub fn process_at(
        &mut self,
        payload: &[u8],
        arrived_at: DateTime<Utc>,
    ) -> Result<Vec<ResultMessage>, CycleFailure> {
        self.cycles += 1;
        let _span = debug_span!("cycle", n = self.cycles, mode = %self.config.mode).entered();

        let raw = FeatureExtractor::decode(payload).at(CycleStage::Decoding)?;

        // Deltas are taken against the last stored row, so extract before storing
        let newest = self.extractor.extract(&raw, self.store.latest());
        debug!(features = ?newest, "extracted");

        let day = arrived_at.format("%Y-%m-%d").to_string();
        let observation = FeatureExtractor::observation(&raw, &day);
        self.store.append(observation).at(CycleStage::Storing)?;

        match self.config.mode {
            EngineMode::Anomaly => self.score_anomaly(newest),
            EngineMode::ForecastDelta | EngineMode::ForecastAbsolute => self.forecast(&newest),
        }
    }

    fn score_anomaly(&self, newest: FeatureVector) -> Result<Vec<ResultMessage>, CycleFailure> {
        if self.store.len() < self.config.capacity {
            debug!(
                samples = self.store.len(),
                capacity = self.config.capacity,
                "warming up"
            );
            return Ok(Vec::new());
        }

        let schema = self.extractor.schema();
        let mut window: Vec<FeatureVector> = self
            .store
            .snapshot()
            .take(self.store.len() - 1)
            .map(|o| schema.vector(o, None))
            .collect();
        window.push(newest);

        let verdict = AnomalyDetector::new(self.config.anomaly)
            .retrain_and_score(&window)
            .at(CycleStage::Scoring)?;

        if verdict.is_anomaly {
            info!(score = verdict.score, threshold = verdict.threshold, "anomaly detected");
        }
        Ok(vec![ResultMessage::Anomaly {
            anomaly: verdict.is_anomaly,
        }])
    }

    fn forecast(&self, newest: &[f64]) -> Result<Vec<ResultMessage>, CycleFailure> {
        let forecaster = Forecaster::new(self.config.forecast);
        let outcome = forecaster
            .run(&self.store, newest)
            .at(CycleStage::Forecasting)?;
        Ok(outcome.messages(self.config.mode == EngineMode::ForecastDelta))
    }
}
