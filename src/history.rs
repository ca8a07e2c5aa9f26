//! History store
//!
//! Append-only, arrival-ordered log of observations. Two backings:
//! - bounded in-memory window (FIFO eviction once capacity is exceeded)
//! - durable flat file with an in-memory mirror loaded once at startup
//!
//! Delta records are never stored as state; they are recomputed from
//! adjacent observations whenever they are requested.

use crate::error::EngineError;
use crate::features::FeatureSchema;
use crate::types::{DeltaRecord, Metric, Observation};
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Default bounded capacity for the anomaly window
pub const DEFAULT_CAPACITY: usize = 50;

const DAY_COLUMN: &str = "day";
const DELTA_PREFIX: &str = "delta_";

/// Column layout of a history log file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLayout {
    /// Absolute metric columns, in file order
    pub metrics: Vec<Metric>,
    /// Metrics whose deltas are written after the absolute columns
    pub delta_metrics: Vec<Metric>,
}

impl LogLayout {
    /// Layout matching a feature schema. Weight is always stored since it is
    /// the forecast target.
    pub fn for_schema(schema: FeatureSchema) -> Self {
        let mut metrics = Vec::new();
        if schema.uses_deltas() {
            metrics.push(Metric::Weight);
        }
        metrics.extend(schema.metrics().iter().copied());
        if !metrics.contains(&Metric::Weight) {
            metrics.push(Metric::Weight);
        }

        let delta_metrics = if schema.uses_deltas() {
            metrics.clone()
        } else {
            Vec::new()
        };

        Self {
            metrics,
            delta_metrics,
        }
    }

    pub fn header(&self) -> String {
        let mut columns = vec![DAY_COLUMN.to_string()];
        columns.extend(self.metrics.iter().map(|m| m.as_str().to_string()));
        columns.extend(
            self.delta_metrics
                .iter()
                .map(|m| format!("{DELTA_PREFIX}{}", m.as_str())),
        );
        columns.join(",")
    }

    fn column_count(&self) -> usize {
        1 + self.metrics.len() + self.delta_metrics.len()
    }

    fn format_row(&self, observation: &Observation, delta: Option<&DeltaRecord>) -> String {
        let mut fields = vec![observation.day.clone()];
        fields.extend(self.metrics.iter().map(|&m| observation.get(m).to_string()));
        fields.extend(
            self.delta_metrics
                .iter()
                .map(|&m| delta.map(|d| d.get(m)).unwrap_or(0.0).to_string()),
        );
        fields.join(",")
    }

    fn parse_row(&self, line_no: usize, line: &str) -> Result<Observation, EngineError> {
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != self.column_count() {
            return Err(EngineError::CorruptLog {
                line: line_no,
                reason: format!(
                    "expected {} columns, found {}",
                    self.column_count(),
                    fields.len()
                ),
            });
        }

        let mut observation = Observation {
            day: fields[0].to_string(),
            ..Default::default()
        };
        for (metric, raw) in self.metrics.iter().zip(&fields[1..]) {
            let value = raw.trim().parse::<f64>().map_err(|e| EngineError::CorruptLog {
                line: line_no,
                reason: format!("{metric}: {e}"),
            })?;
            observation.set(*metric, value);
        }
        Ok(observation)
    }
}

/// Durable append-only log file. No handle is held between operations.
#[derive(Debug, Clone)]
pub struct HistoryLog {
    path: PathBuf,
    layout: LogLayout,
}

impl HistoryLog {
    /// Open the log, creating it with a header when absent
    pub fn open(path: impl Into<PathBuf>, layout: LogLayout) -> Result<Self, EngineError> {
        let log = Self {
            path: path.into(),
            layout,
        };

        if !log.path.exists() {
            if let Some(parent) = log.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            fs::write(&log.path, format!("{}\n", log.layout.header()))?;
            info!(path = %log.path.display(), "created history log");
        }

        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> &LogLayout {
        &self.layout
    }

    /// Read every row in file order
    pub fn read_all(&self) -> Result<Vec<Observation>, EngineError> {
        let content = fs::read_to_string(&self.path)?;
        let mut lines = content.lines().enumerate();

        let expected = self.layout.header();
        match lines.next() {
            Some((_, header)) if header.trim() == expected => {}
            Some((_, header)) => {
                return Err(EngineError::SchemaMismatch(format!(
                    "log header '{}' does not match expected '{}'",
                    header.trim(),
                    expected
                )))
            }
            None => {
                return Err(EngineError::CorruptLog {
                    line: 1,
                    reason: "missing header".to_string(),
                })
            }
        }

        lines
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| self.layout.parse_row(idx + 1, line))
            .collect()
    }

    /// Append one row
    pub fn append(
        &self,
        observation: &Observation,
        delta: Option<&DeltaRecord>,
    ) -> Result<(), EngineError> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        writeln!(file, "{}", self.layout.format_row(observation, delta))?;
        Ok(())
    }
}

/// Ordered store of past observations
#[derive(Debug, Clone)]
pub struct HistoryStore {
    rows: VecDeque<Observation>,
    capacity: Option<usize>,
    tracked: Vec<Metric>,
    log: Option<HistoryLog>,
}

impl HistoryStore {
    /// Bounded in-memory store; the oldest rows are evicted past `capacity`
    pub fn bounded(capacity: usize, tracked: &[Metric]) -> Self {
        Self {
            rows: VecDeque::with_capacity(capacity + 1),
            capacity: Some(capacity),
            tracked: tracked.to_vec(),
            log: None,
        }
    }

    /// Unbounded in-memory store
    pub fn in_memory(tracked: &[Metric]) -> Self {
        Self {
            rows: VecDeque::new(),
            capacity: None,
            tracked: tracked.to_vec(),
            log: None,
        }
    }

    /// Durable store backed by `log`, mirroring its full contents in memory
    pub fn durable(log: HistoryLog) -> Result<Self, EngineError> {
        let rows: VecDeque<Observation> = log.read_all()?.into();
        let tracked = log.layout().delta_metrics.clone();
        debug!(rows = rows.len(), path = %log.path().display(), "loaded history log");
        Ok(Self {
            rows,
            capacity: None,
            tracked,
            log: Some(log),
        })
    }

    /// Append an observation. The durable write happens first so the mirror
    /// never holds a row that is not on disk.
    pub fn append(&mut self, observation: Observation) -> Result<(), EngineError> {
        if let Some(log) = &self.log {
            let delta = DeltaRecord::between(self.rows.back(), &observation, &self.tracked);
            log.append(&observation, Some(&delta))?;
        }

        self.rows.push_back(observation);

        if let Some(capacity) = self.capacity {
            while self.rows.len() > capacity {
                self.rows.pop_front();
            }
        }
        Ok(())
    }

    /// All retained observations in arrival order
    pub fn snapshot(&self) -> impl Iterator<Item = &Observation> + '_ {
        self.rows.iter()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn latest(&self) -> Option<&Observation> {
        self.rows.back()
    }

    pub fn is_durable(&self) -> bool {
        self.log.is_some()
    }

    /// The most recent `size` observations (all of them when `size` is None),
    /// each paired with its delta record against its predecessor.
    pub fn window(&self, size: Option<usize>) -> Vec<(&Observation, DeltaRecord)> {
        let start = size
            .map(|w| self.rows.len().saturating_sub(w))
            .unwrap_or(0);

        (start..self.rows.len())
            .map(|i| {
                let previous = i.checked_sub(1).and_then(|p| self.rows.get(p));
                let current = &self.rows[i];
                (current, DeltaRecord::between(previous, current, &self.tracked))
            })
            .collect()
    }

    /// Delta records for every retained observation
    pub fn deltas(&self) -> Vec<DeltaRecord> {
        self.window(None).into_iter().map(|(_, d)| d).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn obs(day: &str, weight: f64, sleep: f64) -> Observation {
        Observation {
            day: day.to_string(),
            ..Default::default()
        }
        .with(Metric::Weight, weight)
        .with(Metric::Sleep, sleep)
    }

    #[test]
    fn test_bounded_preserves_order_and_capacity() {
        let mut store = HistoryStore::bounded(3, &[]);
        assert!(store.is_empty());
        for i in 0..5 {
            store.append(obs("2024-01-01", 80.0 + i as f64, 7.0)).unwrap();
            assert!(store.len() <= 3);
        }

        let weights: Vec<f64> = store.snapshot().map(|o| o.weight).collect();
        assert_eq!(weights, vec![82.0, 83.0, 84.0]);
    }

    #[test]
    fn test_window_deltas() {
        let mut store = HistoryStore::bounded(10, &[Metric::Weight, Metric::Sleep]);
        store.append(obs("d1", 80.0, 7.0)).unwrap();
        store.append(obs("d2", 79.5, 8.0)).unwrap();
        store.append(obs("d3", 79.75, 6.5)).unwrap();

        let deltas = store.deltas();
        assert_eq!(deltas[0].get(Metric::Weight), 0.0);
        assert_eq!(deltas[1].get(Metric::Weight), 79.5 - 80.0);
        assert_eq!(deltas[2].get(Metric::Sleep), 6.5 - 8.0);

        // The first row of a trailing window still diffs against its predecessor
        let window = store.window(Some(2));
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].0.day, "d2");
        assert_eq!(window[0].1.get(Metric::Sleep), 1.0);
    }

    #[test]
    fn test_log_created_with_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("history.csv");
        let layout = LogLayout::for_schema(FeatureSchema::Absolute);
        HistoryLog::open(&path, layout).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "day,recovery,cardio,hrv,calories,sleep,weight\n");
    }

    #[test]
    fn test_delta_layout_header() {
        let layout = LogLayout::for_schema(FeatureSchema::Deltas);
        assert_eq!(
            layout.header(),
            "day,weight,recovery,sleep,calories,hrv,\
             delta_weight,delta_recovery,delta_sleep,delta_calories,delta_hrv"
        );
    }

    #[test]
    fn test_durable_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.csv");
        let layout = LogLayout::for_schema(FeatureSchema::Absolute);

        let appended: Vec<Observation> = (0..7)
            .map(|i| {
                obs("2024-02-01", 80.0 - 0.1 * i as f64, 7.0 + 0.25 * i as f64)
                    .with(Metric::Recovery, 40.0 + i as f64)
                    .with(Metric::Cardio, 1.0 / 3.0)
                    .with(Metric::Hrv, 55.5)
                    .with(Metric::Calories, 2150.0)
            })
            .collect();

        let mut store = HistoryStore::durable(HistoryLog::open(&path, layout.clone()).unwrap()).unwrap();
        for o in &appended {
            store.append(o.clone()).unwrap();
        }

        let reloaded = HistoryStore::durable(HistoryLog::open(&path, layout).unwrap()).unwrap();
        let rows: Vec<Observation> = reloaded.snapshot().cloned().collect();
        assert_eq!(rows, appended);
    }

    #[test]
    fn test_delta_columns_written() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.csv");
        let layout = LogLayout::for_schema(FeatureSchema::Deltas);
        let mut store = HistoryStore::durable(HistoryLog::open(&path, layout).unwrap()).unwrap();

        store.append(obs("d1", 80.0, 7.0)).unwrap();
        store.append(obs("d2", 79.5, 7.5)).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let rows: Vec<&str> = content.lines().skip(1).collect();
        assert_eq!(rows[0], "d1,80,0,7,0,0,0,0,0,0,0");
        assert_eq!(rows[1], "d2,79.5,0,7.5,0,0,-0.5,0,0.5,0,0");
    }

    #[test]
    fn test_header_mismatch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.csv");
        fs::write(&path, "day,weight\n2024-01-01,80\n").unwrap();

        let log = HistoryLog::open(&path, LogLayout::for_schema(FeatureSchema::Absolute)).unwrap();
        assert!(matches!(
            HistoryStore::durable(log),
            Err(EngineError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_corrupt_row_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.csv");
        let layout = LogLayout::for_schema(FeatureSchema::Absolute);
        fs::write(
            &path,
            format!("{}\n2024-01-01,1,2,3,4,5,6\n2024-01-02,1,x,3,4,5,6\n", layout.header()),
        )
        .unwrap();

        let log = HistoryLog::open(&path, layout).unwrap();
        match log.read_all() {
            Err(EngineError::CorruptLog { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected corrupt log error, got {other:?}"),
        }
    }
}
