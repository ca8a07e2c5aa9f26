//! Anomaly model
//!
//! An isolation forest fit from scratch on the whole current window every
//! cycle. Points that isolate in fewer random splits than the rest of the
//! window score higher; the contamination prior fixes the score quantile
//! above which a point is reported as an outlier.

use crate::error::EngineError;
use crate::types::FeatureVector;
use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Expected share of outliers in the training window
pub const DEFAULT_CONTAMINATION: f64 = 0.05;
/// Seed for reproducible forests
pub const DEFAULT_SEED: u64 = 42;
/// Number of isolation trees
pub const DEFAULT_TREES: usize = 100;
/// Upper bound on the per-tree sub-sample
const MAX_SAMPLES: usize = 256;
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Isolation forest hyper-parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnomalyParams {
    pub trees: usize,
    pub contamination: f64,
    pub seed: u64,
}

impl Default for AnomalyParams {
    fn default() -> Self {
        Self {
            trees: DEFAULT_TREES,
            contamination: DEFAULT_CONTAMINATION,
            seed: DEFAULT_SEED,
        }
    }
}

/// Verdict for the newest vector of a window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnomalyVerdict {
    pub is_anomaly: bool,
    /// Anomaly score in (0, 1]; higher is more isolated
    pub score: f64,
    /// Score above which a point is an outlier
    pub threshold: f64,
}

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        value: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

/// A fitted isolation forest
#[derive(Debug, Clone)]
pub struct IsolationForest {
    trees: Vec<Node>,
    sample_size: usize,
    threshold: f64,
}

impl IsolationForest {
    /// Fit a forest on `data`
    pub fn fit(data: &[FeatureVector], params: &AnomalyParams) -> Result<Self, EngineError> {
        let width = validate(data)?;
        if params.trees == 0 {
            return Err(EngineError::Training("forest needs at least one tree".to_string()));
        }

        let mut rng = StdRng::seed_from_u64(params.seed);
        let sample_size = data.len().min(MAX_SAMPLES);
        let depth_limit = (sample_size as f64).log2().ceil() as usize;

        let trees = (0..params.trees)
            .map(|_| {
                let rows: Vec<&FeatureVector> = index::sample(&mut rng, data.len(), sample_size)
                    .into_iter()
                    .map(|i| &data[i])
                    .collect();
                build(&rows, width, 0, depth_limit, &mut rng)
            })
            .collect();

        let mut forest = Self {
            trees,
            sample_size,
            threshold: 0.0,
        };

        let scores: Vec<f64> = data.iter().map(|x| forest.score(x)).collect();
        forest.threshold = quantile(&scores, 1.0 - params.contamination);
        Ok(forest)
    }

    /// Anomaly score: 2^(-E[h(x)] / c(psi))
    pub fn score(&self, x: &[f64]) -> f64 {
        let mean_path = self
            .trees
            .iter()
            .map(|tree| path_length(tree, x, 0))
            .sum::<f64>()
            / self.trees.len() as f64;
        2f64.powf(-mean_path / average_path_length(self.sample_size))
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Outlier iff the score is strictly above the contamination threshold
    pub fn is_outlier(&self, x: &[f64]) -> bool {
        self.score(x) > self.threshold
    }
}

/// Cold-fit anomaly detector
#[derive(Debug, Clone, Copy, Default)]
pub struct AnomalyDetector {
    params: AnomalyParams,
}

impl AnomalyDetector {
    pub fn new(params: AnomalyParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &AnomalyParams {
        &self.params
    }

    /// Fit on the full window and classify its newest vector
    pub fn retrain_and_score(&self, window: &[FeatureVector]) -> Result<AnomalyVerdict, EngineError> {
        let newest = window
            .last()
            .ok_or_else(|| EngineError::Training("empty window".to_string()))?;

        let forest = IsolationForest::fit(window, &self.params)?;
        let score = forest.score(newest);
        let verdict = AnomalyVerdict {
            is_anomaly: score > forest.threshold(),
            score,
            threshold: forest.threshold(),
        };
        debug!(
            window = window.len(),
            score = verdict.score,
            threshold = verdict.threshold,
            "scored newest vector"
        );
        Ok(verdict)
    }
}

/// Check the window is usable and return its vector width
fn validate(data: &[FeatureVector]) -> Result<usize, EngineError> {
    if data.len() < 2 {
        return Err(EngineError::Training(format!(
            "isolation forest needs at least 2 vectors, got {}",
            data.len()
        )));
    }
    let width = data[0].len();
    if width == 0 {
        return Err(EngineError::Training("zero-width feature vectors".to_string()));
    }
    if let Some(bad) = data.iter().position(|x| x.len() != width) {
        return Err(EngineError::SchemaMismatch(format!(
            "vector {bad} has width {}, expected {width}",
            data[bad].len()
        )));
    }
    if data.iter().flatten().any(|v| !v.is_finite()) {
        return Err(EngineError::Training("non-finite feature value".to_string()));
    }
    Ok(width)
}

fn build(rows: &[&FeatureVector], width: usize, depth: usize, limit: usize, rng: &mut StdRng) -> Node {
    if depth >= limit || rows.len() <= 1 {
        return Node::Leaf { size: rows.len() };
    }

    // Only features with spread can split this node
    let candidates: Vec<(usize, f64, f64)> = (0..width)
        .filter_map(|f| {
            let (lo, hi) = rows.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), x| {
                (lo.min(x[f]), hi.max(x[f]))
            });
            (hi > lo).then_some((f, lo, hi))
        })
        .collect();

    if candidates.is_empty() {
        return Node::Leaf { size: rows.len() };
    }

    let (feature, lo, hi) = candidates[rng.gen_range(0..candidates.len())];
    // Convex combination keeps the split finite even when hi - lo overflows
    let t: f64 = rng.gen();
    let value = (lo * (1.0 - t) + hi * t).clamp(lo, hi);
    let (left, right): (Vec<&FeatureVector>, Vec<&FeatureVector>) =
        rows.iter().copied().partition(|x| x[feature] < value);

    if left.is_empty() || right.is_empty() {
        return Node::Leaf { size: rows.len() };
    }

    Node::Split {
        feature,
        value,
        left: Box::new(build(&left, width, depth + 1, limit, rng)),
        right: Box::new(build(&right, width, depth + 1, limit, rng)),
    }
}

fn path_length(node: &Node, x: &[f64], depth: usize) -> f64 {
    match node {
        Node::Leaf { size } => depth as f64 + average_path_length(*size),
        Node::Split {
            feature,
            value,
            left,
            right,
        } => {
            if x[*feature] < *value {
                path_length(left, x, depth + 1)
            } else {
                path_length(right, x, depth + 1)
            }
        }
    }
}

/// Average path length of an unsuccessful BST search over n points
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// Linearly interpolated quantile, q in [0, 1]
fn quantile(values: &[f64], q: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}
