//! Isolation forest scoring model.
//!
//! Each tree recursively splits a random sub-sample on a random feature at a
//! random cut point until every point is isolated or the height limit is hit.
//! Points that isolate in few splits sit away from the bulk of the baseline and
//! get a score close to 1; points deep inside it score well below 0.5.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::config::ModelConfig;
use crate::detect::{DetectError, Label, Verdict};
use crate::features::FeatureVector;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Construction parameters. Fixed once the forest exists.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForestParams {
    pub n_estimators: usize,
    pub contamination: f64,
    pub max_samples: usize,
    pub seed: u64,
}

impl From<&ModelConfig> for ForestParams {
    fn from(cfg: &ModelConfig) -> Self {
        Self {
            n_estimators: cfg.n_estimators,
            contamination: cfg.contamination,
            max_samples: cfg.max_samples,
            seed: cfg.seed,
        }
    }
}

impl ForestParams {
    /// Smallest baseline that fits without the undersized-baseline warning.
    pub fn recommended_baseline(&self) -> usize {
        self.n_estimators.saturating_mul(2)
    }
}

#[derive(Debug, Clone)]
enum Node {
    Split {
        feature: usize,
        cut: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        size: usize,
    },
}

/// One isolation tree, stored as a node arena rooted at index 0.
#[derive(Debug, Clone)]
struct IsolationTree {
    nodes: Vec<Node>,
}

impl IsolationTree {
    fn build(data: &[&[f64]], sample: Vec<usize>, height_limit: usize, rng: &mut StdRng) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        tree.grow(data, sample, 0, height_limit, rng);
        tree
    }

    fn grow(
        &mut self,
        data: &[&[f64]],
        idx: Vec<usize>,
        depth: usize,
        height_limit: usize,
        rng: &mut StdRng,
    ) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf { size: idx.len() });

        if depth >= height_limit || idx.len() <= 1 {
            return id;
        }

        // Only features that still vary inside this node can split it.
        let width = data[idx[0]].len();
        let candidates: Vec<(usize, f64, f64)> = (0..width)
            .filter_map(|f| {
                let (lo, hi) = idx.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &i| {
                    (lo.min(data[i][f]), hi.max(data[i][f]))
                });
                (lo.is_finite() && hi.is_finite() && hi > lo).then_some((f, lo, hi))
            })
            .collect();
        if candidates.is_empty() {
            return id;
        }

        let (feature, lo, hi) = candidates[rng.gen_range(0..candidates.len())];
        let cut = rng.gen_range(lo..hi);
        let (left_idx, right_idx): (Vec<usize>, Vec<usize>) =
            idx.into_iter().partition(|&i| data[i][feature] < cut);

        let left = self.grow(data, left_idx, depth + 1, height_limit, rng);
        let right = self.grow(data, right_idx, depth + 1, height_limit, rng);
        self.nodes[id] = Node::Split {
            feature,
            cut,
            left,
            right,
        };
        id
    }

    fn path_length(&self, x: &[f64]) -> f64 {
        let mut node = 0;
        let mut depth = 0.0;
        loop {
            match self.nodes[node] {
                Node::Split {
                    feature,
                    cut,
                    left,
                    right,
                } => {
                    node = if x[feature] < cut { left } else { right };
                    depth += 1.0;
                }
                Node::Leaf { size } => return depth + average_path_length(size),
            }
        }
    }
}

/// Average path length of an unsuccessful BST search over `n` points.
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

/// Linear-interpolated quantile of an ascending slice, `q` in [0, 1].
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

#[derive(Debug, Clone)]
struct Fitted {
    fields: &'static [&'static str],
    trees: Vec<IsolationTree>,
    sample_size: usize,
    threshold: f64,
}

/// Unsupervised ensemble labeling scaled feature vectors Normal or Anomaly.
#[derive(Debug, Clone)]
pub struct IsolationForest {
    params: ForestParams,
    fitted: Option<Fitted>,
}

impl IsolationForest {
    pub fn new(params: ForestParams) -> Self {
        Self {
            params,
            fitted: None,
        }
    }

    pub fn params(&self) -> &ForestParams {
        &self.params
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    /// Score above which a vector is labeled Anomaly.
    pub fn threshold(&self) -> Option<f64> {
        self.fitted.as_ref().map(|f| f.threshold)
    }

    /// Build the ensemble from a scaled baseline and derive the label threshold
    /// from the configured contamination.
    pub fn fit(&mut self, batch: &[FeatureVector]) -> Result<(), DetectError> {
        let first = batch.first().ok_or(DetectError::EmptyBaseline)?;
        let fields = first.fields();
        if let Some(bad) = batch.iter().find(|v| !v.same_shape(fields)) {
            return Err(DetectError::shape(fields, bad.fields()));
        }

        let recommended = self.params.recommended_baseline();
        if batch.len() < recommended {
            warn!(
                baseline = batch.len(),
                recommended,
                n_estimators = self.params.n_estimators,
                "baseline is small for the ensemble size"
            );
        }

        let data: Vec<&[f64]> = batch.iter().map(FeatureVector::values).collect();
        let sample_size = self.params.max_samples.min(data.len()).max(1);
        let height_limit = (sample_size as f64).log2().ceil().max(1.0) as usize;

        let mut rng = StdRng::seed_from_u64(self.params.seed);
        let trees = (0..self.params.n_estimators)
            .map(|_| {
                let sample = rand::seq::index::sample(&mut rng, data.len(), sample_size).into_vec();
                IsolationTree::build(&data, sample, height_limit, &mut rng)
            })
            .collect();

        let mut fitted = Fitted {
            fields,
            trees,
            sample_size,
            threshold: f64::INFINITY,
        };

        let mut scores: Vec<f64> = data.iter().map(|x| fitted.score(x)).collect();
        scores.sort_by(f64::total_cmp);
        fitted.threshold = quantile(&scores, 1.0 - self.params.contamination);

        debug!(
            trees = self.params.n_estimators,
            sample_size,
            height_limit,
            threshold = fitted.threshold,
            "isolation forest fitted"
        );
        self.fitted = Some(fitted);
        Ok(())
    }

    /// Score and label one scaled vector.
    pub fn predict(&self, v: &FeatureVector) -> Result<Verdict, DetectError> {
        let fitted = self.fitted.as_ref().ok_or(DetectError::NotFitted)?;
        if !v.same_shape(fitted.fields) {
            return Err(DetectError::shape(fitted.fields, v.fields()));
        }
        let score = fitted.score(v.values());
        let label = if score > fitted.threshold {
            Label::Anomaly
        } else {
            Label::Normal
        };
        Ok(Verdict { label, score })
    }

    pub fn predict_batch(&self, batch: &[FeatureVector]) -> Result<Vec<Verdict>, DetectError> {
        batch.iter().map(|v| self.predict(v)).collect()
    }
}

impl Fitted {
    fn score(&self, x: &[f64]) -> f64 {
        let total: f64 = self.trees.iter().map(|t| t.path_length(x)).sum();
        let mean = total / self.trees.len() as f64;
        let norm = average_path_length(self.sample_size);
        if norm > 0.0 {
            2f64.powf(-mean / norm)
        } else {
            0.5
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(n_estimators: usize, contamination: f64, seed: u64) -> ForestParams {
        ForestParams {
            n_estimators,
            contamination,
            max_samples: 256,
            seed,
        }
    }

    /// A 10x10 grid around the origin plus a far corner point.
    fn grid_with_outlier() -> Vec<FeatureVector> {
        let mut batch: Vec<FeatureVector> = (0..100)
            .map(|i| FeatureVector::traffic((i % 10) as f64 / 10.0, (i / 10) as f64 / 10.0))
            .collect();
        batch.push(FeatureVector::traffic(8.0, 8.0));
        batch
    }

    #[test]
    fn test_average_path_length() {
        assert_eq!(average_path_length(0), 0.0);
        assert_eq!(average_path_length(1), 0.0);
        assert_eq!(average_path_length(2), 1.0);
        // c(256) is roughly 10.24
        assert!((average_path_length(256) - 10.24).abs() < 0.01);
    }

    #[test]
    fn test_quantile_interpolates() {
        let sorted = [0.0, 1.0, 2.0, 3.0];
        assert_eq!(quantile(&sorted, 0.0), 0.0);
        assert_eq!(quantile(&sorted, 1.0), 3.0);
        assert!((quantile(&sorted, 0.5) - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_predict_before_fit() {
        let forest = IsolationForest::new(params(10, 0.05, 1));
        assert_eq!(
            forest.predict(&FeatureVector::traffic(0.0, 0.0)).unwrap_err(),
            DetectError::NotFitted
        );
    }

    #[test]
    fn test_fit_empty() {
        let mut forest = IsolationForest::new(params(10, 0.05, 1));
        assert_eq!(forest.fit(&[]), Err(DetectError::EmptyBaseline));
    }

    #[test]
    fn test_outlier_scores_highest() {
        let batch = grid_with_outlier();
        let mut forest = IsolationForest::new(params(100, 0.01, 7));
        forest.fit(&batch).unwrap();

        let verdicts = forest.predict_batch(&batch).unwrap();
        let outlier = verdicts.last().unwrap();
        assert_eq!(outlier.label, Label::Anomaly);
        assert!(verdicts[..100].iter().all(|v| v.score < outlier.score));
    }

    #[test]
    fn test_same_seed_same_labels() {
        let batch = grid_with_outlier();
        let run = |seed| {
            let mut forest = IsolationForest::new(params(50, 0.05, seed));
            forest.fit(&batch).unwrap();
            forest
                .predict_batch(&batch)
                .unwrap()
                .into_iter()
                .map(|v| (v.label, v.score.to_bits()))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(42), run(42));
    }

    #[test]
    fn test_params_are_kept() {
        let mut forest = IsolationForest::new(params(25, 0.04, 3));
        forest.fit(&grid_with_outlier()).unwrap();
        assert_eq!(forest.params().n_estimators, 25);
        assert_eq!(forest.params().contamination, 0.04);
    }

    #[test]
    fn test_constant_baseline_does_not_split() {
        let batch: Vec<FeatureVector> = (0..20).map(|_| FeatureVector::traffic(1.0, 1.0)).collect();
        let mut forest = IsolationForest::new(params(10, 0.05, 1));
        forest.fit(&batch).unwrap();
        let v = forest.predict(&FeatureVector::traffic(1.0, 1.0)).unwrap();
        assert_eq!(v.label, Label::Normal);
    }
}
