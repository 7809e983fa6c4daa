//! Anomaly scoring -- baseline scaling plus an isolation forest.

pub mod forest;
pub mod scaler;

pub use self::forest::{ForestParams, IsolationForest};
pub use self::scaler::{Scaler, ScalerState};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::ModelConfig;
use crate::features::FeatureVector;

#[derive(Debug, Error, PartialEq)]
pub enum DetectError {
    #[error("model used before it was fitted")]
    NotFitted,
    #[error("feature shape mismatch: fitted on {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<&'static str>,
        got: Vec<&'static str>,
    },
    #[error("baseline is empty")]
    EmptyBaseline,
}

impl DetectError {
    pub(crate) fn shape(expected: &'static [&'static str], got: &'static [&'static str]) -> Self {
        Self::ShapeMismatch {
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}

/// Binary scoring outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Label {
    Normal,
    Anomaly,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Normal => "Normal",
            Label::Anomaly => "Anomaly",
        }
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Label {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Normal" => Ok(Label::Normal),
            "Anomaly" => Ok(Label::Anomaly),
            other => Err(format!("unknown label {other:?}")),
        }
    }
}

/// Label plus the continuous isolation score it was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Verdict {
    pub label: Label,
    pub score: f64,
}

impl Verdict {
    pub fn is_anomaly(&self) -> bool {
        self.label == Label::Anomaly
    }
}

/// Fitted scaler and scoring model, read-only once built.
///
/// Share it behind an `Arc`; scoring takes `&self` and never mutates.
#[derive(Debug, Clone)]
pub struct Detector {
    scaler: Scaler,
    forest: IsolationForest,
}

impl Detector {
    /// Fit the scaler on the raw baseline, then the forest on the scaled baseline.
    pub fn fit(baseline: &[FeatureVector], model: &ModelConfig) -> Result<Self, DetectError> {
        let mut scaler = Scaler::new();
        scaler.fit(baseline)?;
        let scaled = scaler.transform_batch(baseline)?;

        let mut forest = IsolationForest::new(ForestParams::from(model));
        forest.fit(&scaled)?;

        info!(
            baseline = baseline.len(),
            n_estimators = model.n_estimators,
            contamination = model.contamination,
            seed = model.seed,
            "detector fitted"
        );
        Ok(Self { scaler, forest })
    }

    /// Scale then score a raw feature vector.
    pub fn score(&self, raw: &FeatureVector) -> Result<Verdict, DetectError> {
        let scaled = self.scaler.transform(raw)?;
        self.forest.predict(&scaled)
    }

    pub fn score_batch(&self, raw: &[FeatureVector]) -> Result<Vec<Verdict>, DetectError> {
        raw.iter().map(|v| self.score(v)).collect()
    }

    pub fn scaler(&self) -> &Scaler {
        &self.scaler
    }

    pub fn forest(&self) -> &IsolationForest {
        &self.forest
    }
}
