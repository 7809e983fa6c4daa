//! Pipeline counters.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::detect::DetectError;
use crate::features::FeatureError;

/// Lock-free counters updated by workers and explanation tasks.
#[derive(Debug)]
pub struct PipelineStats {
    started_at: DateTime<Utc>,
    received: AtomicU64,
    dropped_address: AtomicU64,
    dropped_feature: AtomicU64,
    dropped_model: AtomicU64,
    normal: AtomicU64,
    anomalies: AtomicU64,
    persisted: AtomicU64,
    degraded: AtomicU64,
    store_failures: AtomicU64,
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            received: AtomicU64::new(0),
            dropped_address: AtomicU64::new(0),
            dropped_feature: AtomicU64::new(0),
            dropped_model: AtomicU64::new(0),
            normal: AtomicU64::new(0),
            anomalies: AtomicU64::new(0),
            persisted: AtomicU64::new(0),
            degraded: AtomicU64::new(0),
            store_failures: AtomicU64::new(0),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_received(&self) {
        bump(&self.received);
    }

    pub(crate) fn record_feature_drop(&self, err: &FeatureError) {
        match err {
            FeatureError::InvalidAddress(_) => bump(&self.dropped_address),
            FeatureError::InvalidFeature { .. } => bump(&self.dropped_feature),
        }
    }

    pub(crate) fn record_model_drop(&self, _err: &DetectError) {
        bump(&self.dropped_model);
    }

    pub(crate) fn record_normal(&self) {
        bump(&self.normal);
    }

    pub(crate) fn record_anomaly(&self) {
        bump(&self.anomalies);
    }

    pub(crate) fn record_persisted(&self) {
        bump(&self.persisted);
    }

    pub(crate) fn record_degraded(&self) {
        bump(&self.degraded);
    }

    pub(crate) fn record_store_failure(&self) {
        bump(&self.store_failures);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            started_at: self.started_at,
            received: load(&self.received),
            dropped_invalid_address: load(&self.dropped_address),
            dropped_invalid_feature: load(&self.dropped_feature),
            dropped_model_error: load(&self.dropped_model),
            normal: load(&self.normal),
            anomalies: load(&self.anomalies),
            persisted: load(&self.persisted),
            degraded_explanations: load(&self.degraded),
            store_failures: load(&self.store_failures),
        }
    }
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub started_at: DateTime<Utc>,
    pub received: u64,
    pub dropped_invalid_address: u64,
    pub dropped_invalid_feature: u64,
    pub dropped_model_error: u64,
    pub normal: u64,
    pub anomalies: u64,
    pub persisted: u64,
    pub degraded_explanations: u64,
    pub store_failures: u64,
}

impl StatsSnapshot {
    pub fn dropped(&self) -> u64 {
        self.dropped_invalid_address + self.dropped_invalid_feature + self.dropped_model_error
    }

    /// Anomalies detected but neither persisted nor reported lost yet.
    pub fn in_flight(&self) -> u64 {
        self.anomalies
            .saturating_sub(self.persisted)
            .saturating_sub(self.store_failures)
    }
}
