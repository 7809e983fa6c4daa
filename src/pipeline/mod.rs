//! Pipeline orchestration.
//!
//! Observations enter a bounded queue and are drained by a fixed pool of
//! workers. Each worker runs extraction and scoring inline; every anomaly then
//! gets its own tracked task that fetches history, asks for an explanation and
//! appends the record with bounded retries. At most
//! `max_pending_explanations` of those tasks do work at once; the rest wait on a
//! semaphore. Normal flows never leave the worker.

pub mod feed;
pub mod stats;

pub use self::stats::{PipelineStats, StatsSnapshot};

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::detect::{DetectError, Detector, Verdict};
use crate::explain::Explainer;
use crate::features::{extract, FeatureError, Observation};
use crate::storage::{AnomalyCandidate, AnomalyRecord, AnomalyStore, StoreError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline is shut down")]
    Closed,
    #[error("{lost} anomalies could not be persisted")]
    Persist { lost: u64, report: StatsSnapshot },
    #[error("pipeline worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Why an observation left the pipeline without a verdict.
#[derive(Debug, Error, PartialEq)]
pub enum DropReason {
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Model(#[from] DetectError),
}

/// What the synchronous stages decided for one observation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Dropped(Arc<DropReason>),
    Normal(Verdict),
    Anomaly(AnomalyCandidate),
}

/// Shared pipeline context. Workers and explanation tasks hold it by `Arc`.
pub struct Pipeline {
    detector: Arc<Detector>,
    explainer: Explainer,
    store: AnomalyStore,
    stats: Arc<PipelineStats>,
    explanations: Semaphore,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(detector: Detector, explainer: Explainer, store: AnomalyStore, config: PipelineConfig) -> Self {
        Self {
            detector: Arc::new(detector),
            explainer,
            store,
            stats: Arc::new(PipelineStats::new()),
            explanations: Semaphore::new(config.max_pending_explanations.max(1)),
            config,
        }
    }

    pub fn store(&self) -> &AnomalyStore {
        &self.store
    }

    pub fn explainer(&self) -> &Explainer {
        &self.explainer
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    /// Extract and score one observation.
    pub fn process(&self, obs: &Observation) -> Outcome {
        self.stats.record_received();

        let flow = match extract(obs) {
            Ok(flow) => flow,
            Err(e) => {
                self.stats.record_feature_drop(&e);
                warn!(
                    source = obs.source_address.as_deref().unwrap_or(""),
                    error = %e,
                    "observation dropped"
                );
                return Outcome::Dropped(Arc::new(e.into()));
            }
        };

        let verdict = match self.detector.score(&flow.features) {
            Ok(v) => v,
            Err(e) => {
                self.stats.record_model_drop(&e);
                error!(source = %flow.source_address(), error = %e, "scoring failed, observation dropped");
                return Outcome::Dropped(Arc::new(e.into()));
            }
        };

        match AnomalyCandidate::from_verdict(&flow, verdict) {
            Some(candidate) => {
                self.stats.record_anomaly();
                info!(
                    source = %candidate.source_address(),
                    packet_size = candidate.packet_size(),
                    response_time = candidate.response_time(),
                    score = verdict.score,
                    "anomaly detected"
                );
                Outcome::Anomaly(candidate)
            }
            None => {
                self.stats.record_normal();
                debug!(source = %flow.source_address(), score = verdict.score, "flow normal");
                Outcome::Normal(verdict)
            }
        }
    }

    /// Fetch context, explain, and append. The explanation is bounded by the
    /// explainer's timeout; a failed append is retried `store_retries` times.
    pub async fn explain_and_persist(&self, candidate: AnomalyCandidate) -> Result<AnomalyRecord, StoreError> {
        // Never closed.
        let _permit = self.explanations.acquire().await.ok();

        let limit = self.explainer.history_limit();
        let history = match self.blocking(move |store| store.recent_history(limit)).await {
            Ok(history) => history,
            Err(e) => {
                warn!(error = %e, "history unavailable, explaining without context");
                Vec::new()
            }
        };

        let explanation = self.explainer.explain(&candidate, &history).await;
        if explanation.degraded {
            self.stats.record_degraded();
        }

        let candidate = Arc::new(candidate);
        let text: Arc<str> = Arc::from(explanation.text);
        let mut attempt = 0u32;
        loop {
            let (c, t) = (candidate.clone(), text.clone());
            match self.blocking(move |store| store.append(&c, &t)).await {
                Ok(record) => {
                    self.stats.record_persisted();
                    info!(
                        id = record.id,
                        source = %record.source_address,
                        degraded = explanation.degraded,
                        attempts = attempt + 1,
                        "anomaly recorded"
                    );
                    return Ok(record);
                }
                Err(e) if attempt < self.config.store_retries => {
                    attempt += 1;
                    warn!(attempt, retries = self.config.store_retries, error = %e, "append failed, retrying");
                    tokio::time::sleep(self.config.retry_backoff() * attempt).await;
                }
                Err(e) => {
                    self.stats.record_store_failure();
                    error!(
                        source = %candidate.source_address(),
                        attempts = attempt + 1,
                        error = %e,
                        "anomaly lost: store append failed"
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Answer a free-text question against recent history.
    pub async fn ask(&self, question: &str) -> String {
        let limit = self.explainer.history_limit();
        let history = match self.blocking(move |store| store.recent_history(limit)).await {
            Ok(history) => history,
            Err(e) => {
                warn!(error = %e, "history unavailable for chat");
                Vec::new()
            }
        };
        self.explainer.answer(question, &history).await
    }

    /// Run a store call on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&AnomalyStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store)).await?
    }

    /// Spawn the worker pool and return the handle that feeds and drains it.
    pub fn start(self: Arc<Self>) -> PipelineHandle {
        let run_id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(self.config.queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let tracker = TaskTracker::new();
        let mut workers = JoinSet::new();

        for worker in 0..self.config.workers {
            let pipeline = self.clone();
            let receiver = receiver.clone();
            let tracker = tracker.clone();
            workers.spawn(async move {
                debug!(worker, "pipeline worker started");
                loop {
                    let next = receiver.lock().await.recv().await;
                    let Some(obs) = next else { break };

                    if let Outcome::Anomaly(candidate) = pipeline.process(&obs) {
                        let pipeline = pipeline.clone();
                        tracker.spawn(async move {
                            // Failures are logged and counted inside.
                            let _ = pipeline.explain_and_persist(candidate).await;
                        });
                    }
                }
                debug!(worker, "pipeline worker stopped");
            });
        }

        info!(
            %run_id,
            workers = self.config.workers,
            queue_capacity = self.config.queue_capacity,
            explainer = self.explainer.service_name(),
            "pipeline started"
        );

        PipelineHandle {
            run_id,
            sender,
            workers,
            tracker,
            pipeline: self,
        }
    }
}

/// Running pipeline. Drop every sender clone, then call [`PipelineHandle::finish`].
pub struct PipelineHandle {
    run_id: Uuid,
    sender: mpsc::Sender<Observation>,
    workers: JoinSet<()>,
    tracker: TaskTracker,
    pipeline: Arc<Pipeline>,
}

impl PipelineHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// A queue sender for feeds. Waits when the queue is full.
    pub fn sender(&self) -> mpsc::Sender<Observation> {
        self.sender.clone()
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub async fn submit(&self, obs: Observation) -> Result<(), PipelineError> {
        self.sender.send(obs).await.map_err(|_| PipelineError::Closed)
    }

    /// Close the queue, drain the workers, and wait for every explanation task.
    ///
    /// Returns `Err(Persist)` when any detected anomaly failed to reach the store.
    pub async fn finish(mut self) -> Result<StatsSnapshot, PipelineError> {
        drop(self.sender);
        while let Some(joined) = self.workers.join_next().await {
            joined?;
        }

        self.tracker.close();
        self.tracker.wait().await;

        let report = self.pipeline.stats.snapshot();
        info!(
            run_id = %self.run_id,
            received = report.received,
            dropped = report.dropped(),
            anomalies = report.anomalies,
            persisted = report.persisted,
            degraded = report.degraded_explanations,
            "pipeline finished"
        );

        match report.store_failures {
            0 => Ok(report),
            lost => Err(PipelineError::Persist { lost, report }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExplainConfig, ModelConfig};
    use crate::detect::Label;
    use crate::explain::{CompletionRequest, ExplainError, ReasoningService};
    use crate::features::FeatureVector;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl ReasoningService for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn complete(&self, _request: &CompletionRequest) -> Result<String, ExplainError> {
            Ok("suspicious burst".to_string())
        }
    }

    /// Counts calls and never answers within the timeout.
    #[derive(Default)]
    struct Hang {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ReasoningService for Hang {
        fn name(&self) -> &'static str {
            "hang"
        }

        async fn complete(&self, _request: &CompletionRequest) -> Result<String, ExplainError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(String::new())
        }
    }

    /// Tracks how many calls are in flight at once.
    #[derive(Default)]
    struct Gauge {
        active: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ReasoningService for Gauge {
        fn name(&self) -> &'static str {
            "gauge"
        }

        async fn complete(&self, _request: &CompletionRequest) -> Result<String, ExplainError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(40)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok("burst".to_string())
        }
    }

    fn detector() -> Detector {
        let baseline: Vec<FeatureVector> = feed::narrow_band(100, 42)
            .iter()
            .map(|o| FeatureVector::traffic(o.packet_size, o.response_time))
            .collect();
        Detector::fit(&baseline, &ModelConfig::default()).unwrap()
    }

    fn pipeline(service: Arc<dyn ReasoningService>, dir: &tempfile::TempDir) -> Arc<Pipeline> {
        let config = PipelineConfig {
            workers: 2,
            queue_capacity: 8,
            retry_backoff_ms: 1,
            ..PipelineConfig::default()
        };
        pipeline_with(service, dir, config)
    }

    fn pipeline_with(
        service: Arc<dyn ReasoningService>,
        dir: &tempfile::TempDir,
        config: PipelineConfig,
    ) -> Arc<Pipeline> {
        let store = AnomalyStore::open(&dir.path().join("anomalies.db")).unwrap();
        let explain = ExplainConfig {
            timeout_secs: 1,
            ..ExplainConfig::default()
        };
        Arc::new(Pipeline::new(detector(), Explainer::new(service, &explain), store, config))
    }

    #[test]
    fn test_process_drops_invalid_address() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(Arc::new(Echo), &dir);
        let out = p.process(&Observation::new(Some("999.999.1.1"), 5000.0, 5000.0));
        assert!(matches!(out, Outcome::Dropped(ref r) if matches!(**r, DropReason::Feature(FeatureError::InvalidAddress(_)))));
        let snap = p.stats().snapshot();
        assert_eq!(snap.dropped_invalid_address, 1);
        assert_eq!(snap.anomalies, 0);
    }

    #[test]
    fn test_process_labels() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(Arc::new(Echo), &dir);
        assert!(matches!(
            p.process(&Observation::new(Some("192.168.1.9"), 50.0, 50.0)),
            Outcome::Normal(Verdict { label: Label::Normal, .. })
        ));
        assert!(matches!(
            p.process(&Observation::new(Some("203.0.113.9"), 400.0, 400.0)),
            Outcome::Anomaly(_)
        ));
    }

    #[tokio::test]
    async fn test_explain_and_persist_records_explanation() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(Arc::new(Echo), &dir);
        let Outcome::Anomaly(candidate) = p.process(&Observation::new(Some("203.0.113.4"), 400.0, 400.0)) else {
            panic!("expected anomaly");
        };
        let record = p.explain_and_persist(candidate).await.unwrap();
        assert_eq!(record.explanation, "suspicious burst");
        assert_eq!(record.source_address, "203.0.113.4");
        assert_eq!(p.store().count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_timeout_still_persists_with_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let hang = Arc::new(Hang::default());
        let p = pipeline(hang.clone(), &dir);
        let handle = p.clone().start();

        handle
            .submit(Observation::new(Some("203.0.113.7"), 450.0, 420.0))
            .await
            .unwrap();
        let report = handle.finish().await.unwrap();

        assert_eq!(report.persisted, 1);
        assert_eq!(report.degraded_explanations, 1);
        assert_eq!(hang.calls.load(Ordering::SeqCst), 1);
        let records = p.store().all().unwrap();
        assert!(records[0].explanation.starts_with("explanation unavailable: timed out"));
    }

    #[tokio::test]
    async fn test_normal_traffic_leaves_store_empty() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(Arc::new(Echo), &dir);
        let handle = p.clone().start();
        for obs in [
            Observation::new(Some("192.168.1.1"), 50.0, 50.0),
            Observation::new(Some("192.168.1.2"), 52.0, 47.0),
            Observation::new(None, 49.0, 51.0),
        ] {
            handle.submit(obs).await.unwrap();
        }
        let report = handle.finish().await.unwrap();
        assert_eq!(report.received, 3);
        assert_eq!(report.normal, 3);
        assert_eq!(p.store().count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ask_uses_recent_history() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(Arc::new(crate::explain::LocalService), &dir);
        p.store()
            .append(&crate::storage::tests::candidate("10.0.0.1", 1.0, 2.0), "earlier")
            .unwrap();
        let reply = p.ask("what happened?").await;
        assert!(reply.contains("1 recent anomalies"), "{reply}");
        assert_eq!(p.ask("  ").await, crate::explain::EMPTY_QUESTION_REPLY);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pending_explanations_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let gauge = Arc::new(Gauge::default());
        let config = PipelineConfig {
            workers: 4,
            queue_capacity: 32,
            retry_backoff_ms: 1,
            max_pending_explanations: 2,
            ..PipelineConfig::default()
        };
        let p = pipeline_with(gauge.clone(), &dir, config);
        let handle = p.clone().start();

        for i in 0..12 {
            handle
                .submit(Observation::new(Some(&format!("203.0.113.{i}")), 500.0 + i as f64, 450.0))
                .await
                .unwrap();
        }
        let report = handle.finish().await.unwrap();

        assert_eq!(report.anomalies, 12);
        assert_eq!(report.persisted, 12);
        assert_eq!(gauge.calls.load(Ordering::SeqCst), 12);
        let peak = gauge.peak.load(Ordering::SeqCst);
        assert!((1..=2).contains(&peak), "peak concurrency {peak}");
    }
}
