//! flowwatch -- network anomaly scoring and alerting.
//!
//! Traffic observations are validated, scaled against a baseline, scored by an
//! isolation forest, and every anomaly is explained by a reasoning service and
//! appended to a durable SQLite history that the HTTP API serves back.

pub mod api;
pub mod config;
pub mod detect;
pub mod explain;
pub mod features;
pub mod pipeline;
pub mod storage;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::FlowwatchConfig;
use crate::detect::Detector;
use crate::explain::Explainer;
use crate::pipeline::{Pipeline, StatsSnapshot};
use crate::storage::AnomalyStore;

/// Fit the detector on the configured baseline and wire it to the store and explainer.
pub fn build_pipeline(config: &FlowwatchConfig) -> Result<Arc<Pipeline>> {
    let baseline = pipeline::feed::load_baseline(&config.baseline)?;
    let detector = Detector::fit(&baseline, &config.model).context("failed to fit detector")?;

    tracing::info!(db_path = %config.storage.db_path.display(), "Opening anomaly store");
    let store = AnomalyStore::open(&config.storage.db_path)?;
    let explainer = Explainer::from_config(&config.explain).context("failed to build explainer")?;

    Ok(Arc::new(Pipeline::new(
        detector,
        explainer,
        store,
        config.pipeline.clone(),
    )))
}

/// Start the flowwatch daemon: pipeline workers plus the HTTP API.
///
/// Runs until SIGINT/SIGTERM, then drains the queue and waits for pending
/// explanations before returning.
pub async fn serve(config: FlowwatchConfig) -> Result<StatsSnapshot> {
    let addr: SocketAddr = config
        .api
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {:?}", config.api.bind))?;

    let pipeline = build_pipeline(&config)?;
    let handle = pipeline.clone().start();

    let app = api::router(api::state::AppState::new(pipeline, Some(handle.sender())));

    tracing::info!(%addr, "flowwatch listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("HTTP server stopped, draining pipeline");
    let report = handle.finish().await?;
    Ok(report)
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl_c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
