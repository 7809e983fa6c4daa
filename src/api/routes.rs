//! API route definitions.

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;
use super::ApiError;
use crate::features::Observation;
use crate::storage::{export, AnomalyStore, StoreError};

/// Largest page `GET /anomalies` will return.
const MAX_LIMIT: usize = 1000;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/anomalies", get(list_anomalies))
        .route("/anomalies/export", get(export_csv))
        .route("/chat", post(chat))
        .route("/stats", get(stats))
        .route("/observations", post(ingest))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

async fn with_store<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&AnomalyStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = state.pipeline.store().clone();
    let out = tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(StoreError::from)??;
    Ok(out)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "explainer": state.pipeline.explainer().service_name(),
            "ingest": state.ingest.is_some(),
        },
        "meta": meta()
    }))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
}

async fn list_anomalies(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Value>, ApiError> {
    let limit = params
        .limit
        .unwrap_or_else(|| state.pipeline.explainer().history_limit())
        .min(MAX_LIMIT);
    let records = with_store(&state, move |s| s.recent_history(limit)).await?;
    let total = records.len();
    Ok(Json(json!({
        "data": records,
        "meta": { "total": total, "limit": limit }
    })))
}

async fn export_csv(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let records = with_store(&state, |s| s.all()).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (header::CONTENT_DISPOSITION, "attachment; filename=\"anomalies.csv\""),
        ],
        export::to_csv_string(&records),
    ))
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    #[serde(default)]
    question: String,
}

async fn chat(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> Json<Value> {
    let response = state.pipeline.ask(&req.question).await;
    Json(json!({ "response": response }))
}

async fn stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "data": state.pipeline.stats().snapshot(),
        "meta": meta()
    }))
}

/// One observation or a batch.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IngestBody {
    One(Observation),
    Many(Vec<Observation>),
}

async fn ingest(
    State(state): State<AppState>,
    Json(body): Json<IngestBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let sender = state
        .ingest
        .as_ref()
        .ok_or(ApiError::Unavailable("ingest is disabled"))?;

    let batch = match body {
        IngestBody::One(obs) => vec![obs],
        IngestBody::Many(batch) => batch,
    };
    if batch.is_empty() {
        return Err(ApiError::BadRequest("empty batch".to_string()));
    }

    let mut queued = 0usize;
    for obs in batch {
        sender
            .send(obs)
            .await
            .map_err(|_| ApiError::Unavailable("pipeline is shut down"))?;
        queued += 1;
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "data": { "queued": queued }, "meta": meta() })),
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tokio::sync::mpsc;
    use tower::ServiceExt; // for `oneshot`

    use super::super::router;
    use super::*;
    use crate::config::{ExplainConfig, ModelConfig, PipelineConfig};
    use crate::detect::Detector;
    use crate::explain::{Explainer, LocalService};
    use crate::features::FeatureVector;
    use crate::pipeline::{feed, Pipeline};
    use crate::storage::tests::candidate;

    fn pipeline(dir: &tempfile::TempDir) -> Arc<Pipeline> {
        let baseline: Vec<FeatureVector> = feed::narrow_band(64, 1)
            .iter()
            .map(|o| FeatureVector::traffic(o.packet_size, o.response_time))
            .collect();
        let model = ModelConfig {
            n_estimators: 20,
            ..ModelConfig::default()
        };
        let detector = Detector::fit(&baseline, &model).unwrap();
        let store = AnomalyStore::open(&dir.path().join("anomalies.db")).unwrap();
        let explainer = Explainer::new(Arc::new(LocalService), &ExplainConfig::default());
        Arc::new(Pipeline::new(detector, explainer, store, PipelineConfig::default()))
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), 1_000_000)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(AppState::new(pipeline(&dir), None));

        let request = Request::builder()
            .uri("/api/v1/health")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["data"]["status"], "ok");
        assert_eq!(json["data"]["explainer"], "local");
        assert_eq!(json["data"]["ingest"], false);
    }

    #[tokio::test]
    async fn test_anomalies_most_recent_first() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(&dir);
        for i in 0..3 {
            p.store()
                .append(&candidate("10.0.0.1", 100.0 + i as f64, 5.0), &format!("e{i}"))
                .unwrap();
        }
        let app = router(AppState::new(p, None));

        let request = Request::builder()
            .uri("/api/v1/anomalies?limit=2")
            .body(Body::empty())
            .unwrap();
        let json = body_json(app.oneshot(request).await.unwrap()).await;
        let data = json["data"].as_array().unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data[0]["id"], 3);
        assert_eq!(data[0]["status"], "Anomaly");
        assert_eq!(data[1]["explanation"], "e1");
    }

    #[tokio::test]
    async fn test_export_returns_csv() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(&dir);
        p.store()
            .append(&candidate("10.0.0.2", 9.0, 8.0), "line one, with comma")
            .unwrap();
        let app = router(AppState::new(p, None));

        let request = Request::builder()
            .uri("/api/v1/anomalies/export")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/csv; charset=utf-8"
        );
        let body = axum::body::to_bytes(response.into_body(), 1_000_000)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some(export::CSV_HEADER));
        assert!(lines.next().unwrap().ends_with("\"line one, with comma\""));
    }

    #[tokio::test]
    async fn test_chat_blank_question() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(AppState::new(pipeline(&dir), None));

        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/chat")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"question":"  "}"#))
            .unwrap();
        let json = body_json(app.oneshot(request).await.unwrap()).await;
        assert_eq!(json["response"], crate::explain::EMPTY_QUESTION_REPLY);
    }

    #[tokio::test]
    async fn test_ingest_queues_observations() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let app = router(AppState::new(pipeline(&dir), Some(tx)));

        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/observations")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                r#"[{"source_address":"10.0.0.9","packet_size":60,"response_time":30},{"packet_size":1,"response_time":2}]"#,
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["data"]["queued"], 2);

        assert_eq!(
            rx.recv().await.unwrap().source_address.as_deref(),
            Some("10.0.0.9")
        );
        assert_eq!(rx.recv().await.unwrap().source_address, None);
    }

    #[tokio::test]
    async fn test_ingest_disabled_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(AppState::new(pipeline(&dir), None));

        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/observations")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"packet_size":1,"response_time":2}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(AppState::new(pipeline(&dir), None));
        let request = Request::builder()
            .uri("/nope")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
