//! API route definitions.

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;
use crate::analysis::{render_prometheus, AlertsReport};
use crate::storage::{self, events};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/alerts", get(alerts))
        .route("/runs", get(runs))
}

/// Handler failure rendered as a JSON error body.
pub struct ApiError(anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for ApiError {
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self.0, "API request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("{:#}", self.0) })),
        )
            .into_response()
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

#[derive(Debug, Deserialize)]
struct AlertsQuery {
    measurement_id: Option<u64>,
    #[serde(default)]
    detailed: bool,
}

async fn alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertsQuery>,
) -> Result<Json<Value>, ApiError> {
    let docs = events::read_event_documents(&state.events_dir).await?;
    let report = AlertsReport::build(
        docs.iter().map(|d| (d.measurement_id, d.events.as_slice())),
        query.measurement_id,
        query.detailed,
    );
    let total = report.global.total_anomalies;
    Ok(Json(json!({ "data": report, "meta": { "total": total } })))
}

#[derive(Debug, Deserialize)]
struct RunsQuery {
    #[serde(default = "default_runs_limit")]
    limit: usize,
}

fn default_runs_limit() -> usize {
    20
}

async fn runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Value>, ApiError> {
    let pool = state.pool.clone();
    let limit = query.limit;
    let runs = tokio::task::spawn_blocking(move || storage::recent_runs(&pool, limit)).await??;

    let data: Vec<Value> = runs
        .iter()
        .map(|r| {
            json!({
                "run_id": r.run_id,
                "documents": r.documents,
                "skipped": r.skipped,
                "sample_warnings": r.sample_warnings,
                "anomalies": r.anomalies,
                "started_at": r.started_at.to_rfc3339(),
                "finished_at": r.finished_at.to_rfc3339(),
            })
        })
        .collect();
    Ok(Json(json!({ "data": data, "meta": { "total": runs.len() } })))
}

pub async fn metrics(State(state): State<AppState>) -> Result<Response, ApiError> {
    let docs = events::read_event_documents(&state.events_dir).await?;
    let results = events::read_results(&state.results_dir).await?;
    let body = render_prometheus(&docs, &results)?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}
