//! Metrics read endpoints: live snapshot, history, summary, alerts and the
//! Prometheus scrape.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use crate::error::{ApiError, ApiErrorBody};
use crate::metrics::exposition;
use crate::metrics::{Alert, MetricsSnapshot, MetricsSummary};
use crate::AppState;

const DEFAULT_SUMMARY_MINUTES: u64 = 60;
const DEFAULT_LIMIT: usize = 20;
const MAX_ALERTS: usize = 100;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/metrics", get(current))
        .route("/metrics/summary", get(summary))
        .route("/metrics/history", get(history))
        .route("/metrics/alerts", get(alerts))
        .route("/metrics/prometheus", get(prometheus))
}

#[derive(Debug, Deserialize)]
pub struct SummaryParams {
    pub minutes: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct LimitParams {
    pub limit: Option<usize>,
}

#[utoipa::path(
    get,
    path = "/metrics",
    tag = "Metrics",
    responses(
        (status = 200, description = "Live snapshot since the last stored one", body = MetricsSnapshot),
    ),
)]
pub async fn current(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.current())
}

#[utoipa::path(
    get,
    path = "/metrics/summary",
    tag = "Metrics",
    params(
        ("minutes" = Option<u64>, Query, description = "Look-back window in minutes (default 60)"),
    ),
    responses(
        (status = 200, description = "Rolled-up summary", body = MetricsSummary),
        (status = 404, description = "No snapshot in the window", body = ApiErrorBody),
    ),
)]
pub async fn summary(
    State(state): State<AppState>,
    Query(params): Query<SummaryParams>,
) -> Result<Json<MetricsSummary>, ApiError> {
    let minutes = params.minutes.unwrap_or(DEFAULT_SUMMARY_MINUTES).max(1);
    state
        .metrics
        .summary(minutes)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("No snapshots in the requested window"))
}

#[utoipa::path(
    get,
    path = "/metrics/history",
    tag = "Metrics",
    params(
        ("limit" = Option<usize>, Query, description = "Number of snapshots (default 20)"),
    ),
    responses(
        (status = 200, description = "Most recent snapshots, oldest first", body = [MetricsSnapshot]),
    ),
)]
pub async fn history(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> Json<Vec<Arc<MetricsSnapshot>>> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIMIT)
        .clamp(1, state.config.metrics.history_capacity.max(1));
    Json(state.metrics.recent(limit))
}

#[utoipa::path(
    get,
    path = "/metrics/alerts",
    tag = "Metrics",
    params(
        ("limit" = Option<usize>, Query, description = "Number of alerts (1-100, default 20)"),
    ),
    responses(
        (status = 200, description = "Recent alerts, newest first", body = [Alert]),
    ),
)]
pub async fn alerts(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> Json<Vec<Alert>> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_ALERTS);
    Json(state.metrics.alerts(limit))
}

#[utoipa::path(
    get,
    path = "/metrics/prometheus",
    tag = "Metrics",
    responses(
        (status = 200, description = "Prometheus text exposition", content_type = "text/plain"),
        (status = 500, description = "Encoding failed", body = ApiErrorBody),
    ),
)]
pub async fn prometheus(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let live = state.metrics.current();
    let body = exposition::render(&live).map_err(|e| {
        tracing::error!(error = %e, "failed to render prometheus metrics");
        ApiError::internal("Failed to render metrics")
    })?;
    Ok(([(CONTENT_TYPE, exposition::CONTENT_TYPE)], body))
}
