//! Dashboard aggregation endpoints. Every handler here is a thin read over
//! [`crate::metrics::MetricsCollector`] — no mutation, no routing decisions.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::pipeline::PipelineState;

#[derive(Deserialize)]
pub struct TimeseriesParams {
    #[serde(default = "default_bucket_min")]
    bucket_min: i64,
}

fn default_bucket_min() -> i64 {
    5
}

#[derive(Deserialize)]
pub struct LimitParams {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    100
}

#[derive(Deserialize)]
pub struct SystemLogParams {
    #[serde(default = "default_limit")]
    limit: usize,
    level: Option<String>,
}

/// `GET /dashboard/api/overview`
pub async fn overview(State(state): State<Arc<PipelineState>>) -> impl IntoResponse {
    Json(state.metrics.overview().await)
}

/// `GET /dashboard/api/providers`
pub async fn providers(State(state): State<Arc<PipelineState>>) -> impl IntoResponse {
    Json(state.metrics.per_provider().await)
}

/// `GET /dashboard/api/models`
pub async fn models(State(state): State<Arc<PipelineState>>) -> impl IntoResponse {
    Json(state.metrics.per_model().await)
}

/// `GET /dashboard/api/financial`
pub async fn financial(State(state): State<Arc<PipelineState>>) -> impl IntoResponse {
    Json(state.metrics.financial().await)
}

/// `GET /dashboard/api/timeseries?bucket_min=5`
pub async fn timeseries(
    State(state): State<Arc<PipelineState>>,
    Query(params): Query<TimeseriesParams>,
) -> impl IntoResponse {
    Json(state.metrics.timeseries(params.bucket_min).await)
}

/// `GET /dashboard/api/errors`
pub async fn errors(State(state): State<Arc<PipelineState>>) -> impl IntoResponse {
    let histogram: Vec<_> = state
        .metrics
        .errors()
        .await
        .into_iter()
        .map(|(error_type, count)| json!({ "error_type": error_type, "count": count }))
        .collect();
    Json(json!({ "errors": histogram }))
}

/// `GET /dashboard/api/policies`
pub async fn policies(State(state): State<Arc<PipelineState>>) -> impl IntoResponse {
    let histogram: Vec<_> = state
        .metrics
        .policies()
        .await
        .into_iter()
        .map(|(policy, count)| json!({ "policy": policy, "count": count }))
        .collect();
    Json(json!({ "policies": histogram }))
}

/// `GET /dashboard/api/fallbacks`
pub async fn fallbacks(State(state): State<Arc<PipelineState>>) -> impl IntoResponse {
    Json(state.metrics.fallbacks().await)
}

/// `GET /dashboard/api/request-log?limit=100`
pub async fn request_log(
    State(state): State<Arc<PipelineState>>,
    Query(params): Query<LimitParams>,
) -> impl IntoResponse {
    Json(state.metrics.request_log(params.limit).await)
}

/// `GET /dashboard/api/system-log?limit=100&level=error`
pub async fn system_log(
    State(state): State<Arc<PipelineState>>,
    Query(params): Query<SystemLogParams>,
) -> impl IntoResponse {
    Json(state.metrics.system_log(params.limit, params.level.as_deref()).await)
}
