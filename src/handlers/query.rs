use axum::{extract::State, Json};
use std::sync::Arc;

use crate::query::{
    QueryMetricsRequest, QueryMetricsResponse, QueryRequestLogsRequest, QueryRequestLogsResponse,
};
use crate::AppState;

use super::ApiError;

// ─── POST /api/metrics/query ─────────────────────────────────────

pub async fn query_metrics(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueryMetricsRequest>,
) -> Result<Json<QueryMetricsResponse>, ApiError> {
    Ok(Json(state.query.query_series(&req).await?))
}

// ─── POST /api/logs/query ────────────────────────────────────────

pub async fn query_logs(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueryRequestLogsRequest>,
) -> Result<Json<QueryRequestLogsResponse>, ApiError> {
    Ok(Json(state.query.query_logs(&req).await?))
}
