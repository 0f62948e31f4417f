use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::store::{run_blocking, DBStatus, MetricsStore};
use crate::AppState;

use super::ApiError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestConnectionRequest {
    pub db_path: String,
}

#[derive(Debug, Serialize)]
pub struct TestConnectionResponse {
    pub ok: bool,
    pub message: String,
}

// ─── GET /api/db/status ──────────────────────────────────────────

/// Always answers: disabled and broken stores are reported in the body.
pub async fn db_status(State(state): State<Arc<AppState>>) -> Result<Json<DBStatus>, ApiError> {
    let status = state.persistence.status(state.query.deadline()).await?;
    Ok(Json(status))
}

// ─── POST /api/db/test ───────────────────────────────────────────

/// Probe a candidate path without touching the live store.
pub async fn test_connection(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TestConnectionRequest>,
) -> Result<Json<TestConnectionResponse>, ApiError> {
    let path = req.db_path.trim();
    if path.is_empty() {
        return Err(ApiError::BadRequest("dbPath is required".into()));
    }
    let path = PathBuf::from(path);
    let (ok, message) =
        run_blocking(state.query.deadline(), move || Ok(MetricsStore::test_connection(&path)))
            .await?;
    Ok(Json(TestConnectionResponse { ok, message }))
}
