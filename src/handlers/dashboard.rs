use axum::{extract::State, Json};
use std::sync::Arc;

use crate::metrics::DashboardStats;
use crate::AppState;

// ─── GET /api/dashboard ──────────────────────────────────────────

pub async fn dashboard(State(state): State<Arc<AppState>>) -> Json<DashboardStats> {
    let addrs = state.aggregator.listen_addrs().len();
    Json(state.lifetime.snapshot(addrs, state.recorder.dropped()))
}
