use axum::{
    middleware as axum_mw,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::handlers;
use crate::metrics::stream;
use crate::middleware::timing;
use crate::AppState;

/// Builds the full Axum `Router` with all routes and middleware.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // ── Ingest bridge ───────────────────────────────────────
        .route("/api/events", post(handlers::events::ingest_events))
        // ── Live metrics ────────────────────────────────────────
        .route("/api/metrics", get(stream::get_metrics))
        .route("/api/metrics/stream", get(stream::metrics_stream))
        .route("/api/metrics/listen-addrs", get(stream::listen_addrs))
        // ── Historical queries ──────────────────────────────────
        .route("/api/metrics/query", post(handlers::query::query_metrics))
        .route("/api/logs/query", post(handlers::query::query_logs))
        // ── Persistence diagnostics ─────────────────────────────
        .route("/api/db/status", get(handlers::db::db_status))
        .route("/api/db/test", post(handlers::db::test_connection))
        .route("/api/dashboard", get(handlers::dashboard::dashboard))
        // ── Blacklist ───────────────────────────────────────────
        .route(
            "/api/blacklist",
            get(handlers::blacklist::list_blacklist).post(handlers::blacklist::add_blacklist),
        )
        .route("/api/blacklist/refresh", post(handlers::blacklist::refresh))
        .route(
            "/api/blacklist/:ip",
            get(handlers::blacklist::check_blacklist).delete(handlers::blacklist::remove_blacklist),
        )
        // ── Provide shared state to all routes above ────────────
        .with_state(state)
        // ── Global middleware (applied bottom-up) ───────────────
        .layer(axum_mw::from_fn(timing::timing_middleware))
        .layer(CorsLayer::permissive())
}
