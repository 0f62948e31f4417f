use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::metrics::{now_ms, RequestEvent, MAX_CLOCK_SKEW_MS};
use crate::AppState;

use super::ApiError;

/// `POST /api/events` accepts one event or an array of them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum EventBatch {
    One(RequestEvent),
    Many(Vec<RequestEvent>),
}

impl EventBatch {
    fn into_vec(self) -> Vec<RequestEvent> {
        match self {
            Self::One(e) => vec![e],
            Self::Many(v) => v,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Accepted {
    pub accepted: usize,
}

// ─── POST /api/events ────────────────────────────────────────────

/// Bridge for a proxy core running out of process. Events are handed to the
/// recorder exactly as an in-process caller would; a full queue still drops.
pub async fn ingest_events(
    State(state): State<Arc<AppState>>,
    Json(batch): Json<EventBatch>,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    if state.is_shutting_down() {
        return Err(ApiError::Unavailable("shutting down".into()));
    }
    let events = batch.into_vec();
    if let Some(bad) = events.iter().position(|e| e.listen_addr.trim().is_empty()) {
        return Err(ApiError::BadRequest(format!("event {bad}: listenAddr is required")));
    }
    let latest = now_ms().saturating_add(MAX_CLOCK_SKEW_MS);
    if let Some(bad) = events.iter().position(|e| e.timestamp > latest) {
        return Err(ApiError::BadRequest(format!(
            "event {bad}: timestamp {} is ahead of the server clock (expected epoch milliseconds)",
            events[bad].timestamp
        )));
    }

    let accepted = events.len();
    for event in events {
        state.recorder.record(event);
    }
    Ok((StatusCode::ACCEPTED, Json(Accepted { accepted })))
}
