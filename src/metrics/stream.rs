use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;

use super::{now_ms, MetricsPayload};
use crate::AppState;

// ─── GET /api/metrics ────────────────────────────────────────────
/// Live payload for every listen address at both granularities.

pub async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<MetricsPayload> {
    Json(state.aggregator.snapshot_payload(now_ms()))
}

// ─── GET /api/metrics/listen-addrs ───────────────────────────────

pub async fn listen_addrs(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.aggregator.listen_addrs())
}

// ─── GET /api/metrics/stream ─────────────────────────────────────
/// Server-Sent Events endpoint. Pushes a full `MetricsPayload` every
/// `stream_interval_ms`; the UI's `EventSource` feeds its charts from it.

pub async fn metrics_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let period = Duration::from_millis(state.config.metrics.stream_interval_ms.max(100));
    let interval = tokio::time::interval(period);

    let stop = state.shutdown.subscribe();

    let stream = IntervalStream::new(interval)
        .take_while(move |_| !*stop.borrow())
        .map(move |_| {
            let payload = state.aggregator.snapshot_payload(now_ms());
            let json = serde_json::to_string(&payload).unwrap_or_default();
            Ok(Event::default().event("metrics").data(json))
        });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
