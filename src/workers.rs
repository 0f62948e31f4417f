use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{StoreError, StoreResult};
use crate::metrics::{
    now_ms, Granularity, RecorderQueues, RequestEvent, WindowAggregator, MAX_CLOCK_SKEW_MS,
};
use crate::store::{MetricsStore, Persistence};
use crate::AppState;

/// How long a consumer waits on an empty queue before re-checking `running`.
const RECV_POLL: Duration = Duration::from_millis(250);
/// First retry delay for transient storage errors; doubles per attempt.
const RETRY_BASE: Duration = Duration::from_millis(50);
const AGGREGATE_BATCH: usize = 512;
/// Blacklist cache is reloaded every this many sweeps.
const BLACKLIST_REFRESH_EVERY: u64 = 6;

// ─── Public entry point ──────────────────────────────────────────

/// Handles to the background tasks feeding and draining the engine.
pub struct Workers {
    running: Arc<AtomicBool>,
    /// Wakes the periodic tasks out of their interval sleep on shutdown.
    stop_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    state: Arc<AppState>,
}

impl Workers {
    /// Spawns the aggregator consumer, the log writer (when persistence is
    /// ready), the bucket flusher and the eviction sweeper.
    pub fn spawn(state: Arc<AppState>, queues: RecorderQueues) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(4);

        handles.push(tokio::spawn(aggregate_loop(
            running.clone(),
            state.clone(),
            queues.aggregate_rx,
        )));

        if let (Some(rx), Ok(store)) = (queues.persist_rx, state.persistence.store()) {
            handles.push(tokio::spawn(log_writer_loop(
                running.clone(),
                store.clone(),
                rx,
                state.config.metrics_storage.batch_size.max(1),
                state.config.metrics_storage.write_retries,
            )));
            handles.push(tokio::spawn(flush_loop(stop_rx.clone(), state.clone(), store)));
        }

        handles.push(tokio::spawn(sweep_loop(stop_rx, state.clone())));

        tracing::info!(tasks = handles.len(), "metrics workers started");
        Self {
            running,
            stop_tx,
            handles,
            state,
        }
    }

    /// Stop every task, drain what is already queued, and flush all dirty
    /// buckets including the still-open current slots.
    pub async fn shutdown(self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.stop_tx.send(true);
        for h in self.handles {
            let _ = h.await;
        }

        if let Ok(store) = self.state.persistence.store() {
            let retries = self.state.config.metrics_storage.write_retries;
            match flush_once(&self.state, &store, retries, true).await {
                Ok(n) => tracing::info!(buckets = n, "final bucket flush complete"),
                Err(e) => tracing::error!(error = %e, "final bucket flush failed"),
            }
        }
        tracing::info!("metrics workers stopped");
    }
}

// ─── Startup ─────────────────────────────────────────────────────

/// Reload persisted buckets still inside their window, so slots flushed on
/// the way down keep their counts after a restart. Returns buckets restored.
pub fn warm_start(aggregator: &WindowAggregator, persistence: &Persistence, now_ms: i64) -> usize {
    let Ok(store) = persistence.store() else {
        return 0;
    };
    let mut restored = 0usize;
    for granularity in Granularity::ALL {
        let window = aggregator.settings().window_ms(granularity);
        let from = granularity.bucket_start(now_ms.saturating_sub(window));
        let to = granularity.bucket_start(now_ms.saturating_add(MAX_CLOCK_SKEW_MS));
        match store.buckets_between(granularity, from, to) {
            Ok(rows) => restored += aggregator.restore(rows),
            Err(e) => tracing::warn!(
                granularity = %granularity,
                error = %e,
                "could not reload persisted buckets"
            ),
        }
    }
    if restored > 0 {
        tracing::info!(buckets = restored, "restored buckets from disk");
    }
    restored
}

// ─── Queue consumers ─────────────────────────────────────────────

/// Pull up to `limit` events. Returns `None` once the loop should exit:
/// the channel closed, or shutdown was requested and the queue is empty.
async fn next_batch(
    running: &AtomicBool,
    rx: &mut mpsc::Receiver<RequestEvent>,
    buf: &mut Vec<RequestEvent>,
    limit: usize,
) -> Option<usize> {
    loop {
        if !running.load(Ordering::Relaxed) {
            // drain without waiting
            while buf.len() < limit {
                match rx.try_recv() {
                    Ok(event) => buf.push(event),
                    Err(_) => break,
                }
            }
            return (!buf.is_empty()).then_some(buf.len());
        }
        match tokio::time::timeout(RECV_POLL, rx.recv_many(buf, limit)).await {
            Ok(0) => return None,
            Ok(n) => return Some(n),
            Err(_) => continue,
        }
    }
}

async fn aggregate_loop(
    running: Arc<AtomicBool>,
    state: Arc<AppState>,
    mut rx: mpsc::Receiver<RequestEvent>,
) {
    let mut buf = Vec::with_capacity(AGGREGATE_BATCH);
    while next_batch(&running, &mut rx, &mut buf, AGGREGATE_BATCH)
        .await
        .is_some()
    {
        state.aggregator.record_batch(&buf);
        state.lifetime.record_batch(&buf);
        buf.clear();
    }
    tracing::debug!("aggregator worker exited");
}

async fn log_writer_loop(
    running: Arc<AtomicBool>,
    store: Arc<MetricsStore>,
    mut rx: mpsc::Receiver<RequestEvent>,
    batch_size: usize,
    retries: u32,
) {
    let mut buf = Vec::with_capacity(batch_size);
    while next_batch(&running, &mut rx, &mut buf, batch_size)
        .await
        .is_some()
    {
        let batch = Arc::new(std::mem::take(&mut buf));
        let n = batch.len();
        let write_store = store.clone();
        let result = with_retry("append request logs", retries, move || {
            write_store.append_batch(&batch)
        })
        .await;
        match result {
            Ok(_) => tracing::trace!(rows = n, "request logs written"),
            Err(e) => tracing::error!(rows = n, error = %e, "dropping request log batch"),
        }
        buf = Vec::with_capacity(batch_size);
    }
    tracing::debug!("log writer exited");
}

// ─── Periodic tasks ──────────────────────────────────────────────

async fn flush_loop(
    mut stop: watch::Receiver<bool>,
    state: Arc<AppState>,
    store: Arc<MetricsStore>,
) {
    let period = Duration::from_millis(state.config.metrics.flush_interval_ms.max(10));
    let retries = state.config.metrics_storage.write_retries;
    let mut interval = tokio::time::interval(period);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = stop.changed() => break,
        }
        if let Err(e) = flush_once(&state, &store, retries, false).await {
            tracing::warn!(error = %e, "bucket flush failed, will retry next tick");
        }
    }
}

/// Persist dirty buckets, then clear their dirty flags. A bucket updated
/// between snapshot and commit stays dirty for the next round.
pub async fn flush_once(
    state: &AppState,
    store: &Arc<MetricsStore>,
    retries: u32,
    include_open: bool,
) -> StoreResult<usize> {
    let rows = state.aggregator.pending_flush(now_ms(), include_open);
    if rows.is_empty() {
        return Ok(0);
    }
    let rows = Arc::new(rows);
    let write_rows = rows.clone();
    let write_store = store.clone();
    let n = with_retry("flush buckets", retries, move || {
        write_store.flush_buckets(&write_rows)
    })
    .await?;
    state.aggregator.mark_flushed(&rows);
    tracing::debug!(buckets = n, "buckets flushed");
    Ok(n)
}

async fn sweep_loop(mut stop: watch::Receiver<bool>, state: Arc<AppState>) {
    let period = Duration::from_millis(state.config.metrics.sweep_interval_ms.max(10));
    let retention_days = state.config.metrics_storage.retention_days;
    let mut interval = tokio::time::interval(period);
    let mut ticks = 0u64;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = stop.changed() => break,
        }
        let now = now_ms();
        let evicted = state.aggregator.sweep(now);
        if evicted > 0 {
            tracing::debug!(evicted, remaining = state.aggregator.bucket_count(), "swept buckets");
        }

        let Ok(store) = state.persistence.store() else {
            continue;
        };

        if ticks % BLACKLIST_REFRESH_EVERY == 0 {
            if let Err(e) = refresh_blacklist(&state, &store).await {
                tracing::warn!(error = %e, "blacklist refresh failed");
            }
        }
        ticks += 1;

        if retention_days > 0 {
            let cutoff = now - i64::from(retention_days) * 86_400_000;
            let prune_store = store.clone();
            match tokio::task::spawn_blocking(move || prune_store.prune_before(cutoff)).await {
                Ok(Ok(0)) => {}
                Ok(Ok(n)) => tracing::info!(rows = n, cutoff, "pruned expired rows"),
                Ok(Err(e)) => tracing::warn!(error = %e, "retention prune failed"),
                Err(e) => tracing::warn!(error = %e, "retention prune task panicked"),
            }
        }
    }
}

/// Reload the in-memory blacklist from the store.
pub async fn refresh_blacklist(
    state: &Arc<AppState>,
    store: &Arc<MetricsStore>,
) -> StoreResult<usize> {
    let store = store.clone();
    let target = state.clone();
    crate::store::run_blocking(state.query.deadline(), move || {
        target.blacklist.refresh(&store, chrono::Utc::now().timestamp())
    })
    .await
}

// ─── Retry ───────────────────────────────────────────────────────

/// Run a blocking store call, retrying transient failures with exponential
/// backoff. Other errors and the last transient one are returned as-is.
async fn with_retry<R, F>(what: &'static str, retries: u32, f: F) -> StoreResult<R>
where
    R: Send + 'static,
    F: Fn() -> StoreResult<R> + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let mut attempt = 0u32;
    loop {
        let call = f.clone();
        let result = match tokio::task::spawn_blocking(move || (*call)()).await {
            Ok(result) => result,
            Err(join) => Err(StoreError::Worker(join.to_string())),
        };
        match result {
            Err(e) if e.is_transient() && attempt < retries => {
                let backoff = RETRY_BASE * 2u32.saturating_pow(attempt.min(8));
                tracing::warn!(
                    what,
                    attempt = attempt + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "transient storage error, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
