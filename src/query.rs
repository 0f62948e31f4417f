//! Time-range series and paginated log search over memory + disk.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::QueryError;
use crate::metrics::{Granularity, MetricsSeries, WindowAggregator};
use crate::store::{run_blocking, LogFilter, Persistence, RequestLog};

/// Largest page a log query may request; bigger values are clamped.
pub const MAX_PAGE_SIZE: u64 = 1_000;

// ─── Wire types ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryMetricsRequest {
    pub start_time: i64,
    pub end_time: i64,
    #[serde(default)]
    pub listen_addr: String,
    #[serde(default)]
    pub use_minute: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMetricsResponse {
    pub series: MetricsSeries,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequestLogsRequest {
    pub start_time: i64,
    pub end_time: i64,
    #[serde(default)]
    pub listen_addr: String,
    #[serde(default)]
    pub upstream: String,
    #[serde(default)]
    pub request_path: String,
    #[serde(rename = "clientIP", default)]
    pub client_ip: String,
    /// 0 means any status
    #[serde(default)]
    pub status_code: u16,
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequestLogsResponse {
    pub logs: Vec<RequestLog>,
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
    pub total_page: u64,
}

// ─── Service ─────────────────────────────────────────────────────

pub struct QueryService {
    aggregator: Arc<WindowAggregator>,
    persistence: Arc<Persistence>,
    deadline: Duration,
    max_series_points: usize,
}

impl QueryService {
    pub fn new(
        aggregator: Arc<WindowAggregator>,
        persistence: Arc<Persistence>,
        deadline: Duration,
        max_series_points: usize,
    ) -> Self {
        Self {
            aggregator,
            persistence,
            deadline,
            max_series_points,
        }
    }

    /// Contiguous series over every slot in `[floor(start), floor(end)]`.
    ///
    /// Persisted rows are read first and in-memory buckets laid over them,
    /// so a slot still held in memory always reports its live counts. When
    /// the store is busy past the deadline the answer comes from memory alone.
    pub async fn query_series(
        &self,
        req: &QueryMetricsRequest,
    ) -> Result<QueryMetricsResponse, QueryError> {
        validate_range(req.start_time, req.end_time)?;
        let listen_addr = req.listen_addr.trim();
        if listen_addr.is_empty() {
            return Err(QueryError::MissingListenAddr);
        }

        let granularity = Granularity::from_use_minute(req.use_minute);
        let first = granularity.bucket_start(req.start_time);
        let last = granularity.bucket_start(req.end_time);
        let slots = ((last - first) / granularity.millis()) as u64 + 1;
        if slots > self.max_series_points as u64 {
            return Err(QueryError::TooManyPoints {
                requested: slots,
                max: self.max_series_points,
            });
        }

        let mut rows = match self.persistence.store() {
            Ok(store) => {
                let addr = listen_addr.to_owned();
                let read = run_blocking(self.deadline, move || {
                    store.query_buckets(&addr, granularity, first, last)
                })
                .await;
                match read {
                    Ok(rows) => rows,
                    Err(e) if e.is_contended() => {
                        tracing::warn!(listen_addr, error = %e, "persisted buckets unavailable, serving memory only");
                        BTreeMap::new()
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            // memory-only when persistence is off or broken
            Err(_) => BTreeMap::new(),
        };
        rows.extend(self.aggregator.rows_in_range(listen_addr, granularity, first, last));

        tracing::debug!(
            listen_addr,
            granularity = %granularity,
            slots,
            filled = rows.len(),
            "series query"
        );
        let series = MetricsSeries::build(
            granularity,
            first,
            last,
            &rows,
            self.aggregator.settings().top_k,
        );
        Ok(QueryMetricsResponse { series })
    }

    pub async fn query_logs(
        &self,
        req: &QueryRequestLogsRequest,
    ) -> Result<QueryRequestLogsResponse, QueryError> {
        validate_range(req.start_time, req.end_time)?;
        if req.page < 1 {
            return Err(QueryError::InvalidPage(format!("page must be >= 1, got {}", req.page)));
        }
        if req.page_size < 1 {
            return Err(QueryError::InvalidPage(format!(
                "pageSize must be >= 1, got {}",
                req.page_size
            )));
        }
        let page = req.page as u64;
        let page_size = (req.page_size as u64).min(MAX_PAGE_SIZE);
        let offset = (page - 1).saturating_mul(page_size);

        let store = self.persistence.store()?;
        let filter = log_filter(req);
        let result = run_blocking(self.deadline, move || {
            store.query_logs(&filter, page_size, offset)
        })
        .await?;

        Ok(QueryRequestLogsResponse {
            logs: result.rows,
            total: result.total,
            page,
            page_size,
            total_page: result.total.div_ceil(page_size),
        })
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }
}

fn validate_range(start: i64, end: i64) -> Result<(), QueryError> {
    if start < 0 || end < 0 {
        return Err(QueryError::InvalidRange(format!(
            "times must be non-negative (start={start}, end={end})"
        )));
    }
    if start > end {
        return Err(QueryError::InvalidRange(format!(
            "startTime {start} is after endTime {end}"
        )));
    }
    Ok(())
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_owned())
}

fn log_filter(req: &QueryRequestLogsRequest) -> LogFilter {
    LogFilter {
        start_ms: req.start_time,
        end_ms: req.end_time,
        listen_addr: non_empty(&req.listen_addr),
        upstream: non_empty(&req.upstream),
        request_path: non_empty(&req.request_path),
        client_ip: non_empty(&req.client_ip),
        status_code: (req.status_code != 0).then_some(req.status_code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::metrics::{AggregatorSettings, RequestEvent};
    use crate::store::{MetricsStore, StoreTuning};
    use tempfile::TempDir;

    fn event(ts: i64, status: u16, latency_ms: f64, path: &str) -> RequestEvent {
        RequestEvent {
            timestamp: ts,
            listen_addr: "L".into(),
            client_ip: "10.1.1.1".into(),
            method: "GET".into(),
            request_url: path.into(),
            request_path: path.into(),
            request_host: "h".into(),
            status_code: status,
            upstream: "u1".into(),
            route_key: "r1".into(),
            latency_ms,
            user_agent: String::new(),
            referer: String::new(),
        }
    }

    fn service(persistence: Persistence) -> (Arc<WindowAggregator>, Arc<Persistence>, QueryService) {
        service_with_deadline(persistence, Duration::from_secs(2))
    }

    fn service_with_deadline(
        persistence: Persistence,
        deadline: Duration,
    ) -> (Arc<WindowAggregator>, Arc<Persistence>, QueryService) {
        let agg = Arc::new(WindowAggregator::new(AggregatorSettings::default()));
        let persistence = Arc::new(persistence);
        let svc = QueryService::new(agg.clone(), persistence.clone(), deadline, 1_000);
        (agg, persistence, svc)
    }

    /// Holds one of the store's connections on another thread until the
    /// returned handle is joined.
    fn hold(
        store: Arc<MetricsStore>,
        writer: bool,
        for_ms: u64,
    ) -> std::thread::JoinHandle<()> {
        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let handle = std::thread::spawn(move || {
            let busy = |_: &mut rusqlite::Connection| -> crate::error::StoreResult<()> {
                held_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(for_ms));
                Ok(())
            };
            if writer {
                store.with_conn(true, busy).unwrap();
            } else {
                store.with_reader(busy).unwrap();
            }
        });
        held_rx.recv().unwrap();
        handle
    }

    fn ready() -> (TempDir, Persistence) {
        let dir = TempDir::new().unwrap();
        let store = MetricsStore::open(&dir.path().join("m.db"), StoreTuning::default()).unwrap();
        (dir, Persistence::Ready(Arc::new(store)))
    }

    fn disabled() -> Persistence {
        Persistence::Disabled {
            path: "unused.db".into(),
        }
    }

    fn series_req(start: i64, end: i64) -> QueryMetricsRequest {
        QueryMetricsRequest {
            start_time: start,
            end_time: end,
            listen_addr: "L".into(),
            use_minute: false,
        }
    }

    fn logs_req(page: i64, page_size: i64) -> QueryRequestLogsRequest {
        QueryRequestLogsRequest {
            start_time: 0,
            end_time: 1_000_000,
            listen_addr: String::new(),
            upstream: String::new(),
            request_path: String::new(),
            client_ip: String::new(),
            status_code: 0,
            page,
            page_size,
        }
    }

    #[tokio::test]
    async fn series_is_contiguous_and_zero_filled() {
        let (agg, _p, svc) = service(disabled());
        agg.record_batch(&[
            event(10_000, 200, 10.0, "/"),
            event(10_500, 200, 20.0, "/"),
            event(10_900, 500, 30.0, "/"),
            event(13_000, 200, 5.0, "/"),
        ]);

        let series = svc.query_series(&series_req(9_500, 14_200)).await.unwrap().series;
        assert_eq!(series.timestamps, vec![9_000, 10_000, 11_000, 12_000, 13_000, 14_000]);
        assert_eq!(series.counts, vec![0, 3, 0, 0, 1, 0]);
        assert_eq!(series.s5xx, vec![0, 1, 0, 0, 0, 0]);
        assert_eq!(series.avg_latency_ms[1], 20.0);
        assert_eq!(series.max_latency_ms[1], 30.0);
        assert_eq!(series.p95[0], 0.0);
        assert!(series.p95[1] <= series.p99[1] && series.p99[1] <= 30.0);
        assert_eq!(series.p95.len(), series.timestamps.len());
    }

    #[tokio::test]
    async fn memory_wins_over_disk_for_same_slot() {
        let (_dir, persistence) = ready();
        let (agg, p, svc) = service(persistence);
        let store = p.store().unwrap();

        // disk has an older snapshot of slot 10s and a slot memory no longer holds
        let stale = WindowAggregator::new(AggregatorSettings::default());
        stale.record_batch(&[event(5_000, 200, 1.0, "/"), event(10_000, 200, 1.0, "/")]);
        store.flush_buckets(&stale.pending_flush(0, true)).unwrap();

        agg.record_batch(&[event(10_000, 200, 1.0, "/"), event(10_100, 404, 2.0, "/")]);

        let series = svc.query_series(&series_req(5_000, 10_999)).await.unwrap().series;
        assert_eq!(series.counts[0], 1);
        assert_eq!(series.counts[5], 2);
        assert_eq!(series.s4xx[5], 1);
    }

    #[tokio::test]
    async fn series_reads_are_not_blocked_by_a_flush() {
        let (_dir, persistence) = ready();
        let (agg, p, svc) = service_with_deadline(persistence, Duration::from_millis(200));
        let store = p.store().unwrap();

        let flushed = WindowAggregator::new(AggregatorSettings::default());
        flushed.record_batch(&[event(5_000, 200, 1.0, "/")]);
        store.flush_buckets(&flushed.pending_flush(0, true)).unwrap();
        agg.record_batch(&[event(10_000, 200, 1.0, "/")]);

        let writer = hold(store, true, 1_000);
        let started = std::time::Instant::now();
        let series = svc.query_series(&series_req(5_000, 10_999)).await.unwrap().series;
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(series.counts[0], 1);
        assert_eq!(series.counts[5], 1);
        writer.join().unwrap();
    }

    #[tokio::test]
    async fn busy_store_falls_back_to_memory() {
        let (_dir, persistence) = ready();
        let (agg, p, svc) = service_with_deadline(persistence, Duration::from_millis(200));
        let store = p.store().unwrap();

        let flushed = WindowAggregator::new(AggregatorSettings::default());
        flushed.record_batch(&[event(5_000, 200, 1.0, "/")]);
        store.flush_buckets(&flushed.pending_flush(0, true)).unwrap();
        agg.record_batch(&[event(10_000, 200, 1.0, "/"), event(10_200, 500, 1.0, "/")]);

        let reader = hold(store, false, 1_000);
        let series = svc.query_series(&series_req(5_000, 10_999)).await.unwrap().series;
        assert_eq!(series.counts[0], 0, "disk rows skipped while the reader is busy");
        assert_eq!(series.counts[5], 2);
        assert_eq!(series.s5xx[5], 1);
        reader.join().unwrap();
    }

    #[tokio::test]
    async fn minute_granularity_uses_minute_slots() {
        let (agg, _p, svc) = service(disabled());
        agg.record_batch(&[event(61_000, 200, 1.0, "/"), event(119_000, 200, 1.0, "/")]);
        let mut req = series_req(0, 179_999);
        req.use_minute = true;
        let series = svc.query_series(&req).await.unwrap().series;
        assert_eq!(series.timestamps, vec![0, 60_000, 120_000]);
        assert_eq!(series.counts, vec![0, 2, 0]);
    }

    #[tokio::test]
    async fn rejects_bad_ranges() {
        let (_agg, _p, svc) = service(disabled());
        assert!(matches!(
            svc.query_series(&series_req(2_000, 1_000)).await,
            Err(QueryError::InvalidRange(_))
        ));
        assert!(matches!(
            svc.query_series(&series_req(-5, 1_000)).await,
            Err(QueryError::InvalidRange(_))
        ));
        assert!(matches!(
            svc.query_series(&series_req(0, 10_000_000)).await,
            Err(QueryError::TooManyPoints { max: 1_000, .. })
        ));
        let mut no_addr = series_req(0, 1_000);
        no_addr.listen_addr = "  ".into();
        assert!(matches!(svc.query_series(&no_addr).await, Err(QueryError::MissingListenAddr)));
    }

    #[tokio::test]
    async fn log_pages_sum_to_total() {
        let (_dir, persistence) = ready();
        let (_agg, p, svc) = service(persistence);
        let events: Vec<_> = (0..25).map(|i| event(1_000 + i, 200, 1.0, "/x")).collect();
        p.store().unwrap().append_batch(&events).unwrap();

        let mut seen = 0;
        for page in 1..=3 {
            let resp = svc.query_logs(&logs_req(page, 10)).await.unwrap();
            assert_eq!(resp.total, 25);
            assert_eq!(resp.total_page, 3);
            seen += resp.logs.len();
        }
        assert_eq!(seen, 25);

        let beyond = svc.query_logs(&logs_req(9, 10)).await.unwrap();
        assert!(beyond.logs.is_empty());
        assert_eq!(beyond.total, 25);
        assert_eq!(beyond.page, 9);
    }

    #[tokio::test]
    async fn log_query_validation_and_filters() {
        let (_dir, persistence) = ready();
        let (_agg, p, svc) = service(persistence);
        p.store()
            .unwrap()
            .append_batch(&[event(100, 200, 1.0, "/a/users"), event(200, 502, 1.0, "/b")])
            .unwrap();

        assert!(matches!(svc.query_logs(&logs_req(0, 10)).await, Err(QueryError::InvalidPage(_))));
        assert!(matches!(svc.query_logs(&logs_req(1, 0)).await, Err(QueryError::InvalidPage(_))));

        let big = svc.query_logs(&logs_req(1, 50_000)).await.unwrap();
        assert_eq!(big.page_size, MAX_PAGE_SIZE);

        let mut req = logs_req(1, 10);
        req.status_code = 502;
        let resp = svc.query_logs(&req).await.unwrap();
        assert_eq!(resp.total, 1);
        assert_eq!(resp.logs[0].event.request_path, "/b");

        let mut req = logs_req(1, 10);
        req.request_path = "users".into();
        assert_eq!(svc.query_logs(&req).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn logs_need_a_store() {
        let (_agg, _p, svc) = service(disabled());
        let err = svc.query_logs(&logs_req(1, 10)).await.unwrap_err();
        assert!(matches!(err, QueryError::Store(StoreError::Disabled)));
    }

    #[test]
    fn request_defaults_and_names() {
        let req: QueryRequestLogsRequest =
            serde_json::from_str(r#"{"startTime":1,"endTime":2,"clientIP":"10.0.0.1"}"#).unwrap();
        assert_eq!(req.page, 1);
        assert_eq!(req.page_size, 50);
        assert_eq!(log_filter(&req).client_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(log_filter(&req).status_code, None);
    }
}
