use std::time::Instant;

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;

use super::bucket::StatusClass;
use super::percentiles::PercentileSet;
use super::recorder::DropCounts;
use super::RequestEvent;

/// HdrHistogram range: 1 μs → 10 min, 3 significant figures
const HIST_LOW: u64 = 1;
const HIST_HIGH: u64 = 600_000_000;
const HIST_SIGFIG: u8 = 3;

/// Process-lifetime totals. Unlike the windowed buckets these are never
/// evicted; they back the dashboard summary card.
pub struct LifetimeStats {
    inner: Mutex<Inner>,
}

/// Summary served by `GET /api/dashboard`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub total_requests: u64,
    pub total_errors: u64,
    pub requests_per_sec: f64,
    pub uptime_secs: f64,
    pub listen_addr_count: usize,
    pub dropped: DropCounts,
    /// End-to-end proxied latency, microseconds
    pub latency_us: PercentileSet,
}

struct Inner {
    latency_hist: Histogram<u64>,
    total_requests: u64,
    total_errors: u64,
    started: Instant,
}

impl LifetimeStats {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                latency_hist: new_histogram(),
                total_requests: 0,
                total_errors: 0,
                started: Instant::now(),
            }),
        }
    }

    pub fn record_batch(&self, events: &[RequestEvent]) {
        let mut inner = self.inner.lock();
        for event in events {
            inner.total_requests += 1;
            if StatusClass::of(event.status_code).is_upstream_error() {
                inner.total_errors += 1;
            }
            // clamp to the histogram's range; out-of-range values are not an error here
            let us = (event.latency_ms.max(0.0) * 1_000.0) as u64;
            let _ = inner.latency_hist.record(us.clamp(HIST_LOW, HIST_HIGH));
        }
    }

    pub fn snapshot(&self, listen_addr_count: usize, dropped: DropCounts) -> DashboardStats {
        let inner = self.inner.lock();
        let uptime_secs = inner.started.elapsed().as_secs_f64();
        let requests_per_sec = if uptime_secs > 0.0 {
            inner.total_requests as f64 / uptime_secs
        } else {
            0.0
        };

        DashboardStats {
            total_requests: inner.total_requests,
            total_errors: inner.total_errors,
            requests_per_sec,
            uptime_secs,
            listen_addr_count,
            dropped,
            latency_us: PercentileSet::from_histogram(&inner.latency_hist),
        }
    }
}

impl Default for LifetimeStats {
    fn default() -> Self {
        Self::new()
    }
}

fn new_histogram() -> Histogram<u64> {
    Histogram::<u64>::new_with_bounds(HIST_LOW, HIST_HIGH, HIST_SIGFIG)
        .expect("histogram creation")
}
