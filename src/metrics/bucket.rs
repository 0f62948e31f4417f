use std::collections::HashMap;

use rand::Rng;

use super::percentiles::TailLatency;
use super::series::KV;
use super::{Granularity, RequestEvent};

// ─── Status classes ──────────────────────────────────────────────

/// Response status class. `NoResponse` covers 0 and anything outside 200–599.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    S2xx,
    S3xx,
    S4xx,
    S5xx,
    NoResponse,
}

impl StatusClass {
    pub fn of(status: u16) -> Self {
        match status {
            200..=299 => Self::S2xx,
            300..=399 => Self::S3xx,
            400..=499 => Self::S4xx,
            500..=599 => Self::S5xx,
            _ => Self::NoResponse,
        }
    }

    /// Counted against the route in `topRouteErr`.
    pub fn is_route_error(self) -> bool {
        matches!(self, Self::S4xx | Self::S5xx | Self::NoResponse)
    }

    /// Counted against the upstream in `topUpErr`.
    pub fn is_upstream_error(self) -> bool {
        matches!(self, Self::S5xx | Self::NoResponse)
    }
}

// ─── Top-K distribution ──────────────────────────────────────────

/// Bounded key → count map. Once `capacity` distinct keys are held, adding a
/// new key evicts the entry with the smallest count, so counts for rare keys
/// are lossy by construction.
#[derive(Debug, Clone)]
pub struct TopK {
    capacity: usize,
    counts: HashMap<String, u64>,
}

impl TopK {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            counts: HashMap::with_capacity(capacity.max(1) + 1),
        }
    }

    pub fn add(&mut self, key: &str, by: u64) {
        if let Some(count) = self.counts.get_mut(key) {
            *count += by;
            return;
        }
        if self.counts.len() >= self.capacity {
            let smallest = self
                .counts
                .iter()
                .min_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
                .map(|(k, _)| k.clone());
            if let Some(smallest) = smallest {
                self.counts.remove(&smallest);
            }
        }
        self.counts.insert(key.to_owned(), by);
    }

    /// Entries ordered by count descending, ties broken by key.
    pub fn to_kv(&self) -> Vec<KV> {
        let mut out: Vec<KV> = self
            .counts
            .iter()
            .map(|(k, v)| KV {
                key: k.clone(),
                value: *v,
            })
            .collect();
        out.sort_by(|a, b| b.value.cmp(&a.value).then_with(|| a.key.cmp(&b.key)));
        out
    }
}

// ─── Latency reservoir ───────────────────────────────────────────

/// Fixed-capacity uniform sample of the latencies seen by a bucket
/// (Algorithm R). Exact until `capacity` observations, approximate after.
#[derive(Debug, Clone)]
pub struct LatencyReservoir {
    capacity: usize,
    seen: u64,
    samples: Vec<f64>,
}

impl LatencyReservoir {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: 0,
            samples: Vec::new(),
        }
    }

    pub fn offer<R: Rng + ?Sized>(&mut self, latency_ms: f64, rng: &mut R) {
        self.seen += 1;
        if self.samples.len() < self.capacity {
            self.samples.push(latency_ms);
            return;
        }
        let j = rng.gen_range(0..self.seen);
        if (j as usize) < self.capacity {
            self.samples[j as usize] = latency_ms;
        }
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }

    /// True once the reservoir has started discarding observations.
    pub fn overflowed(&self) -> bool {
        self.seen > self.capacity as u64
    }
}

// ─── Latency histogram ───────────────────────────────────────────

/// Upper bounds (ms, exclusive) of the latency histogram buckets. The last
/// bucket is open-ended.
pub const LATENCY_BOUNDS_MS: &[f64] = &[10.0, 50.0, 100.0, 200.0, 500.0, 1_000.0, 3_000.0];

const LATENCY_LABELS: &[&str] = &[
    "<10ms",
    "10-50ms",
    "50-100ms",
    "100-200ms",
    "200-500ms",
    "500ms-1s",
    "1-3s",
    ">=3s",
];

fn latency_slot(latency_ms: f64) -> usize {
    LATENCY_BOUNDS_MS
        .iter()
        .position(|&bound| latency_ms < bound)
        .unwrap_or(LATENCY_BOUNDS_MS.len())
}

/// Fixed-boundary latency histogram. Renders in boundary order and skips
/// empty buckets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencyHistogram {
    counts: [u64; LATENCY_LABELS.len()],
}

impl LatencyHistogram {
    pub fn record(&mut self, latency_ms: f64) {
        self.counts[latency_slot(latency_ms)] += 1;
    }

    /// Adds a rendered histogram back in, matching entries by label.
    pub fn merge_kv(&mut self, kv: &[KV]) {
        for entry in kv {
            if let Some(idx) = LATENCY_LABELS.iter().position(|l| *l == entry.key) {
                self.counts[idx] += entry.value;
            }
        }
    }

    pub fn to_kv(&self) -> Vec<KV> {
        LATENCY_LABELS
            .iter()
            .zip(self.counts.iter())
            .filter(|(_, count)| **count > 0)
            .map(|(label, &count)| KV {
                key: (*label).to_string(),
                value: count,
            })
            .collect()
    }
}

// ─── Bucket ──────────────────────────────────────────────────────

/// Percentiles of a bucket reloaded from disk. Raw samples are not
/// persisted, so later observations are blended in by count.
#[derive(Debug, Clone, Copy)]
struct RestoredTail {
    count: u64,
    tail: TailLatency,
}

impl RestoredTail {
    fn blend(self, live: TailLatency, live_count: u64) -> TailLatency {
        let mix = |prior: Option<f64>, fresh: Option<f64>| match (prior, fresh) {
            (Some(a), Some(b)) => {
                let total = (self.count + live_count) as f64;
                Some((a * self.count as f64 + b * live_count as f64) / total)
            }
            (a, b) => a.or(b),
        };
        TailLatency {
            p95: mix(self.tail.p95, live.p95),
            p99: mix(self.tail.p99, live.p99),
        }
    }
}

/// Running aggregate for one (listen address, granularity, slot).
#[derive(Debug, Clone)]
pub struct Bucket {
    pub start_ms: i64,
    pub count: u64,
    pub s2xx: u64,
    pub s3xx: u64,
    pub s4xx: u64,
    pub s5xx: u64,
    pub s0: u64,
    pub latency_sum_ms: f64,
    pub latency_max_ms: f64,
    samples: LatencyReservoir,
    upstream_dist: TopK,
    route_err: TopK,
    upstream_err: TopK,
    latency_dist: LatencyHistogram,
    restored: Option<RestoredTail>,
    /// Set on every update, cleared once a flush has persisted the current counts.
    dirty: bool,
}

impl Bucket {
    pub fn new(start_ms: i64, sample_capacity: usize, top_k: usize) -> Self {
        Self {
            start_ms,
            count: 0,
            s2xx: 0,
            s3xx: 0,
            s4xx: 0,
            s5xx: 0,
            s0: 0,
            latency_sum_ms: 0.0,
            latency_max_ms: 0.0,
            samples: LatencyReservoir::new(sample_capacity),
            upstream_dist: TopK::new(top_k),
            route_err: TopK::new(top_k),
            upstream_err: TopK::new(top_k),
            latency_dist: LatencyHistogram::default(),
            restored: None,
            dirty: false,
        }
    }

    /// Rebuild a bucket from its persisted row. The result is clean; new
    /// events add on top of the restored counts.
    pub fn from_row(row: &BucketRow, sample_capacity: usize, top_k: usize) -> Self {
        let mut bucket = Self::new(row.start_ms, sample_capacity, top_k);
        bucket.count = row.count;
        bucket.s2xx = row.s2xx;
        bucket.s3xx = row.s3xx;
        bucket.s4xx = row.s4xx;
        bucket.s5xx = row.s5xx;
        bucket.s0 = row.s0;
        bucket.latency_sum_ms = row.latency_sum_ms;
        bucket.latency_max_ms = row.latency_max_ms;
        for (top, entries) in [
            (&mut bucket.upstream_dist, &row.upstream_dist),
            (&mut bucket.route_err, &row.route_err),
            (&mut bucket.upstream_err, &row.upstream_err),
        ] {
            for kv in entries {
                top.add(&kv.key, kv.value);
            }
        }
        bucket.latency_dist.merge_kv(&row.latency_dist);
        bucket.restored = Some(RestoredTail {
            count: row.count,
            tail: TailLatency {
                p95: row.p95,
                p99: row.p99,
            },
        });
        bucket
    }

    pub fn record<R: Rng + ?Sized>(&mut self, event: &RequestEvent, rng: &mut R) {
        let latency = if event.latency_ms.is_finite() {
            event.latency_ms.max(0.0)
        } else {
            0.0
        };

        self.count += 1;
        let class = StatusClass::of(event.status_code);
        match class {
            StatusClass::S2xx => self.s2xx += 1,
            StatusClass::S3xx => self.s3xx += 1,
            StatusClass::S4xx => self.s4xx += 1,
            StatusClass::S5xx => self.s5xx += 1,
            StatusClass::NoResponse => self.s0 += 1,
        }

        self.latency_sum_ms += latency;
        if latency > self.latency_max_ms {
            self.latency_max_ms = latency;
        }
        self.samples.offer(latency, rng);
        self.latency_dist.record(latency);

        if !event.upstream.is_empty() {
            self.upstream_dist.add(&event.upstream, 1);
        }
        if class.is_route_error() && !event.route_key.is_empty() {
            self.route_err.add(&event.route_key, 1);
        }
        if class.is_upstream_error() && !event.upstream.is_empty() {
            self.upstream_err.add(&event.upstream, 1);
        }

        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn samples(&self) -> &[f64] {
        self.samples.samples()
    }

    /// p95/p99 are estimates rather than exact ranks: the reservoir has
    /// overflowed or the bucket was restored from disk.
    pub fn percentiles_estimated(&self) -> bool {
        self.samples.overflowed() || self.restored.is_some()
    }

    fn tail(&self) -> TailLatency {
        let live = TailLatency::from_samples(self.samples.samples());
        match self.restored {
            Some(prior) => prior.blend(live, self.samples.seen()),
            None => live,
        }
    }

    /// Freeze the bucket into its persisted/rendered form.
    pub fn to_row(&self, listen_addr: &str, granularity: Granularity) -> BucketRow {
        let tail = self.tail();
        BucketRow {
            listen_addr: listen_addr.to_owned(),
            granularity,
            start_ms: self.start_ms,
            count: self.count,
            s2xx: self.s2xx,
            s3xx: self.s3xx,
            s4xx: self.s4xx,
            s5xx: self.s5xx,
            s0: self.s0,
            latency_sum_ms: self.latency_sum_ms,
            latency_max_ms: self.latency_max_ms,
            p95: tail.p95,
            p99: tail.p99,
            upstream_dist: self.upstream_dist.to_kv(),
            route_err: self.route_err.to_kv(),
            upstream_err: self.upstream_err.to_kv(),
            latency_dist: self.latency_dist.to_kv(),
        }
    }
}

/// Immutable view of a bucket: what the flusher persists and what series are
/// rendered from, whether it came from memory or from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketRow {
    pub listen_addr: String,
    pub granularity: Granularity,
    pub start_ms: i64,
    pub count: u64,
    pub s2xx: u64,
    pub s3xx: u64,
    pub s4xx: u64,
    pub s5xx: u64,
    pub s0: u64,
    pub latency_sum_ms: f64,
    pub latency_max_ms: f64,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
    pub upstream_dist: Vec<KV>,
    pub route_err: Vec<KV>,
    pub upstream_err: Vec<KV>,
    pub latency_dist: Vec<KV>,
}

impl BucketRow {
    pub fn avg_latency_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.latency_sum_ms / self.count as f64
        }
    }
}
