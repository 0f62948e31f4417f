use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::bucket::{BucketRow, LatencyHistogram};
use super::Granularity;

/// One entry of a distribution, `{ "key": ..., "value": ... }` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KV {
    pub key: String,
    pub value: u64,
}

/// A contiguous run of buckets rendered as index-aligned arrays.
///
/// Slots without traffic are present with zero counts; their `p95`/`p99`
/// entries are `0`, which reads as "undefined" next to a zero count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSeries {
    pub timestamps: Vec<i64>,
    pub counts: Vec<u64>,
    pub s2xx: Vec<u64>,
    pub s3xx: Vec<u64>,
    pub s4xx: Vec<u64>,
    pub s5xx: Vec<u64>,
    pub s0: Vec<u64>,
    pub avg_latency_ms: Vec<f64>,
    pub max_latency_ms: Vec<f64>,
    pub p95: Vec<f64>,
    pub p99: Vec<f64>,
    pub upstream_dist: Vec<KV>,
    pub top_route_err: Vec<KV>,
    pub top_up_err: Vec<KV>,
    pub latency_dist: Vec<KV>,
}

/// Live view of every listen address at both granularities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsPayload {
    pub window_seconds: u64,
    pub listen_addrs: Vec<String>,
    pub by_listen_addr: BTreeMap<String, MetricsSeries>,
    pub minute_window_seconds: u64,
    pub by_listen_minute: BTreeMap<String, MetricsSeries>,
}

impl MetricsSeries {
    /// Render every slot from `first_slot` to `last_slot` (both inclusive,
    /// both already aligned to `granularity`). `rows` is keyed by slot start;
    /// slots missing from it are zero-filled.
    pub fn build(
        granularity: Granularity,
        first_slot: i64,
        last_slot: i64,
        rows: &BTreeMap<i64, BucketRow>,
        top_k: usize,
    ) -> Self {
        let step = granularity.millis();
        let slots = if last_slot < first_slot {
            0
        } else {
            ((last_slot - first_slot) / step + 1) as usize
        };

        let mut series = Self::with_capacity(slots);
        let mut upstream = HashMap::new();
        let mut route_err = HashMap::new();
        let mut up_err = HashMap::new();
        let mut latency = LatencyHistogram::default();

        for i in 0..slots {
            let slot = first_slot + i as i64 * step;
            series.timestamps.push(slot);
            match rows.get(&slot) {
                Some(row) => {
                    series.counts.push(row.count);
                    series.s2xx.push(row.s2xx);
                    series.s3xx.push(row.s3xx);
                    series.s4xx.push(row.s4xx);
                    series.s5xx.push(row.s5xx);
                    series.s0.push(row.s0);
                    series.avg_latency_ms.push(row.avg_latency_ms());
                    series.max_latency_ms.push(row.latency_max_ms);
                    series.p95.push(row.p95.unwrap_or(0.0));
                    series.p99.push(row.p99.unwrap_or(0.0));

                    accumulate(&mut upstream, &row.upstream_dist);
                    accumulate(&mut route_err, &row.route_err);
                    accumulate(&mut up_err, &row.upstream_err);
                    latency.merge_kv(&row.latency_dist);
                }
                None => series.push_empty(),
            }
        }

        series.upstream_dist = top_entries(upstream, top_k);
        series.top_route_err = top_entries(route_err, top_k);
        series.top_up_err = top_entries(up_err, top_k);
        series.latency_dist = latency.to_kv();
        series
    }

    fn with_capacity(n: usize) -> Self {
        Self {
            timestamps: Vec::with_capacity(n),
            counts: Vec::with_capacity(n),
            s2xx: Vec::with_capacity(n),
            s3xx: Vec::with_capacity(n),
            s4xx: Vec::with_capacity(n),
            s5xx: Vec::with_capacity(n),
            s0: Vec::with_capacity(n),
            avg_latency_ms: Vec::with_capacity(n),
            max_latency_ms: Vec::with_capacity(n),
            p95: Vec::with_capacity(n),
            p99: Vec::with_capacity(n),
            ..Self::default()
        }
    }

    fn push_empty(&mut self) {
        self.counts.push(0);
        self.s2xx.push(0);
        self.s3xx.push(0);
        self.s4xx.push(0);
        self.s5xx.push(0);
        self.s0.push(0);
        self.avg_latency_ms.push(0.0);
        self.max_latency_ms.push(0.0);
        self.p95.push(0.0);
        self.p99.push(0.0);
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

fn accumulate(acc: &mut HashMap<String, u64>, entries: &[KV]) {
    for entry in entries {
        *acc.entry(entry.key.clone()).or_insert(0) += entry.value;
    }
}

fn top_entries(acc: HashMap<String, u64>, k: usize) -> Vec<KV> {
    let mut out: Vec<KV> = acc
        .into_iter()
        .map(|(key, value)| KV { key, value })
        .collect();
    out.sort_by(|a, b| b.value.cmp(&a.value).then_with(|| a.key.cmp(&b.key)));
    out.truncate(k);
    out
}
