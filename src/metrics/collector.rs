use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::bucket::{Bucket, BucketRow};
use super::series::{MetricsPayload, MetricsSeries};
use super::{Granularity, RequestEvent};
use crate::config::{MetricsConfig, MAX_WINDOW_SECS};

/// How far ahead of the local clock an event may be stamped. Slots beyond
/// it are dropped by `sweep` and refused at the HTTP bridge.
pub const MAX_CLOCK_SKEW_MS: i64 = 60_000;

// ─── Configuration ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    /// Latency samples kept per bucket
    pub sample_capacity: usize,
    /// Entries kept per distribution map
    pub top_k: usize,
    /// Second buckets older than this are evicted by `sweep`
    pub second_window_ms: i64,
    /// Minute buckets older than this are evicted by `sweep`
    pub minute_window_ms: i64,
}

impl AggregatorSettings {
    pub fn window_ms(&self, granularity: Granularity) -> i64 {
        match granularity {
            Granularity::Second => self.second_window_ms,
            Granularity::Minute => self.minute_window_ms,
        }
    }
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            sample_capacity: 256,
            top_k: 10,
            second_window_ms: 6 * 60 * 60 * 1_000,
            minute_window_ms: 24 * 60 * 60 * 1_000,
        }
    }
}

impl From<&MetricsConfig> for AggregatorSettings {
    fn from(cfg: &MetricsConfig) -> Self {
        Self {
            sample_capacity: cfg.sample_capacity,
            top_k: cfg.top_k,
            second_window_ms: window_ms(cfg.second_window_secs),
            minute_window_ms: window_ms(cfg.minute_window_secs),
        }
    }
}

fn window_ms(secs: u64) -> i64 {
    secs.min(MAX_WINDOW_SECS) as i64 * 1_000
}

// ─── Public types ────────────────────────────────────────────────

/// In-memory rolling buckets for every listen address at both granularities.
///
/// Mutation happens under the write lock, which the aggregator task takes
/// once per batch; queries, the flusher and the live stream share read locks.
pub struct WindowAggregator {
    settings: AggregatorSettings,
    inner: RwLock<Inner>,
}

// ─── Internal state ──────────────────────────────────────────────

struct Inner {
    by_addr: HashMap<String, AddrBuckets>,
    rng: StdRng,
}

/// Both bucket families of one listen address, keyed by slot start.
#[derive(Default)]
struct AddrBuckets {
    second: BTreeMap<i64, Bucket>,
    minute: BTreeMap<i64, Bucket>,
}

impl AddrBuckets {
    fn family(&self, granularity: Granularity) -> &BTreeMap<i64, Bucket> {
        match granularity {
            Granularity::Second => &self.second,
            Granularity::Minute => &self.minute,
        }
    }

    fn family_mut(&mut self, granularity: Granularity) -> &mut BTreeMap<i64, Bucket> {
        match granularity {
            Granularity::Second => &mut self.second,
            Granularity::Minute => &mut self.minute,
        }
    }

    fn is_empty(&self) -> bool {
        self.second.is_empty() && self.minute.is_empty()
    }
}

// ─── WindowAggregator impl ───────────────────────────────────────

impl WindowAggregator {
    pub fn new(settings: AggregatorSettings) -> Self {
        Self {
            settings,
            inner: RwLock::new(Inner {
                by_addr: HashMap::new(),
                rng: StdRng::from_entropy(),
            }),
        }
    }

    pub fn settings(&self) -> &AggregatorSettings {
        &self.settings
    }

    /// Fold a single event into its second and minute buckets.
    pub fn record(&self, event: &RequestEvent) {
        self.record_batch(std::slice::from_ref(event));
    }

    /// Fold a batch of events under one write lock.
    pub fn record_batch(&self, events: &[RequestEvent]) {
        if events.is_empty() {
            return;
        }
        let mut guard = self.inner.write();
        let Inner { by_addr, rng } = &mut *guard;

        for event in events {
            if !by_addr.contains_key(event.listen_addr.as_str()) {
                by_addr.insert(event.listen_addr.clone(), AddrBuckets::default());
            }
            let Some(buckets) = by_addr.get_mut(event.listen_addr.as_str()) else {
                continue;
            };
            for granularity in Granularity::ALL {
                let start = granularity.bucket_start(event.timestamp);
                buckets
                    .family_mut(granularity)
                    .entry(start)
                    .or_insert_with(|| {
                        Bucket::new(start, self.settings.sample_capacity, self.settings.top_k)
                    })
                    .record(event, rng);
            }
        }
    }

    /// Evict buckets that fell out of their granularity's window, and any
    /// slot stamped further than [`MAX_CLOCK_SKEW_MS`] ahead of `now_ms`.
    /// Returns the number of buckets removed.
    pub fn sweep(&self, now_ms: i64) -> usize {
        let mut guard = self.inner.write();
        let mut removed = 0usize;
        let mut unflushed = 0usize;
        let mut ahead = 0usize;

        for buckets in guard.by_addr.values_mut() {
            for granularity in Granularity::ALL {
                let cutoff = granularity
                    .bucket_start(now_ms.saturating_sub(self.settings.window_ms(granularity)));
                let horizon = granularity.bucket_start(now_ms.saturating_add(MAX_CLOCK_SKEW_MS));
                let family = buckets.family_mut(granularity);

                let future = family.split_off(&horizon.saturating_add(1));
                ahead += future.len();
                let keep = family.split_off(&cutoff);
                let expired = std::mem::replace(family, keep);
                removed += expired.len() + future.len();
                unflushed += expired.values().filter(|b| b.is_dirty()).count();
            }
        }
        guard.by_addr.retain(|_, b| !b.is_empty());

        if unflushed > 0 {
            tracing::debug!(unflushed, "evicted buckets that were never flushed");
        }
        if ahead > 0 {
            tracing::warn!(ahead, "dropped buckets stamped ahead of the clock");
        }
        removed
    }

    /// Snapshot every dirty bucket whose slot has fully elapsed at `now_ms`.
    /// With `include_open` the still-open current slots are included too,
    /// which is what a final flush on shutdown wants.
    pub fn pending_flush(&self, now_ms: i64, include_open: bool) -> Vec<BucketRow> {
        let guard = self.inner.read();
        let mut rows = Vec::new();
        let mut estimated = 0usize;
        for (addr, buckets) in &guard.by_addr {
            for granularity in Granularity::ALL {
                for bucket in buckets.family(granularity).values() {
                    let elapsed = bucket.start_ms + granularity.millis() <= now_ms;
                    if bucket.is_dirty() && (elapsed || include_open) {
                        estimated += usize::from(bucket.percentiles_estimated());
                        rows.push(bucket.to_row(addr, granularity));
                    }
                }
            }
        }
        if estimated > 0 {
            tracing::debug!(
                estimated,
                total = rows.len(),
                "flushing buckets whose p95/p99 are sampled estimates"
            );
        }
        rows
    }

    /// Seed memory with persisted rows. Slots already held in memory are
    /// left alone. Returns the number of buckets restored.
    pub fn restore(&self, rows: impl IntoIterator<Item = BucketRow>) -> usize {
        let mut guard = self.inner.write();
        let mut restored = 0usize;
        for row in rows {
            let family = guard
                .by_addr
                .entry(row.listen_addr.clone())
                .or_default()
                .family_mut(row.granularity);
            if let std::collections::btree_map::Entry::Vacant(slot) = family.entry(row.start_ms) {
                slot.insert(Bucket::from_row(
                    &row,
                    self.settings.sample_capacity,
                    self.settings.top_k,
                ));
                restored += 1;
            }
        }
        restored
    }

    /// Clear the dirty flag of buckets whose counts still match the persisted
    /// snapshot. A bucket that received events after the snapshot stays dirty
    /// and is picked up by the next flush.
    pub fn mark_flushed(&self, rows: &[BucketRow]) {
        let mut guard = self.inner.write();
        for row in rows {
            let bucket = guard
                .by_addr
                .get_mut(row.listen_addr.as_str())
                .and_then(|b| b.family_mut(row.granularity).get_mut(&row.start_ms));
            if let Some(bucket) = bucket {
                if bucket.count == row.count {
                    bucket.mark_clean();
                }
            }
        }
    }

    /// Rows held in memory for `listen_addr` within `[from_slot, to_slot]`.
    pub fn rows_in_range(
        &self,
        listen_addr: &str,
        granularity: Granularity,
        from_slot: i64,
        to_slot: i64,
    ) -> BTreeMap<i64, BucketRow> {
        let guard = self.inner.read();
        let Some(buckets) = guard.by_addr.get(listen_addr) else {
            return BTreeMap::new();
        };
        if to_slot < from_slot {
            return BTreeMap::new();
        }
        buckets
            .family(granularity)
            .range(from_slot..=to_slot)
            .map(|(start, bucket)| (*start, bucket.to_row(listen_addr, granularity)))
            .collect()
    }

    pub fn listen_addrs(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.inner.read().by_addr.keys().cloned().collect();
        addrs.sort();
        addrs
    }

    pub fn bucket_count(&self) -> usize {
        self.inner
            .read()
            .by_addr
            .values()
            .map(|b| b.second.len() + b.minute.len())
            .sum()
    }

    /// Render the live payload: every known listen address over the full
    /// second window and the full minute window ending at `now_ms`.
    pub fn snapshot_payload(&self, now_ms: i64) -> MetricsPayload {
        let addrs = self.listen_addrs();
        let mut payload = MetricsPayload {
            window_seconds: (self.settings.second_window_ms / 1_000) as u64,
            listen_addrs: addrs.clone(),
            minute_window_seconds: (self.settings.minute_window_ms / 1_000) as u64,
            ..MetricsPayload::default()
        };

        for addr in addrs {
            payload
                .by_listen_addr
                .insert(addr.clone(), self.live_series(&addr, Granularity::Second, now_ms));
            payload
                .by_listen_minute
                .insert(addr.clone(), self.live_series(&addr, Granularity::Minute, now_ms));
        }
        payload
    }

    fn live_series(&self, addr: &str, granularity: Granularity, now_ms: i64) -> MetricsSeries {
        let step = granularity.millis();
        let last = granularity.bucket_start(now_ms);
        let first = last - (self.settings.window_ms(granularity) / step - 1).max(0) * step;
        let rows = self.rows_in_range(addr, granularity, first, last);
        MetricsSeries::build(granularity, first, last, &rows, self.settings.top_k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn event(addr: &str, ts: i64, status: u16, latency_ms: f64) -> RequestEvent {
        RequestEvent {
            timestamp: ts,
            listen_addr: addr.into(),
            client_ip: "10.0.0.1".into(),
            method: "GET".into(),
            request_url: "/x".into(),
            request_path: "/x".into(),
            request_host: "h".into(),
            status_code: status,
            upstream: "http://up:80".into(),
            route_key: "h/x".into(),
            latency_ms,
            user_agent: String::new(),
            referer: String::new(),
        }
    }

    fn small() -> WindowAggregator {
        WindowAggregator::new(AggregatorSettings {
            second_window_ms: 60_000,
            minute_window_ms: 600_000,
            ..AggregatorSettings::default()
        })
    }

    #[test]
    fn each_event_hits_one_second_and_one_minute_bucket() {
        let agg = small();
        agg.record(&event("L", 120_500, 200, 10.0));
        agg.record(&event("L", 121_200, 200, 20.0));
        agg.record(&event("L", 121_900, 500, 30.0));

        let seconds = agg.rows_in_range("L", Granularity::Second, 0, 200_000);
        assert_eq!(seconds.len(), 2);
        assert_eq!(seconds[&120_000].count, 1);
        assert_eq!(seconds[&121_000].count, 2);

        let minutes = agg.rows_in_range("L", Granularity::Minute, 0, 200_000);
        assert_eq!(minutes.len(), 1);
        let m = &minutes[&120_000];
        assert_eq!(m.count, 3);
        assert_eq!(m.s2xx, 2);
        assert_eq!(m.s5xx, 1);
        assert_eq!(m.avg_latency_ms(), 20.0);
        assert_eq!(m.latency_max_ms, 30.0);
    }

    #[test]
    fn addresses_are_isolated() {
        let agg = small();
        agg.record(&event("a", 1_000, 200, 1.0));
        agg.record(&event("b", 1_000, 404, 1.0));
        assert_eq!(agg.listen_addrs(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(agg.rows_in_range("a", Granularity::Second, 1_000, 1_000)[&1_000].s4xx, 0);
        assert_eq!(agg.rows_in_range("b", Granularity::Second, 1_000, 1_000)[&1_000].s4xx, 1);
    }

    #[test]
    fn sweep_evicts_per_granularity_window() {
        let agg = small();
        agg.record(&event("L", 0, 200, 1.0));
        agg.record(&event("L", 100_000, 200, 1.0));

        // now = 130s: second window (60s) keeps slots >= 70s, minute window keeps all
        let removed = agg.sweep(130_000);
        assert_eq!(removed, 1);
        assert!(agg.rows_in_range("L", Granularity::Second, 0, 0).is_empty());
        assert_eq!(agg.rows_in_range("L", Granularity::Minute, 0, 0).len(), 1);

        // far in the future everything goes, including the address entry
        agg.sweep(10_000_000);
        assert_eq!(agg.bucket_count(), 0);
        assert!(agg.listen_addrs().is_empty());
    }

    #[test]
    fn sweep_drops_slots_ahead_of_the_clock() {
        let agg = small();
        let now = 1_700_000_000_000;
        // microsecond stamps land decades ahead
        for i in 0..500 {
            agg.record(&event("L", now * 1_000 + i * 1_000_000, 200, 1.0));
        }
        agg.record(&event("L", now + 30_000, 200, 1.0));
        agg.record(&event("L", now - 1_000, 200, 1.0));
        // the two near-now events share one minute slot
        assert_eq!(agg.bucket_count(), 1_000 + 3);

        let removed = agg.sweep(now);
        assert_eq!(removed, 1_000);
        assert_eq!(agg.bucket_count(), 3);
        assert_eq!(agg.rows_in_range("L", Granularity::Second, now + 30_000, now + 30_000).len(), 1);

        // nothing left to grow: another sweep far later empties the map
        agg.sweep(now + 10 * 86_400_000);
        assert_eq!(agg.bucket_count(), 0);
    }

    #[test]
    fn oversized_windows_are_clamped() {
        let cfg = MetricsConfig {
            second_window_secs: u64::MAX,
            minute_window_secs: u64::MAX,
            ..MetricsConfig::default()
        };
        let settings = AggregatorSettings::from(&cfg);
        assert_eq!(settings.second_window_ms, MAX_WINDOW_SECS as i64 * 1_000);
        assert!(settings.minute_window_ms > 0);

        let agg = WindowAggregator::new(settings);
        agg.record(&event("L", 1_700_000_000_000, 200, 1.0));
        assert_eq!(agg.sweep(1_700_000_001_000), 0);
    }

    #[test]
    fn pending_flush_only_returns_elapsed_dirty_buckets() {
        let agg = small();
        agg.record(&event("L", 1_500, 200, 1.0));

        assert!(agg.pending_flush(1_900, false).is_empty());
        let rows = agg.pending_flush(2_000, false);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].granularity, Granularity::Second);

        agg.mark_flushed(&rows);
        assert!(agg.pending_flush(2_000, false).is_empty());
        // minute slot still open but a shutdown flush takes it
        assert_eq!(agg.pending_flush(2_000, true).len(), 1);
    }

    #[test]
    fn restore_seeds_missing_slots_only() {
        let agg = small();
        agg.record(&event("L", 61_000, 200, 1.0));
        let persisted = small();
        persisted.record(&event("L", 5_000, 500, 2.0));
        persisted.record(&event("L", 61_500, 404, 3.0));
        let rows = persisted.pending_flush(i64::MAX, true);

        // second 5s and minute 0 are new, second 61s and minute 60s are live already
        assert_eq!(agg.restore(rows), 2);
        assert_eq!(agg.rows_in_range("L", Granularity::Second, 5_000, 5_000)[&5_000].s5xx, 1);
        assert_eq!(agg.rows_in_range("L", Granularity::Minute, 60_000, 60_000)[&60_000].count, 1);
        // restored buckets are already on disk
        assert!(agg
            .pending_flush(i64::MAX, true)
            .iter()
            .all(|r| r.start_ms == 61_000 || r.start_ms == 60_000));
    }

    #[test]
    fn late_event_redirties_a_flushed_bucket() {
        let agg = small();
        agg.record(&event("L", 1_100, 200, 1.0));
        let rows = agg.pending_flush(5_000, false);
        agg.record(&event("L", 1_200, 200, 1.0));
        agg.mark_flushed(&rows);

        let again = agg.pending_flush(5_000, false);
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].count, 2);
    }

    #[test]
    fn payload_covers_full_windows() {
        let agg = small();
        agg.record(&event("L", 59_000, 200, 5.0));
        let payload = agg.snapshot_payload(59_500);
        assert_eq!(payload.window_seconds, 60);
        assert_eq!(payload.minute_window_seconds, 600);
        assert_eq!(payload.listen_addrs, vec!["L".to_string()]);
        let second = &payload.by_listen_addr["L"];
        assert_eq!(second.len(), 60);
        assert_eq!(*second.timestamps.last().unwrap(), 59_000);
        assert_eq!(*second.counts.last().unwrap(), 1);
        assert_eq!(payload.by_listen_minute["L"].len(), 10);
    }

    #[test]
    fn concurrent_producers_lose_no_updates() {
        let agg = Arc::new(small());
        let handles: Vec<_> = (0..50)
            .map(|p| {
                let agg = agg.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let status = [200, 301, 404, 502, 0][(p + i) % 5];
                        agg.record(&event("L", 10_000 + (i as i64 % 1_000), status, i as f64));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let rows = agg.rows_in_range("L", Granularity::Second, 10_000, 10_000);
        let row = &rows[&10_000];
        assert_eq!(row.count, 10_000);
        assert_eq!(row.count, row.s2xx + row.s3xx + row.s4xx + row.s5xx + row.s0);
        assert_eq!(row.s2xx, 2_000);
        let (p95, p99) = (row.p95.unwrap(), row.p99.unwrap());
        assert!(0.0 <= p95 && p95 <= p99 && p99 <= row.latency_max_ms);
    }
}
