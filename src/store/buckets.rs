use std::collections::BTreeMap;

use rusqlite::{params, Row};

use super::MetricsStore;
use crate::error::{StoreError, StoreResult};
use crate::metrics::bucket::BucketRow;
use crate::metrics::{now_ms, Granularity, KV};

const UPSERT: &str = "
INSERT INTO metrics_buckets (
    listen_addr, granularity, bucket_start, count, s2xx, s3xx, s4xx, s5xx, s0,
    latency_sum_ms, latency_max_ms, p95, p99,
    upstream_dist, route_err, upstream_err, latency_dist, updated_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
ON CONFLICT(listen_addr, granularity, bucket_start) DO UPDATE SET
    count = excluded.count,
    s2xx = excluded.s2xx,
    s3xx = excluded.s3xx,
    s4xx = excluded.s4xx,
    s5xx = excluded.s5xx,
    s0 = excluded.s0,
    latency_sum_ms = excluded.latency_sum_ms,
    latency_max_ms = excluded.latency_max_ms,
    p95 = excluded.p95,
    p99 = excluded.p99,
    upstream_dist = excluded.upstream_dist,
    route_err = excluded.route_err,
    upstream_err = excluded.upstream_err,
    latency_dist = excluded.latency_dist,
    updated_at = excluded.updated_at";

impl MetricsStore {
    /// Upsert bucket snapshots. Every aggregate column is overwritten, so
    /// flushing the same bucket twice leaves the latest values, never a sum.
    pub fn flush_buckets(&self, rows: &[BucketRow]) -> StoreResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let updated_at = now_ms();
        let written = self.with_conn(true, |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(UPSERT)?;
                for row in rows {
                    stmt.execute(params![
                        row.listen_addr,
                        row.granularity.as_str(),
                        row.start_ms,
                        to_i64(row.count),
                        to_i64(row.s2xx),
                        to_i64(row.s3xx),
                        to_i64(row.s4xx),
                        to_i64(row.s5xx),
                        to_i64(row.s0),
                        row.latency_sum_ms,
                        row.latency_max_ms,
                        row.p95,
                        row.p99,
                        serde_json::to_string(&row.upstream_dist)?,
                        serde_json::to_string(&row.route_err)?,
                        serde_json::to_string(&row.upstream_err)?,
                        serde_json::to_string(&row.latency_dist)?,
                        updated_at,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(rows.len())
        })?;
        Ok(written.unwrap_or(0))
    }

    /// Persisted buckets for `listen_addr` with `from_slot <= start <= to_slot`.
    pub fn query_buckets(
        &self,
        listen_addr: &str,
        granularity: Granularity,
        from_slot: i64,
        to_slot: i64,
    ) -> StoreResult<BTreeMap<i64, BucketRow>> {
        let rows = self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT listen_addr, bucket_start, count, s2xx, s3xx, s4xx, s5xx, s0, \
                 latency_sum_ms, latency_max_ms, p95, p99, \
                 upstream_dist, route_err, upstream_err, latency_dist \
                 FROM metrics_buckets \
                 WHERE listen_addr = ?1 AND granularity = ?2 AND bucket_start BETWEEN ?3 AND ?4 \
                 ORDER BY bucket_start",
            )?;
            let mut out = BTreeMap::new();
            let mut rows = stmt.query(params![listen_addr, granularity.as_str(), from_slot, to_slot])?;
            while let Some(row) = rows.next()? {
                let bucket = bucket_from_row(row, granularity)?;
                out.insert(bucket.start_ms, bucket);
            }
            Ok(out)
        })?;
        Ok(rows.unwrap_or_default())
    }

    /// Persisted buckets of every listen address within `[from_slot, to_slot]`.
    pub fn buckets_between(
        &self,
        granularity: Granularity,
        from_slot: i64,
        to_slot: i64,
    ) -> StoreResult<Vec<BucketRow>> {
        let rows = self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT listen_addr, bucket_start, count, s2xx, s3xx, s4xx, s5xx, s0, \
                 latency_sum_ms, latency_max_ms, p95, p99, \
                 upstream_dist, route_err, upstream_err, latency_dist \
                 FROM metrics_buckets \
                 WHERE granularity = ?1 AND bucket_start BETWEEN ?2 AND ?3",
            )?;
            let mut out = Vec::new();
            let mut rows = stmt.query(params![granularity.as_str(), from_slot, to_slot])?;
            while let Some(row) = rows.next()? {
                out.push(bucket_from_row(row, granularity)?);
            }
            Ok(out)
        })?;
        Ok(rows.unwrap_or_default())
    }
}

fn bucket_from_row(row: &Row<'_>, granularity: Granularity) -> StoreResult<BucketRow> {
    Ok(BucketRow {
        listen_addr: row.get(0)?,
        granularity,
        start_ms: row.get(1)?,
        count: from_i64(row.get(2)?),
        s2xx: from_i64(row.get(3)?),
        s3xx: from_i64(row.get(4)?),
        s4xx: from_i64(row.get(5)?),
        s5xx: from_i64(row.get(6)?),
        s0: from_i64(row.get(7)?),
        latency_sum_ms: row.get(8)?,
        latency_max_ms: row.get(9)?,
        p95: row.get(10)?,
        p99: row.get(11)?,
        upstream_dist: dist(row, 12)?,
        route_err: dist(row, 13)?,
        upstream_err: dist(row, 14)?,
        latency_dist: dist(row, 15)?,
    })
}

fn dist(row: &Row<'_>, idx: usize) -> StoreResult<Vec<KV>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(StoreError::from)
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn from_i64(v: i64) -> u64 {
    v.max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::temp_store;

    fn row(start: i64, count: u64) -> BucketRow {
        BucketRow {
            listen_addr: "L".into(),
            granularity: Granularity::Second,
            start_ms: start,
            count,
            s2xx: count - 1,
            s3xx: 0,
            s4xx: 0,
            s5xx: 1,
            s0: 0,
            latency_sum_ms: 10.0 * count as f64,
            latency_max_ms: 30.0,
            p95: Some(29.0),
            p99: Some(29.8),
            upstream_dist: vec![KV {
                key: "u1".into(),
                value: count,
            }],
            route_err: vec![KV {
                key: "r2".into(),
                value: 1,
            }],
            upstream_err: vec![],
            latency_dist: vec![KV {
                key: "10-50ms".into(),
                value: count,
            }],
        }
    }

    #[test]
    fn double_flush_keeps_latest_values() {
        let (_dir, store) = temp_store();
        store.flush_buckets(&[row(1_000, 3)]).unwrap();
        store.flush_buckets(&[row(1_000, 5)]).unwrap();

        let rows = store.query_buckets("L", Granularity::Second, 0, 10_000).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[&1_000], row(1_000, 5));
    }

    #[test]
    fn range_and_granularity_are_respected() {
        let (_dir, store) = temp_store();
        let mut minute = row(60_000, 2);
        minute.granularity = Granularity::Minute;
        store
            .flush_buckets(&[row(1_000, 2), row(2_000, 2), row(3_000, 2), minute])
            .unwrap();

        let rows = store.query_buckets("L", Granularity::Second, 2_000, 3_000).unwrap();
        assert_eq!(rows.keys().copied().collect::<Vec<_>>(), vec![2_000, 3_000]);

        let minutes = store.query_buckets("L", Granularity::Minute, 0, 120_000).unwrap();
        assert_eq!(minutes.len(), 1);
        assert!(store.query_buckets("other", Granularity::Second, 0, 10_000).unwrap().is_empty());
    }

    #[test]
    fn buckets_between_spans_addresses() {
        let (_dir, store) = temp_store();
        let mut other = row(2_000, 4);
        other.listen_addr = "M".into();
        store
            .flush_buckets(&[row(1_000, 2), row(2_000, 2), other, row(9_000, 2)])
            .unwrap();

        let rows = store.buckets_between(Granularity::Second, 1_500, 5_000).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.start_ms == 2_000));
        assert!(store.buckets_between(Granularity::Minute, 0, 10_000).unwrap().is_empty());
    }

    #[test]
    fn empty_percentiles_round_trip_as_null() {
        let (_dir, store) = temp_store();
        let mut r = row(1_000, 1);
        r.p95 = None;
        r.p99 = None;
        store.flush_buckets(&[r.clone()]).unwrap();
        assert_eq!(store.query_buckets("L", Granularity::Second, 1_000, 1_000).unwrap()[&1_000], r);
    }

    #[test]
    fn prune_removes_old_buckets() {
        let (_dir, store) = temp_store();
        store.flush_buckets(&[row(1_000, 1), row(5_000, 1)]).unwrap();
        assert_eq!(store.prune_before(2_000).unwrap(), 1);
        let rows = store.query_buckets("L", Granularity::Second, 0, 10_000).unwrap();
        assert_eq!(rows.keys().copied().collect::<Vec<_>>(), vec![5_000]);
    }
}
