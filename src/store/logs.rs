use rusqlite::types::ToSql;
use rusqlite::{params, params_from_iter, Row};
use serde::{Deserialize, Serialize};

use super::MetricsStore;
use crate::error::StoreResult;
use crate::metrics::RequestEvent;

/// A persisted request event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestLog {
    pub id: i64,
    #[serde(flatten)]
    pub event: RequestEvent,
}

/// Log search criteria. `None` means no constraint on that column.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    /// Inclusive, ms epoch
    pub start_ms: i64,
    /// Inclusive, ms epoch
    pub end_ms: i64,
    pub listen_addr: Option<String>,
    pub upstream: Option<String>,
    /// Substring match against the request path
    pub request_path: Option<String>,
    pub client_ip: Option<String>,
    pub status_code: Option<u16>,
}

#[derive(Debug, Clone, Default)]
pub struct LogPage {
    pub rows: Vec<RequestLog>,
    /// Matching rows across all pages
    pub total: u64,
}

const LOG_COLUMNS: &str = "id, timestamp, listen_addr, client_ip, method, request_url, request_path, \
     request_host, status_code, upstream, route_key, latency_ms, user_agent, referer";

impl LogFilter {
    fn where_clause(&self) -> (String, Vec<Box<dyn ToSql>>) {
        let mut clauses = vec!["timestamp >= ?".to_string(), "timestamp <= ?".to_string()];
        let mut args: Vec<Box<dyn ToSql>> = vec![Box::new(self.start_ms), Box::new(self.end_ms)];

        if let Some(addr) = &self.listen_addr {
            clauses.push("listen_addr = ?".into());
            args.push(Box::new(addr.clone()));
        }
        if let Some(upstream) = &self.upstream {
            clauses.push("upstream = ?".into());
            args.push(Box::new(upstream.clone()));
        }
        if let Some(path) = &self.request_path {
            clauses.push("instr(request_path, ?) > 0".into());
            args.push(Box::new(path.clone()));
        }
        if let Some(ip) = &self.client_ip {
            clauses.push("client_ip = ?".into());
            args.push(Box::new(ip.clone()));
        }
        if let Some(status) = self.status_code {
            clauses.push("status_code = ?".into());
            args.push(Box::new(status));
        }

        (format!("WHERE {}", clauses.join(" AND ")), args)
    }
}

impl MetricsStore {
    /// Insert `events` in one transaction. Returns once the commit succeeded.
    pub fn append_batch(&self, events: &[RequestEvent]) -> StoreResult<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        let written = self.with_conn(true, |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO request_logs (timestamp, listen_addr, client_ip, method, request_url, \
                     request_path, request_host, status_code, upstream, route_key, latency_ms, \
                     user_agent, referer) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                )?;
                for e in events {
                    stmt.execute(params![
                        e.timestamp,
                        e.listen_addr,
                        e.client_ip,
                        e.method,
                        e.request_url,
                        e.request_path,
                        e.request_host,
                        e.status_code,
                        e.upstream,
                        e.route_key,
                        e.latency_ms,
                        e.user_agent,
                        e.referer,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(events.len())
        })?;
        Ok(written.unwrap_or(0))
    }

    /// Newest first, ties broken by id so paging is stable. The count and the
    /// page are read in the same transaction.
    pub fn query_logs(&self, filter: &LogFilter, limit: u64, offset: u64) -> StoreResult<LogPage> {
        let page = self.with_reader(|conn| {
            let (where_sql, args) = filter.where_clause();
            let tx = conn.transaction()?;

            let total: i64 = tx.query_row(
                &format!("SELECT COUNT(*) FROM request_logs {where_sql}"),
                params_from_iter(args.iter()),
                |row| row.get(0),
            )?;

            let mut rows = Vec::new();
            if total > 0 && offset < total as u64 {
                let sql = format!(
                    "SELECT {LOG_COLUMNS} FROM request_logs {where_sql} \
                     ORDER BY timestamp DESC, id DESC LIMIT {} OFFSET {}",
                    i64::try_from(limit).unwrap_or(i64::MAX),
                    i64::try_from(offset).unwrap_or(i64::MAX),
                );
                let mut stmt = tx.prepare(&sql)?;
                let mapped = stmt.query_map(params_from_iter(args.iter()), log_from_row)?;
                for row in mapped {
                    rows.push(row?);
                }
            }
            tx.commit()?;

            Ok(LogPage {
                rows,
                total: total.max(0) as u64,
            })
        })?;
        Ok(page.unwrap_or_default())
    }
}

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<RequestLog> {
    Ok(RequestLog {
        id: row.get(0)?,
        event: RequestEvent {
            timestamp: row.get(1)?,
            listen_addr: row.get(2)?,
            client_ip: row.get(3)?,
            method: row.get(4)?,
            request_url: row.get(5)?,
            request_path: row.get(6)?,
            request_host: row.get(7)?,
            status_code: row.get(8)?,
            upstream: row.get(9)?,
            route_key: row.get(10)?,
            latency_ms: row.get(11)?,
            user_agent: row.get(12)?,
            referer: row.get(13)?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::temp_store;

    fn event(ts: i64, addr: &str, path: &str, status: u16) -> RequestEvent {
        RequestEvent {
            timestamp: ts,
            listen_addr: addr.into(),
            client_ip: "10.0.0.1".into(),
            method: "GET".into(),
            request_url: format!("http://h{path}"),
            request_path: path.into(),
            request_host: "h".into(),
            status_code: status,
            upstream: "up-a".into(),
            route_key: "r".into(),
            latency_ms: 4.5,
            user_agent: "curl/8".into(),
            referer: String::new(),
        }
    }

    fn all(start: i64, end: i64) -> LogFilter {
        LogFilter {
            start_ms: start,
            end_ms: end,
            ..LogFilter::default()
        }
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let (dir, store) = temp_store();
        let page = store.query_logs(&all(0, i64::MAX), 10, 0).unwrap();
        assert_eq!(page.total, 0);
        assert!(page.rows.is_empty());
        assert!(!dir.path().join("metrics.db").exists());
    }

    #[test]
    fn newest_first_with_stable_ties() {
        let (_dir, store) = temp_store();
        store
            .append_batch(&[
                event(1_000, "L", "/a", 200),
                event(2_000, "L", "/b", 200),
                event(2_000, "L", "/c", 200),
            ])
            .unwrap();

        let page = store.query_logs(&all(0, 10_000), 10, 0).unwrap();
        let paths: Vec<_> = page.rows.iter().map(|r| r.event.request_path.as_str()).collect();
        assert_eq!(paths, ["/c", "/b", "/a"]);
        assert!(page.rows[0].id > page.rows[1].id);
        assert_eq!(page.rows[2].event, event(1_000, "L", "/a", 200));
    }

    #[test]
    fn pages_cover_total_exactly() {
        let (_dir, store) = temp_store();
        let events: Vec<_> = (0..23).map(|i| event(i * 10, "L", "/p", 200)).collect();
        store.append_batch(&events).unwrap();

        let mut seen = 0;
        for page in 0..3 {
            let p = store.query_logs(&all(0, 1_000), 10, page * 10).unwrap();
            assert_eq!(p.total, 23);
            seen += p.rows.len();
        }
        assert_eq!(seen, 23);

        let beyond = store.query_logs(&all(0, 1_000), 10, 30).unwrap();
        assert_eq!(beyond.total, 23);
        assert!(beyond.rows.is_empty());
    }

    #[test]
    fn filters_combine() {
        let (_dir, store) = temp_store();
        store
            .append_batch(&[
                event(100, "L", "/api/users", 200),
                event(200, "L", "/api/users/7", 502),
                event(300, "M", "/api/users", 502),
                event(400, "L", "/health", 502),
            ])
            .unwrap();

        let filter = LogFilter {
            listen_addr: Some("L".into()),
            request_path: Some("users".into()),
            status_code: Some(502),
            ..all(0, 1_000)
        };
        let page = store.query_logs(&filter, 10, 0).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.rows[0].event.request_path, "/api/users/7");

        let window = store.query_logs(&all(200, 300), 10, 0).unwrap();
        assert_eq!(window.total, 2);
    }

    #[test]
    fn request_log_wire_shape_is_flat() {
        let log = RequestLog {
            id: 9,
            event: event(5, "L", "/x", 200),
        };
        let json = serde_json::to_value(&log).unwrap();
        assert_eq!(json["id"], 9);
        assert_eq!(json["clientIP"], "10.0.0.1");
        assert_eq!(json["requestURL"], "http://h/x");
        assert_eq!(json["statusCode"], 200);
    }
}
