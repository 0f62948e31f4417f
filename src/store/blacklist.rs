use std::collections::HashSet;

use parking_lot::RwLock;
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};

use super::MetricsStore;
use crate::error::{StoreError, StoreResult};

/// A blocked client IP. Times are unix seconds; `expires_at == 0` never expires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub id: i64,
    pub ip: String,
    pub reason: Option<String>,
    pub expires_at: i64,
    pub created_at: i64,
}

impl BlacklistEntry {
    pub fn is_active(&self, now_secs: i64) -> bool {
        self.expires_at == 0 || self.expires_at > now_secs
    }
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<BlacklistEntry> {
    Ok(BlacklistEntry {
        id: row.get(0)?,
        ip: row.get(1)?,
        reason: row.get(2)?,
        expires_at: row.get(3)?,
        created_at: row.get(4)?,
    })
}

impl MetricsStore {
    /// Block `ip`, replacing any existing entry for it. `duration_hours <= 0`
    /// blocks permanently.
    pub fn add_blacklist(
        &self,
        ip: &str,
        reason: Option<&str>,
        duration_hours: i64,
        now_secs: i64,
    ) -> StoreResult<BlacklistEntry> {
        let expires_at = if duration_hours > 0 {
            now_secs.saturating_add(duration_hours.saturating_mul(3_600))
        } else {
            0
        };
        let reason = reason.map(str::trim).filter(|r| !r.is_empty());

        let entry = self.with_conn(true, |conn| {
            let entry = conn.query_row(
                "INSERT INTO blacklist (ip, reason, expires_at, created_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(ip) DO UPDATE SET
                    reason = excluded.reason,
                    expires_at = excluded.expires_at,
                    created_at = excluded.created_at
                 RETURNING id, ip, reason, expires_at, created_at",
                params![ip, reason, expires_at, now_secs],
                entry_from_row,
            )?;
            Ok(entry)
        })?;
        entry.ok_or_else(|| StoreError::Unavailable("blacklist insert returned no row".into()))
    }

    /// Returns whether an entry was removed.
    pub fn remove_blacklist(&self, ip: &str) -> StoreResult<bool> {
        let removed = self.with_conn(false, |conn| {
            Ok(conn.execute("DELETE FROM blacklist WHERE ip = ?1", [ip])? > 0)
        })?;
        Ok(removed.unwrap_or(false))
    }

    /// Every entry, expired ones included, newest first.
    pub fn list_blacklist(&self) -> StoreResult<Vec<BlacklistEntry>> {
        let entries = self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, ip, reason, expires_at, created_at FROM blacklist
                 ORDER BY created_at DESC, id DESC",
            )?;
            let rows = stmt.query_map([], entry_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })?;
        Ok(entries.unwrap_or_default())
    }

    /// IPs whose entry has not expired at `now_secs`.
    pub fn active_blacklist_ips(&self, now_secs: i64) -> StoreResult<HashSet<String>> {
        let ips = self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT ip FROM blacklist WHERE expires_at = 0 OR expires_at > ?1",
            )?;
            let rows = stmt.query_map([now_secs], |row| row.get::<_, String>(0))?;
            let mut out = HashSet::new();
            for ip in rows {
                out.insert(ip?);
            }
            Ok(out)
        })?;
        Ok(ips.unwrap_or_default())
    }
}

/// In-memory copy of the active blacklist, consulted on the request path
/// without touching SQLite.
#[derive(Default)]
pub struct BlacklistCache {
    ips: RwLock<HashSet<String>>,
}

impl BlacklistCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reload from the store. Returns the number of active entries.
    pub fn refresh(&self, store: &MetricsStore, now_secs: i64) -> StoreResult<usize> {
        let ips = store.active_blacklist_ips(now_secs)?;
        Ok(self.replace(ips))
    }

    /// Swap in a freshly loaded set. Returns its size.
    pub fn replace(&self, ips: HashSet<String>) -> usize {
        let n = ips.len();
        *self.ips.write() = ips;
        tracing::debug!(active = n, "blacklist cache refreshed");
        n
    }

    pub fn is_blocked(&self, ip: &str) -> bool {
        self.ips.read().contains(ip)
    }
}
