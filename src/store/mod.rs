//! SQLite persistence for request logs, flushed buckets and the IP blacklist.
//!
//! A [`MetricsStore`] owns a writer connection in WAL mode plus a separate
//! `query_only` reader, so searches and status reads never queue behind a
//! flush transaction. The database file is created lazily on the first
//! write, so a freshly configured path reports as initialized before any
//! file exists. All access from async code goes through [`run_blocking`],
//! which bounds every call by a deadline.

pub mod blacklist;
pub mod buckets;
pub mod logs;
pub mod status;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};

use crate::config::MetricsStorageConfig;
use crate::error::{StoreError, StoreResult};

pub use blacklist::{BlacklistCache, BlacklistEntry};
pub use logs::{LogFilter, LogPage, RequestLog};
pub use status::DBStatus;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS request_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    listen_addr TEXT NOT NULL,
    client_ip TEXT NOT NULL,
    method TEXT NOT NULL,
    request_url TEXT NOT NULL,
    request_path TEXT NOT NULL,
    request_host TEXT NOT NULL,
    status_code INTEGER NOT NULL,
    upstream TEXT NOT NULL,
    route_key TEXT NOT NULL,
    latency_ms REAL NOT NULL,
    user_agent TEXT NOT NULL,
    referer TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_request_logs_time ON request_logs(timestamp);
CREATE INDEX IF NOT EXISTS idx_request_logs_addr_time ON request_logs(listen_addr, timestamp);

CREATE TABLE IF NOT EXISTS metrics_buckets (
    listen_addr TEXT NOT NULL,
    granularity TEXT NOT NULL,
    bucket_start INTEGER NOT NULL,
    count INTEGER NOT NULL,
    s2xx INTEGER NOT NULL,
    s3xx INTEGER NOT NULL,
    s4xx INTEGER NOT NULL,
    s5xx INTEGER NOT NULL,
    s0 INTEGER NOT NULL,
    latency_sum_ms REAL NOT NULL,
    latency_max_ms REAL NOT NULL,
    p95 REAL,
    p99 REAL,
    upstream_dist TEXT NOT NULL DEFAULT '[]',
    route_err TEXT NOT NULL DEFAULT '[]',
    upstream_err TEXT NOT NULL DEFAULT '[]',
    latency_dist TEXT NOT NULL DEFAULT '[]',
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (listen_addr, granularity, bucket_start)
);

CREATE TABLE IF NOT EXISTS blacklist (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ip TEXT NOT NULL UNIQUE,
    reason TEXT,
    expires_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);
";

/// Durability/concurrency settings applied on every open and reported back
/// verbatim in [`DBStatus`].
#[derive(Debug, Clone)]
pub struct StoreTuning {
    pub busy_timeout_ms: u64,
    pub wal_autocheckpoint: i64,
    pub cache_size: i64,
}

impl StoreTuning {
    pub const JOURNAL_MODE: &'static str = "wal";
    pub const SYNCHRONOUS: &'static str = "NORMAL";
}

impl Default for StoreTuning {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            wal_autocheckpoint: 1_000,
            cache_size: -2_000,
        }
    }
}

impl From<&MetricsStorageConfig> for StoreTuning {
    fn from(cfg: &MetricsStorageConfig) -> Self {
        Self {
            busy_timeout_ms: cfg.busy_timeout_ms,
            wal_autocheckpoint: cfg.wal_autocheckpoint,
            cache_size: cfg.cache_size,
        }
    }
}

pub struct MetricsStore {
    path: PathBuf,
    tuning: StoreTuning,
    conn: Mutex<Option<Connection>>,
    reader: Mutex<Option<Connection>>,
    /// Set once the schema exists on disk; readers never open before that.
    migrated: AtomicBool,
}

impl MetricsStore {
    /// Validate the target directory and, when the file already exists, open
    /// and migrate it right away so corruption surfaces at startup.
    pub fn open(path: &Path, tuning: StoreTuning) -> StoreResult<Self> {
        check_directory(path)?;
        let store = Self {
            path: path.to_path_buf(),
            tuning,
            conn: Mutex::new(None),
            reader: Mutex::new(None),
            migrated: AtomicBool::new(false),
        };
        if path.exists() {
            let conn = store.connect()?;
            *store.conn.lock() = Some(conn);
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tuning(&self) -> &StoreTuning {
        &self.tuning
    }

    pub fn is_open(&self) -> bool {
        self.conn.lock().is_some()
    }

    fn connect(&self) -> StoreResult<Connection> {
        let shown = self.path.display().to_string();
        let conn = Connection::open(&self.path).map_err(|e| match StoreError::from(e) {
            StoreError::Sqlite(e) => StoreError::Open(format!("{shown}: {e}")),
            other => other,
        })?;
        apply_tuning(&conn, &self.tuning).map_err(|e| match StoreError::from(e) {
            StoreError::Corrupt(reason) => StoreError::Corrupt(format!("{shown}: {reason}")),
            other => other,
        })?;
        conn.execute_batch(SCHEMA)?;
        self.migrated.store(true, Ordering::Release);
        tracing::info!(path = %shown, "metrics database opened");
        Ok(conn)
    }

    /// Read-side connection. It never creates the file and refuses writes.
    fn connect_reader(&self) -> StoreResult<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_URI;
        let conn = Connection::open_with_flags(&self.path, flags)?;
        conn.busy_timeout(Duration::from_millis(self.tuning.busy_timeout_ms))?;
        conn.execute_batch(&format!(
            "PRAGMA synchronous={};
             PRAGMA wal_autocheckpoint={};
             PRAGMA cache_size={};
             PRAGMA query_only=1;",
            StoreTuning::SYNCHRONOUS,
            self.tuning.wal_autocheckpoint,
            self.tuning.cache_size,
        ))?;
        tracing::debug!(path = %self.path.display(), "metrics reader opened");
        Ok(conn)
    }

    /// Run `f` against the connection. With `create == false` and no file on
    /// disk yet, returns `Ok(None)` without creating anything.
    pub(crate) fn with_conn<R>(
        &self,
        create: bool,
        f: impl FnOnce(&mut Connection) -> StoreResult<R>,
    ) -> StoreResult<Option<R>> {
        let mut guard = self.conn.lock();
        if guard.is_none() {
            if !create && !self.path.exists() {
                return Ok(None);
            }
            *guard = Some(self.connect()?);
        }
        match guard.as_mut() {
            Some(conn) => f(conn).map(Some),
            None => Ok(None),
        }
    }

    /// Run a read against the reader connection. Returns `Ok(None)` while the
    /// database has not been created yet.
    pub(crate) fn with_reader<R>(
        &self,
        f: impl FnOnce(&mut Connection) -> StoreResult<R>,
    ) -> StoreResult<Option<R>> {
        if !self.migrated.load(Ordering::Acquire) {
            return Ok(None);
        }
        let mut guard = self.reader.lock();
        if guard.is_none() {
            *guard = Some(self.connect_reader()?);
        }
        match guard.as_mut() {
            Some(conn) => f(conn).map(Some),
            None => Ok(None),
        }
    }

    /// Delete log rows and buckets older than `cutoff_ms`. Returns rows removed.
    pub fn prune_before(&self, cutoff_ms: i64) -> StoreResult<usize> {
        let removed = self.with_conn(false, |conn| {
            let tx = conn.transaction()?;
            let logs = tx.execute("DELETE FROM request_logs WHERE timestamp < ?1", [cutoff_ms])?;
            let buckets =
                tx.execute("DELETE FROM metrics_buckets WHERE bucket_start < ?1", [cutoff_ms])?;
            tx.commit()?;
            Ok(logs + buckets)
        })?;
        Ok(removed.unwrap_or(0))
    }

    /// Check a candidate database path without touching the live store.
    /// Returns whether it is usable and a human readable explanation.
    pub fn test_connection(path: &Path) -> (bool, String) {
        if let Err(e) = check_directory(path) {
            return (false, e.to_string());
        }
        if !path.exists() {
            return (
                true,
                format!(
                    "directory is writable; {} will be created on first write",
                    path.display()
                ),
            );
        }
        let result = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .and_then(|conn| {
                conn.query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            });
        match result {
            Ok(check) if check == "ok" => (
                true,
                format!("connected to {} (SQLite {})", path.display(), rusqlite::version()),
            ),
            Ok(check) => (false, format!("integrity check failed: {check}")),
            Err(e) => (false, StoreError::from(e).to_string()),
        }
    }
}

fn apply_tuning(conn: &Connection, tuning: &StoreTuning) -> rusqlite::Result<()> {
    conn.busy_timeout(Duration::from_millis(tuning.busy_timeout_ms))?;
    conn.execute_batch(&format!(
        "PRAGMA journal_mode={};
         PRAGMA synchronous={};
         PRAGMA wal_autocheckpoint={};
         PRAGMA cache_size={};",
        StoreTuning::JOURNAL_MODE,
        StoreTuning::SYNCHRONOUS,
        tuning.wal_autocheckpoint,
        tuning.cache_size,
    ))
}

/// The parent directory must exist and accept new files.
fn check_directory(path: &Path) -> StoreResult<()> {
    if path.as_os_str().is_empty() || path.is_dir() {
        return Err(StoreError::Path(format!("{} is not a file path", path.display())));
    }
    let dir = status::parent_dir(path);
    if !dir.is_dir() {
        return Err(StoreError::Path(format!("directory {} does not exist", dir.display())));
    }
    if !status::dir_writable(&dir) {
        return Err(StoreError::Permission(format!(
            "directory {} is not writable",
            dir.display()
        )));
    }
    Ok(())
}

/// Persistence as configured at startup.
pub enum Persistence {
    Disabled { path: PathBuf },
    /// Enabled but could not be opened; the rest of the engine runs memory-only.
    Unavailable { path: PathBuf, error: StoreError },
    Ready(Arc<MetricsStore>),
}

impl Persistence {
    pub fn from_config(cfg: &MetricsStorageConfig) -> Self {
        let path = PathBuf::from(cfg.db_path.trim());
        if !cfg.enabled {
            tracing::info!("metrics storage disabled");
            return Self::Disabled { path };
        }
        match MetricsStore::open(&path, StoreTuning::from(cfg)) {
            Ok(store) => Self::Ready(Arc::new(store)),
            Err(error) => {
                tracing::error!(path = %path.display(), error = %error, "metrics storage unavailable");
                Self::Unavailable { path, error }
            }
        }
    }

    pub fn store(&self) -> StoreResult<Arc<MetricsStore>> {
        match self {
            Self::Ready(store) => Ok(store.clone()),
            Self::Disabled { .. } => Err(StoreError::Disabled),
            Self::Unavailable { error, .. } => Err(StoreError::Unavailable(error.to_string())),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// Health snapshot, bounded by `deadline`.
    pub async fn status(&self, deadline: Duration) -> StoreResult<DBStatus> {
        match self {
            Self::Disabled { path } => Ok(DBStatus::disabled(path)),
            Self::Unavailable { path, error } => Ok(DBStatus::unavailable(path, error)),
            Self::Ready(store) => {
                let store = store.clone();
                run_blocking(deadline, move || store.status()).await
            }
        }
    }
}

/// Run a blocking store call on the blocking pool, giving up after `deadline`.
pub async fn run_blocking<R, F>(deadline: Duration, f: F) -> StoreResult<R>
where
    R: Send + 'static,
    F: FnOnce() -> StoreResult<R> + Send + 'static,
{
    match tokio::time::timeout(deadline, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(StoreError::Worker(join.to_string())),
        Err(_) => Err(StoreError::Timeout(deadline)),
    }
}
