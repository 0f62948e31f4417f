use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use super::{MetricsStore, StoreTuning};
use crate::error::{StoreError, StoreResult};

/// Persistence health snapshot. Computed on demand and never cached.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DBStatus {
    pub enabled: bool,
    pub initialized: bool,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub file_exists: bool,
    pub dir_exists: bool,
    pub dir_writable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_logs_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_logs_min_ts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_logs_max_ts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_file_size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqlite_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronous: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wal_autocheckpoint: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freelist_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub busy_timeout_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wal_file_size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shm_file_size_bytes: Option<u64>,
}

impl DBStatus {
    pub fn disabled(path: &Path) -> Self {
        Self {
            enabled: false,
            path: path.display().to_string(),
            ..Self::default()
        }
    }

    /// Enabled but the store could not be opened: report the error together
    /// with what the filesystem looks like.
    pub fn unavailable(path: &Path, error: &StoreError) -> Self {
        let mut status = Self::probe(path);
        status.enabled = true;
        status.initialized = false;
        status.error = Some(error.to_string());
        status
    }

    fn probe(path: &Path) -> Self {
        let dir = parent_dir(path);
        let dir_exists = dir.is_dir();
        Self {
            path: path.display().to_string(),
            file_exists: path.is_file(),
            dir_exists,
            dir_writable: dir_exists && dir_writable(&dir),
            ..Self::default()
        }
    }
}

impl MetricsStore {
    /// Full diagnostics for a healthy store.
    pub fn status(&self) -> StoreResult<DBStatus> {
        let mut status = DBStatus::probe(self.path());
        status.enabled = true;
        status.initialized = true;
        status.sqlite_version = Some(rusqlite::version().to_string());

        let read = self.with_reader(|conn| {
            read_pragmas(conn, &mut status)?;
            read_log_bounds(conn, &mut status)?;
            Ok(())
        })?;

        if read.is_none() {
            // Nothing on disk yet: report the settings that will be applied on creation.
            let tuning = self.tuning();
            status.journal_mode = Some(StoreTuning::JOURNAL_MODE.to_string());
            status.synchronous = Some(StoreTuning::SYNCHRONOUS.to_string());
            status.wal_autocheckpoint = Some(tuning.wal_autocheckpoint);
            status.cache_size = Some(tuning.cache_size);
            status.busy_timeout_ms = Some(tuning.busy_timeout_ms as i64);
            status.message = Some("database file will be created on first write".to_string());
            return Ok(status);
        }

        status.file_exists = self.path().is_file();
        status.db_file_size_bytes = file_size(self.path());
        status.wal_file_size_bytes = file_size(&sidecar(self.path(), "-wal"));
        status.shm_file_size_bytes = file_size(&sidecar(self.path(), "-shm"));
        Ok(status)
    }
}

fn read_pragmas(conn: &Connection, status: &mut DBStatus) -> StoreResult<()> {
    let int = |name: &str| -> StoreResult<i64> {
        Ok(conn.pragma_query_value(None, name, |row| row.get::<_, i64>(0))?)
    };

    status.journal_mode =
        Some(conn.pragma_query_value(None, "journal_mode", |row| row.get::<_, String>(0))?);
    status.synchronous = Some(synchronous_name(int("synchronous")?));
    status.wal_autocheckpoint = Some(int("wal_autocheckpoint")?);
    status.page_size = Some(int("page_size")?);
    status.page_count = Some(int("page_count")?);
    status.freelist_count = Some(int("freelist_count")?);
    status.cache_size = Some(int("cache_size")?);
    status.busy_timeout_ms = Some(int("busy_timeout")?);
    Ok(())
}

fn read_log_bounds(conn: &Connection, status: &mut DBStatus) -> StoreResult<()> {
    let (count, min_ts, max_ts) = conn.query_row(
        "SELECT COUNT(*), MIN(timestamp), MAX(timestamp) FROM request_logs",
        [],
        |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, Option<i64>>(2)?,
            ))
        },
    )?;
    status.request_logs_count = Some(count);
    status.request_logs_min_ts = min_ts;
    status.request_logs_max_ts = max_ts;
    Ok(())
}

fn synchronous_name(level: i64) -> String {
    match level {
        0 => "OFF".to_string(),
        1 => "NORMAL".to_string(),
        2 => "FULL".to_string(),
        3 => "EXTRA".to_string(),
        other => other.to_string(),
    }
}

fn file_size(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().map(|m| m.len())
}

/// `metrics.db` → `metrics.db-wal` / `metrics.db-shm`
fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Directory holding `path`; a bare file name resolves to the working directory.
pub(crate) fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Probe writability by creating and removing a scratch file.
pub(crate) fn dir_writable(dir: &Path) -> bool {
    let probe = dir.join(format!(".proxy-metrics-probe-{}", std::process::id()));
    match OpenOptions::new().write(true).create_new(true).open(&probe) {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::temp_store;
    use tempfile::TempDir;

    #[test]
    fn fresh_writable_path_is_initialized_without_file() {
        let (_dir, store) = temp_store();
        let status = store.status().unwrap();
        assert!(status.enabled);
        assert!(status.initialized);
        assert!(!status.file_exists);
        assert!(status.dir_exists);
        assert!(status.dir_writable);
        assert!(status.error.is_none());
        assert_eq!(status.journal_mode.as_deref(), Some("wal"));
        assert_eq!(status.busy_timeout_ms, Some(5_000));
    }

    #[test]
    fn open_store_reports_engine_tuning_verbatim() {
        let (_dir, store) = temp_store();
        store.with_conn(true, |_| Ok(())).unwrap();

        let status = store.status().unwrap();
        assert!(status.file_exists);
        assert_eq!(status.journal_mode.as_deref(), Some("wal"));
        assert_eq!(status.synchronous.as_deref(), Some("NORMAL"));
        assert_eq!(status.busy_timeout_ms, Some(5_000));
        assert_eq!(status.wal_autocheckpoint, Some(1_000));
        assert_eq!(status.cache_size, Some(-2_000));
        assert_eq!(status.request_logs_count, Some(0));
        assert_eq!(status.request_logs_min_ts, None);
        assert!(status.page_size.unwrap() > 0);
        assert!(status.db_file_size_bytes.is_some());
    }

    #[test]
    fn disabled_only_reports_enabled_false() {
        let status = DBStatus::disabled(Path::new("/tmp/x.db"));
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["enabled"], false);
        assert!(json.get("error").is_none());
        assert!(json.get("journal_mode").is_none());
    }

    #[test]
    fn unavailable_reports_error_and_environment() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing/metrics.db");
        let err = StoreError::Path("directory does not exist".into());
        let status = DBStatus::unavailable(&path, &err);
        assert!(status.enabled);
        assert!(!status.initialized);
        assert!(!status.dir_exists);
        assert!(!status.dir_writable);
        assert!(status.error.unwrap().contains("does not exist"));
    }

    #[test]
    fn sidecar_appends_suffix() {
        assert_eq!(sidecar(Path::new("/a/m.db"), "-wal"), PathBuf::from("/a/m.db-wal"));
    }
}
