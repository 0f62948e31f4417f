use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV: &str = "PROXY_METRICS_CONFIG";

/// Longest in-memory window either granularity may keep (30 days).
pub const MAX_WINDOW_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub metrics_storage: MetricsStorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
}

/// Tuning for the in-memory aggregation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Retention horizon for per-second buckets (also the live payload window).
    #[serde(default = "default_second_window_secs")]
    pub second_window_secs: u64,
    /// Retention horizon for per-minute buckets.
    #[serde(default = "default_minute_window_secs")]
    pub minute_window_secs: u64,
    /// Latency samples kept per bucket for p95/p99.
    #[serde(default = "default_sample_capacity")]
    pub sample_capacity: usize,
    /// Entries kept per distribution map.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Capacity of each recorder queue; events beyond it are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_stream_interval_ms")]
    pub stream_interval_ms: u64,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    /// Upper bound on the number of slots a single series query may span.
    #[serde(default = "default_max_series_points")]
    pub max_series_points: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsStorageConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_wal_autocheckpoint")]
    pub wal_autocheckpoint: i64,
    /// SQLite `cache_size` pragma; negative values are KiB.
    #[serde(default = "default_cache_size")]
    pub cache_size: i64,
    /// Max log rows written per transaction.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Attempts for transient write failures before the batch is dropped.
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
    /// Days of logs and buckets kept on disk; 0 keeps everything.
    #[serde(default)]
    pub retention_days: u32,
}

fn default_http_addr() -> String {
    "127.0.0.1:3000".into()
}
fn default_second_window_secs() -> u64 {
    6 * 60 * 60
}
fn default_minute_window_secs() -> u64 {
    24 * 60 * 60
}
fn default_sample_capacity() -> usize {
    256
}
fn default_top_k() -> usize {
    10
}
fn default_queue_capacity() -> usize {
    8192
}
fn default_flush_interval_ms() -> u64 {
    5_000
}
fn default_sweep_interval_ms() -> u64 {
    10_000
}
fn default_stream_interval_ms() -> u64 {
    1_000
}
fn default_query_timeout_ms() -> u64 {
    3_000
}
fn default_max_series_points() -> usize {
    100_000
}
fn default_db_path() -> String {
    "data/metrics.db".into()
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_wal_autocheckpoint() -> i64 {
    1_000
}
fn default_cache_size() -> i64 {
    -2_000
}
fn default_batch_size() -> usize {
    256
}
fn default_write_retries() -> u32 {
    3
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            second_window_secs: default_second_window_secs(),
            minute_window_secs: default_minute_window_secs(),
            sample_capacity: default_sample_capacity(),
            top_k: default_top_k(),
            queue_capacity: default_queue_capacity(),
            flush_interval_ms: default_flush_interval_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            stream_interval_ms: default_stream_interval_ms(),
            query_timeout_ms: default_query_timeout_ms(),
            max_series_points: default_max_series_points(),
        }
    }
}

impl Default for MetricsStorageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            db_path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            wal_autocheckpoint: default_wal_autocheckpoint(),
            cache_size: default_cache_size(),
            batch_size: default_batch_size(),
            write_retries: default_write_retries(),
            retention_days: 0,
        }
    }
}

impl MetricsConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl AppConfig {
    /// Resolves the config path from `PROXY_METRICS_CONFIG`, falling back to
    /// `config.toml` in the working directory.
    pub fn default_path() -> PathBuf {
        std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }

    /// Loads the config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let m = &self.metrics;
        if m.second_window_secs == 0 || m.minute_window_secs == 0 {
            anyhow::bail!("metrics windows must be greater than zero");
        }
        if m.second_window_secs > MAX_WINDOW_SECS || m.minute_window_secs > MAX_WINDOW_SECS {
            anyhow::bail!("metrics windows must not exceed {MAX_WINDOW_SECS} seconds");
        }
        if m.sample_capacity == 0 || m.top_k == 0 || m.queue_capacity == 0 {
            anyhow::bail!("sample_capacity, top_k and queue_capacity must be greater than zero");
        }
        if self.metrics_storage.enabled && self.metrics_storage.db_path.trim().is_empty() {
            anyhow::bail!("metrics_storage.db_path must be set when storage is enabled");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.metrics.second_window_secs, 21_600);
        assert_eq!(config.metrics.minute_window_secs, 86_400);
        assert_eq!(config.metrics.top_k, 10);
        assert!(!config.metrics_storage.enabled);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = AppConfig::parse(
            r#"
            [metrics_storage]
            enabled = true
            db_path = "/var/lib/proxy/metrics.db"

            [metrics]
            top_k = 5
            "#,
        )
        .unwrap();
        assert!(config.metrics_storage.enabled);
        assert_eq!(config.metrics_storage.db_path, "/var/lib/proxy/metrics.db");
        assert_eq!(config.metrics_storage.busy_timeout_ms, 5_000);
        assert_eq!(config.metrics.top_k, 5);
        assert_eq!(config.metrics.sample_capacity, 256);
    }

    #[test]
    fn rejects_enabled_storage_without_path() {
        let err = AppConfig::parse(
            r#"
            [metrics_storage]
            enabled = true
            db_path = " "
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("db_path"));
    }

    #[test]
    fn rejects_zero_windows() {
        assert!(AppConfig::parse("[metrics]\nsecond_window_secs = 0\n").is_err());
    }

    #[test]
    fn rejects_oversized_windows() {
        let err = AppConfig::parse("[metrics]\nminute_window_secs = 18446744073709551615\n").unwrap_err();
        assert!(err.to_string().contains("must not exceed"));
        assert!(AppConfig::parse("[metrics]\nsecond_window_secs = 2592000\n").is_ok());
    }
}
