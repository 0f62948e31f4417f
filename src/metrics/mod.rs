pub mod bucket;
pub mod collector;
pub mod dashboard;
pub mod percentiles;
pub mod recorder;
pub mod series;
pub mod stream;

use serde::{Deserialize, Serialize};

pub use collector::{AggregatorSettings, WindowAggregator, MAX_CLOCK_SKEW_MS};
pub use dashboard::{DashboardStats, LifetimeStats};
pub use recorder::{EventRecorder, RecorderQueues};
pub use series::{MetricsPayload, MetricsSeries, KV};

/// One completed proxied request, as handed over by the proxy core.
/// Every aggregate is derived from these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEvent {
    /// Completion time, milliseconds since the Unix epoch
    pub timestamp: i64,
    pub listen_addr: String,
    #[serde(rename = "clientIP", default)]
    pub client_ip: String,
    #[serde(default)]
    pub method: String,
    #[serde(rename = "requestURL", default)]
    pub request_url: String,
    #[serde(default)]
    pub request_path: String,
    #[serde(default)]
    pub request_host: String,
    /// 0 when the upstream never produced a response
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub upstream: String,
    #[serde(default)]
    pub route_key: String,
    #[serde(default)]
    pub latency_ms: f64,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub referer: String,
}

/// Aggregation resolution of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Second,
    Minute,
}

impl Granularity {
    pub const ALL: [Granularity; 2] = [Granularity::Second, Granularity::Minute];

    /// Slot width in milliseconds.
    pub const fn millis(self) -> i64 {
        match self {
            Self::Second => 1_000,
            Self::Minute => 60_000,
        }
    }

    /// Start of the slot containing `ts_ms`. Floors toward negative infinity
    /// so pre-epoch timestamps still land on a slot boundary.
    pub fn bucket_start(self, ts_ms: i64) -> i64 {
        ts_ms.div_euclid(self.millis()) * self.millis()
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Second => "second",
            Self::Minute => "minute",
        }
    }

    pub fn from_use_minute(use_minute: bool) -> Self {
        if use_minute {
            Self::Minute
        } else {
            Self::Second
        }
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
