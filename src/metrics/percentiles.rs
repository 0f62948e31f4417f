use hdrhistogram::Histogram;
use serde::Serialize;

/// Percentile of an unsorted sample set using linear interpolation between
/// the two nearest ranks (`rank = p/100 * (n - 1)`).
///
/// Returns `None` for an empty set. When the samples come from a capped
/// reservoir the result is an estimate of the true percentile, never a value
/// outside `[min(samples), max(samples)]`.
pub fn percentile(samples: &[f64], p: f64) -> Option<f64> {
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    percentile_sorted(&sorted, p)
}

/// Same as [`percentile`] for an already ascending slice.
pub fn percentile_sorted(sorted: &[f64], p: f64) -> Option<f64> {
    match sorted.len() {
        0 => None,
        1 => Some(sorted[0]),
        n => {
            let p = p.clamp(0.0, 100.0);
            let rank = p / 100.0 * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            let frac = rank - lo as f64;
            Some((sorted[lo] + (sorted[hi] - sorted[lo]) * frac).min(sorted[hi]))
        }
    }
}

/// p95 and p99 of one bucket's latency samples.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TailLatency {
    pub p95: Option<f64>,
    pub p99: Option<f64>,
}

impl TailLatency {
    /// Sorts once and reads both ranks.
    pub fn from_samples(samples: &[f64]) -> Self {
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);
        Self {
            p95: percentile_sorted(&sorted, 95.0),
            p99: percentile_sorted(&sorted, 99.0),
        }
    }
}

/// A complete percentile breakdown over the process lifetime, in microseconds.
/// Serialized straight into the dashboard stats.
#[derive(Debug, Clone, Serialize)]
pub struct PercentileSet {
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    pub p999: u64,
    pub count: u64,
}

impl PercentileSet {
    /// Extract a full percentile set from an HdrHistogram.
    /// Returns zeroed values if the histogram is empty.
    pub fn from_histogram(hist: &Histogram<u64>) -> Self {
        if hist.len() == 0 {
            return Self::empty();
        }

        Self {
            min: hist.min(),
            max: hist.max(),
            mean: hist.mean(),
            p50: hist.value_at_percentile(50.0),
            p95: hist.value_at_percentile(95.0),
            p99: hist.value_at_percentile(99.0),
            p999: hist.value_at_percentile(99.9),
            count: hist.len(),
        }
    }

    pub fn empty() -> Self {
        Self {
            min: 0,
            max: 0,
            mean: 0.0,
            p50: 0,
            p95: 0,
            p99: 0,
            p999: 0,
            count: 0,
        }
    }

    pub fn has_data(&self) -> bool {
        self.count > 0
    }
}
