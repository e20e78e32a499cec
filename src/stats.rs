//! Running statistics for observability.

use serde_json::json;
use serde_json::Value;

/// Streaming accumulator for count/min/max/mean/stddev of a series.
///
/// Uses Welford's method so variance stays numerically stable without
/// retaining samples.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tstat {
    count: u64,
    min: f64,
    max: f64,
    mean: f64,
    m2: f64,
}

impl Tstat {
    /// Record one sample.
    pub fn push(&mut self, sample: f64) {
        self.count += 1;
        if self.count == 1 {
            self.min = sample;
            self.max = sample;
        } else {
            self.min = self.min.min(sample);
            self.max = self.max.max(sample);
        }
        let delta = sample - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (sample - self.mean);
    }

    /// Number of samples recorded.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Smallest sample, or zero when empty.
    pub fn min(&self) -> f64 {
        self.min
    }

    /// Largest sample, or zero when empty.
    pub fn max(&self) -> f64 {
        self.max
    }

    /// Mean of the samples.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population standard deviation of the samples.
    pub fn stddev(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / self.count as f64).sqrt()
        }
    }

    /// Render as a JSON object, with samples scaled by `scale`.
    pub fn to_json(&self, scale: f64) -> Value {
        json!({
            "count": self.count,
            "min": self.min * scale,
            "mean": self.mean * scale,
            "stddev": self.stddev() * scale,
            "max": self.max * scale,
        })
    }
}

/// Snapshot of cache health, reported by `stats.get`.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Number of cache entries, complete or not.
    pub count: usize,
    /// Entries currently dirty.
    pub dirty: usize,
    /// Entries without a value yet.
    pub incomplete: usize,
    /// Total bytes of encoded cached objects.
    pub total_size: u64,
    /// Size distribution of encoded cached objects.
    pub sizes: Tstat,
}
