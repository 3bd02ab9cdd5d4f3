//! Observability: latency histograms and event counters for the translation path.
//! Histograms keep a ring of recent samples and report p50/p95/p99.

use parking_lot::Mutex;
use std::collections::HashMap;

/// Fixed-capacity ring buffer for histogram samples.
struct SampleRing {
    samples: Vec<f64>,
    pos: usize,
    count: usize,
    capacity: usize,
}

impl SampleRing {
    fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0.0; capacity],
            pos: 0,
            count: 0,
            capacity,
        }
    }

    fn push(&mut self, value: f64) {
        self.samples[self.pos] = value;
        self.pos = (self.pos + 1) % self.capacity;
        if self.count < self.capacity {
            self.count += 1;
        }
    }

    fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples[..self.count].to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((p / 100.0) * (self.count as f64 - 1.0)).round() as usize;
        sorted[idx.min(self.count - 1)]
    }
}

/// Histograms and counters for all named metrics.
pub struct MetricsRegistry {
    histograms: Mutex<HashMap<&'static str, SampleRing>>,
    counters: Mutex<HashMap<&'static str, u64>>,
    ring_capacity: usize,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            histograms: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            ring_capacity: 1024,
        }
    }

    /// Record a sample (in microseconds) for the named metric.
    pub fn record(&self, name: &'static str, value_us: f64) {
        let mut hists = self.histograms.lock();
        hists
            .entry(name)
            .or_insert_with(|| SampleRing::new(self.ring_capacity))
            .push(value_us);
        tracing::trace!(metric = name, value_us, "metric_recorded");
    }

    /// Bump the named counter by one.
    pub fn incr(&self, name: &'static str) {
        *self.counters.lock().entry(name).or_insert(0) += 1;
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    /// Percentile for a metric (p in 0-100), microseconds.
    pub fn percentile(&self, name: &str, p: f64) -> f64 {
        let hists = self.histograms.lock();
        hists
            .get(name)
            .map(|ring| ring.percentile(p))
            .unwrap_or(0.0)
    }

    /// Summary of every histogram at p50/p95/p99.
    pub fn summary(&self) -> HashMap<String, MetricSummary> {
        let hists = self.histograms.lock();
        hists
            .iter()
            .map(|(&name, ring)| {
                (
                    name.to_string(),
                    MetricSummary {
                        p50_us: ring.percentile(50.0),
                        p95_us: ring.percentile(95.0),
                        p99_us: ring.percentile(99.0),
                        count: ring.count,
                    },
                )
            })
            .collect()
    }

    pub fn counters(&self) -> HashMap<String, u64> {
        self.counters
            .lock()
            .iter()
            .map(|(&name, &value)| (name.to_string(), value))
            .collect()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricSummary {
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
    pub count: usize,
}

/// Well-known metric names (constants to avoid typos).
pub mod metric_names {
    pub const QUEUE_WAIT: &str = "translate_queue_wait";
    pub const TRANSLATE_DONE: &str = "t_translate_done";
    pub const TEXT_RESOLVED: &str = "t_text_resolved";
    pub const CACHE_HIT: &str = "translate_cache_hit";
    pub const CACHE_MISS: &str = "translate_cache_miss";
    pub const DISPATCHED: &str = "translate_dispatched";
    pub const RATE_LIMITED: &str = "translate_rate_limited";
    pub const RETRIED: &str = "translate_retried";
    pub const FAILED: &str = "translate_failed";
    pub const FLUSHED: &str = "translate_flushed_on_language_change";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_follow_recorded_samples() {
        let registry = MetricsRegistry::new();
        for v in 1..=100 {
            registry.record(metric_names::QUEUE_WAIT, v as f64);
        }
        assert_eq!(registry.percentile(metric_names::QUEUE_WAIT, 50.0), 51.0);
        assert_eq!(registry.percentile(metric_names::QUEUE_WAIT, 99.0), 99.0);
        assert_eq!(registry.percentile("unknown", 50.0), 0.0);
        assert_eq!(registry.summary()[metric_names::QUEUE_WAIT].count, 100);
    }

    #[test]
    fn counters_start_at_zero() {
        let registry = MetricsRegistry::new();
        assert_eq!(registry.counter(metric_names::CACHE_HIT), 0);
        registry.incr(metric_names::CACHE_HIT);
        registry.incr(metric_names::CACHE_HIT);
        assert_eq!(registry.counter(metric_names::CACHE_HIT), 2);
    }
}
