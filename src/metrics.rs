//! Latency metrics for dispatch runs.
//!
//! A dispatcher owns one lifetime registry; each job records into a scoped
//! registry that forwards every sample to it, so a `JobReport` carries the
//! numbers of that job alone while the dispatcher keeps running totals.
//! Durations are measured on the tokio clock so paused-time tests see the
//! simulated waits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

/// Measures from creation to `finish`.
pub struct TimingSpan {
    name: &'static str,
    start: Instant,
    registry: Arc<MetricsRegistry>,
}

impl TimingSpan {
    /// Record the elapsed time and return it.
    pub fn finish(self) -> Duration {
        let elapsed = self.start.elapsed();
        self.registry.record_duration(self.name, elapsed);
        elapsed
    }
}

/// Running totals plus a window of recent samples for percentiles.
struct LatencyHistogram {
    recent: Vec<f64>,
    next: usize,
    count: u64,
    sum_us: f64,
    max_us: f64,
}

impl LatencyHistogram {
    fn new(window: usize) -> Self {
        Self {
            recent: Vec::with_capacity(window),
            next: 0,
            count: 0,
            sum_us: 0.0,
            max_us: 0.0,
        }
    }

    fn push(&mut self, value_us: f64, window: usize) {
        if self.recent.len() < window {
            self.recent.push(value_us);
        } else {
            self.recent[self.next] = value_us;
        }
        self.next = (self.next + 1) % window;
        self.count += 1;
        self.sum_us += value_us;
        self.max_us = self.max_us.max(value_us);
    }

    /// Nearest-rank percentile over the recent window.
    fn percentile(&self, p: f64) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        let mut sorted = self.recent.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let rank = ((p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        sorted[rank.min(sorted.len() - 1)]
    }

    fn summary(&self) -> MetricSummary {
        MetricSummary {
            count: self.count,
            mean_us: if self.count == 0 {
                0.0
            } else {
                self.sum_us / self.count as f64
            },
            max_us: self.max_us,
            p50_us: self.percentile(50.0),
            p95_us: self.percentile(95.0),
            p99_us: self.percentile(99.0),
        }
    }
}

pub struct MetricsRegistry {
    histograms: Mutex<HashMap<&'static str, LatencyHistogram>>,
    window: usize,
    parent: Option<Arc<MetricsRegistry>>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_window(1024)
    }

    /// Percentiles are computed over the last `window` samples per metric.
    pub fn with_window(window: usize) -> Self {
        Self {
            histograms: Mutex::new(HashMap::new()),
            window: window.max(1),
            parent: None,
        }
    }

    /// Fresh registry for one job; samples are also recorded into `self`.
    pub fn scoped(self: &Arc<Self>) -> Arc<MetricsRegistry> {
        Arc::new(Self {
            histograms: Mutex::new(HashMap::new()),
            window: self.window,
            parent: Some(Arc::clone(self)),
        })
    }

    pub fn record(&self, name: &'static str, value_us: f64) {
        self.histograms
            .lock()
            .entry(name)
            .or_insert_with(|| LatencyHistogram::new(self.window))
            .push(value_us, self.window);
        if let Some(parent) = &self.parent {
            parent.record(name, value_us);
        }
    }

    pub fn record_duration(&self, name: &'static str, elapsed: Duration) {
        self.record(name, elapsed.as_secs_f64() * 1e6);
    }

    pub fn span(self: &Arc<Self>, name: &'static str) -> TimingSpan {
        TimingSpan {
            name,
            start: Instant::now(),
            registry: Arc::clone(self),
        }
    }

    /// Percentile (0-100) in microseconds; 0 for an unknown metric.
    pub fn percentile(&self, name: &str, p: f64) -> f64 {
        self.histograms
            .lock()
            .get(name)
            .map_or(0.0, |h| h.percentile(p))
    }

    pub fn summary(&self) -> HashMap<String, MetricSummary> {
        self.histograms
            .lock()
            .iter()
            .map(|(&name, h)| (name.to_string(), h.summary()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSummary {
    /// Samples ever recorded, not just those in the percentile window.
    pub count: u64,
    pub mean_us: f64,
    pub max_us: f64,
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
}

pub mod metric_names {
    pub const BACKEND_CALL: &str = "backend_call";
    pub const CACHE_LOOKUP: &str = "cache_lookup";
    pub const RATE_LIMIT_WAIT: &str = "rate_limit_wait";
    pub const RETRY_BACKOFF: &str = "retry_backoff";
    pub const PAUSE_WAIT: &str = "pause_wait";
    pub const FORMAT: &str = "format";
    pub const JOB_TOTAL: &str = "job_total";
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::metric_names::*;

    #[test]
    fn percentiles_over_recorded_samples() {
        let registry = MetricsRegistry::new();
        for v in 1..=100 {
            registry.record(BACKEND_CALL, v as f64);
        }
        assert_eq!(registry.percentile(BACKEND_CALL, 0.0), 1.0);
        assert_eq!(registry.percentile(BACKEND_CALL, 100.0), 100.0);
        let p50 = registry.percentile(BACKEND_CALL, 50.0);
        assert!((50.0..=51.0).contains(&p50));
        assert_eq!(registry.percentile("unknown", 50.0), 0.0);

        let summary = registry.summary();
        assert_eq!(summary[BACKEND_CALL].mean_us, 50.5);
        assert_eq!(summary[BACKEND_CALL].max_us, 100.0);
    }

    #[test]
    fn window_bounds_percentiles_not_totals() {
        let registry = MetricsRegistry::with_window(4);
        for v in [100.0, 100.0, 1.0, 2.0, 3.0, 4.0] {
            registry.record(FORMAT, v);
        }
        let summary = registry.summary();
        let format = &summary[FORMAT];
        assert_eq!(format.count, 6);
        assert_eq!(format.max_us, 100.0);
        assert_eq!(format.p99_us, 4.0);
    }

    #[test]
    fn scoped_registry_forwards_to_parent() {
        let lifetime = Arc::new(MetricsRegistry::new());
        let first = lifetime.scoped();
        first.record(BACKEND_CALL, 10.0);
        let second = lifetime.scoped();
        second.record(BACKEND_CALL, 30.0);
        second.record(CACHE_LOOKUP, 1.0);

        assert_eq!(first.summary()[BACKEND_CALL].count, 1);
        assert!(!first.summary().contains_key(CACHE_LOOKUP));
        assert_eq!(second.summary()[BACKEND_CALL].count, 1);
        let total = lifetime.summary();
        assert_eq!(total[BACKEND_CALL].count, 2);
        assert_eq!(total[BACKEND_CALL].mean_us, 20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn span_measures_tokio_time() {
        let registry = Arc::new(MetricsRegistry::new());
        let span = registry.span(JOB_TOTAL);
        tokio::time::sleep(Duration::from_millis(250)).await;
        let elapsed = span.finish();
        assert!(elapsed >= Duration::from_millis(250));
        assert!(registry.summary()[JOB_TOTAL].max_us >= 250_000.0);
    }
}
