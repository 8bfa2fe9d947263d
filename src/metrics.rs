//! In-process timing and load histograms for the presence loop.
//! Each metric keeps its most recent samples; summaries are computed on demand
//! and logged by the tracker. Recording is a short mutex hold, never I/O.

use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

/// Samples retained per metric.
const DEFAULT_WINDOW: usize = 512;

/// Metric names. Suffix is the unit.
pub mod metric_names {
    pub const DETECTION: &str = "detection_us";
    pub const FRAME_GRAB: &str = "frame_grab_us";
    /// Accepted cycle, grab through publish.
    pub const CYCLE: &str = "cycle_us";
    pub const CPU_PERCENT: &str = "cpu_percent";
}

/// Bounded window of recent samples, oldest evicted first.
#[derive(Debug, Clone)]
pub(crate) struct SampleRing {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl SampleRing {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub(crate) fn len(&self) -> usize {
        self.samples.len()
    }

    pub(crate) fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    /// Nearest-rank percentile, `p` in 0..=100. 0.0 when empty.
    pub(crate) fn percentile(&self, p: f64) -> f64 {
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        if sorted.is_empty() {
            return 0.0;
        }
        sorted.sort_by(f64::total_cmp);
        let rank = (p.clamp(0.0, 100.0) / 100.0 * sorted.len() as f64).ceil() as usize;
        sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
    }

    fn summarize(&self) -> MetricSummary {
        MetricSummary {
            count: self.len(),
            mean: self.mean().unwrap_or(0.0),
            p50: self.percentile(50.0),
            p95: self.percentile(95.0),
            max: self.percentile(100.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricSummary {
    pub count: usize,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub max: f64,
}

/// Named histograms shared by the tracker and the optimizer.
pub struct MetricsRegistry {
    windows: Mutex<BTreeMap<&'static str, SampleRing>>,
    window: usize,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            windows: Mutex::new(BTreeMap::new()),
            window,
        }
    }

    pub fn record(&self, name: &'static str, value: f64) {
        self.windows
            .lock()
            .entry(name)
            .or_insert_with(|| SampleRing::new(self.window))
            .push(value);
    }

    /// Time a section; the elapsed microseconds are recorded on `finish`.
    pub fn span(&self, name: &'static str) -> TimingSpan<'_> {
        TimingSpan {
            name,
            started: Instant::now(),
            registry: self,
        }
    }

    /// Per-metric summary, sorted by name.
    pub fn summary(&self) -> BTreeMap<&'static str, MetricSummary> {
        self.windows
            .lock()
            .iter()
            .map(|(&name, ring)| (name, ring.summarize()))
            .collect()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Open timing section. Dropping it without `finish` records nothing, so a
/// failed call does not pollute the latency histogram.
#[must_use = "call finish() to record the span"]
pub struct TimingSpan<'a> {
    name: &'static str,
    started: Instant,
    registry: &'a MetricsRegistry,
}

impl TimingSpan<'_> {
    /// Record and return the elapsed microseconds.
    pub fn finish(self) -> f64 {
        let elapsed_us = self.started.elapsed().as_micros() as f64;
        self.registry.record(self.name, elapsed_us);
        elapsed_us
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_evicts_oldest() {
        let mut ring = SampleRing::new(3);
        for v in [10.0, 20.0, 30.0, 40.0] {
            ring.push(v);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.mean(), Some(30.0));
        assert_eq!(ring.percentile(100.0), 40.0);
        assert_eq!(ring.percentile(0.0), 20.0);
        assert_eq!(ring.percentile(50.0), 30.0);
    }

    #[test]
    fn empty_window() {
        let ring = SampleRing::new(0);
        assert_eq!(ring.mean(), None);
        assert_eq!(ring.percentile(95.0), 0.0);
    }

    #[test]
    fn summary_per_metric() {
        let registry = MetricsRegistry::with_window(8);
        registry.record(metric_names::CPU_PERCENT, 55.0);
        registry.record(metric_names::CPU_PERCENT, 65.0);
        let elapsed = registry.span(metric_names::DETECTION).finish();
        assert!(elapsed >= 0.0);

        let summary = registry.summary();
        let cpu = summary[metric_names::CPU_PERCENT];
        assert_eq!(cpu.count, 2);
        assert_eq!(cpu.mean, 60.0);
        assert_eq!(cpu.max, 65.0);
        assert_eq!(summary[metric_names::DETECTION].count, 1);
        assert!(!summary.contains_key(metric_names::FRAME_GRAB));
    }

    #[test]
    fn unfinished_span_records_nothing() {
        let registry = MetricsRegistry::new();
        drop(registry.span(metric_names::FRAME_GRAB));
        assert!(registry.summary().is_empty());
    }
}
