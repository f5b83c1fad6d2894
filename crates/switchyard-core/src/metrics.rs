//! Operational metrics for the decision service
//!
//! Counters and histograms are labelled by `(policy, variant)`. The number of
//! distinct label sets is bounded; anything past the limit is folded into the
//! `__other__` series. All values use relaxed atomics and are advisory.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Label used when the bounded label space is exhausted
pub const OVERFLOW_LABEL: &str = "__other__";

/// Variant label for decisions outside any experiment
pub const NO_VARIANT: &str = "none";

const LATENCY_BOUNDS_MS: &[f64] = &[1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 250.0];
const REWARD_BOUNDS: &[f64] = &[0.0, 0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub max_label_sets: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { max_label_sets: 64 }
    }
}

impl MetricsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_label_sets == 0 {
            return Err(Error::Config("metrics.max_label_sets must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetricLabels {
    pub policy: String,
    pub variant: String,
}

impl MetricLabels {
    pub fn new(policy: impl Into<String>, variant: Option<&str>) -> Self {
        Self {
            policy: policy.into(),
            variant: variant.unwrap_or(NO_VARIANT).to_string(),
        }
    }

    fn overflow() -> Self {
        Self {
            policy: OVERFLOW_LABEL.to_string(),
            variant: OVERFLOW_LABEL.to_string(),
        }
    }
}

/// f64 stored as bits
#[derive(Debug, Default)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    fn add(&self, delta: f64) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + delta).to_bits())
            });
    }
}

/// Fixed-bucket histogram; the last bucket catches everything above the bounds
#[derive(Debug)]
struct Histogram {
    bounds: &'static [f64],
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    sum: AtomicF64,
}

impl Histogram {
    fn new(bounds: &'static [f64]) -> Self {
        Self {
            bounds,
            buckets: (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
            sum: AtomicF64::default(),
        }
    }

    fn observe(&self, value: f64) {
        if !value.is_finite() {
            return;
        }
        let index = self
            .bounds
            .iter()
            .position(|b| value <= *b)
            .unwrap_or(self.bounds.len());
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.add(value);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            bounds: self.bounds.to_vec(),
            buckets: self
                .buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
            count: self.count.load(Ordering::Relaxed),
            sum: self.sum.load(),
        }
    }
}

#[derive(Debug)]
struct Series {
    decisions: AtomicU64,
    cache_hits: AtomicU64,
    fallbacks: AtomicU64,
    decision_latency_ms: Histogram,
    reward_distribution: Histogram,
}

impl Series {
    fn new() -> Self {
        Self {
            decisions: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            decision_latency_ms: Histogram::new(LATENCY_BOUNDS_MS),
            reward_distribution: Histogram::new(REWARD_BOUNDS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    /// Upper bucket bounds; `buckets` has one extra overflow entry
    pub bounds: Vec<f64>,
    pub buckets: Vec<u64>,
    pub count: u64,
    pub sum: f64,
}

impl HistogramSnapshot {
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesSnapshot {
    pub labels: MetricLabels,
    pub decisions_total: u64,
    pub cache_hits_total: u64,
    pub fallbacks_total: u64,
    pub decision_latency_ms: HistogramSnapshot,
    pub reward_distribution: HistogramSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub series: Vec<SeriesSnapshot>,
    pub cumulative_regret: f64,
    pub active_experiments: u64,
}

impl MetricsSnapshot {
    pub fn decisions_total(&self) -> u64 {
        self.series.iter().map(|s| s.decisions_total).sum()
    }

    pub fn cache_hits_total(&self) -> u64 {
        self.series.iter().map(|s| s.cache_hits_total).sum()
    }

    pub fn fallbacks_total(&self) -> u64 {
        self.series.iter().map(|s| s.fallbacks_total).sum()
    }

    pub fn series_for(&self, policy: &str, variant: Option<&str>) -> Option<&SeriesSnapshot> {
        let labels = MetricLabels::new(policy, variant);
        self.series.iter().find(|s| s.labels == labels)
    }
}

/// Metric registry shared by the service and its updater task
#[derive(Debug)]
pub struct Metrics {
    max_label_sets: usize,
    series: RwLock<HashMap<MetricLabels, Arc<Series>>>,
    cumulative_regret: AtomicF64,
    active_experiments: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new(&MetricsConfig::default())
    }
}

impl Metrics {
    pub fn new(config: &MetricsConfig) -> Self {
        Self {
            max_label_sets: config.max_label_sets.max(1),
            series: RwLock::new(HashMap::new()),
            cumulative_regret: AtomicF64::default(),
            active_experiments: AtomicU64::new(0),
        }
    }

    fn series(&self, labels: MetricLabels) -> Arc<Series> {
        if let Some(series) = self.series.read().get(&labels) {
            return Arc::clone(series);
        }
        let mut map = self.series.write();
        let labels = if map.contains_key(&labels) || map.len() < self.max_label_sets {
            labels
        } else {
            MetricLabels::overflow()
        };
        Arc::clone(map.entry(labels).or_insert_with(|| Arc::new(Series::new())))
    }

    pub fn record_decision(&self, labels: MetricLabels, latency_ms: f64, cache_hit: bool, fallback: bool) {
        let series = self.series(labels);
        series.decisions.fetch_add(1, Ordering::Relaxed);
        if cache_hit {
            series.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        if fallback {
            series.fallbacks.fetch_add(1, Ordering::Relaxed);
        }
        series.decision_latency_ms.observe(latency_ms);
    }

    pub fn record_reward(&self, labels: MetricLabels, reward: f64) {
        self.series(labels).reward_distribution.observe(reward);
    }

    pub fn set_cumulative_regret(&self, value: f64) {
        self.cumulative_regret.store(value);
    }

    pub fn set_active_experiments(&self, count: usize) {
        self.active_experiments.store(count as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut series: Vec<SeriesSnapshot> = self
            .series
            .read()
            .iter()
            .map(|(labels, s)| SeriesSnapshot {
                labels: labels.clone(),
                decisions_total: s.decisions.load(Ordering::Relaxed),
                cache_hits_total: s.cache_hits.load(Ordering::Relaxed),
                fallbacks_total: s.fallbacks.load(Ordering::Relaxed),
                decision_latency_ms: s.decision_latency_ms.snapshot(),
                reward_distribution: s.reward_distribution.snapshot(),
            })
            .collect();
        series.sort_by(|a, b| a.labels.cmp(&b.labels));
        MetricsSnapshot {
            series,
            cumulative_regret: self.cumulative_regret.load(),
            active_experiments: self.active_experiments.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_by_label() {
        let metrics = Metrics::default();
        metrics.record_decision(MetricLabels::new("lin_ts", None), 3.0, false, false);
        metrics.record_decision(MetricLabels::new("lin_ts", None), 7.0, false, true);
        metrics.record_decision(MetricLabels::new("cache", None), 0.5, true, false);

        let snap = metrics.snapshot();
        assert_eq!(snap.decisions_total(), 3);
        assert_eq!(snap.cache_hits_total(), 1);
        assert_eq!(snap.fallbacks_total(), 1);
        let lin = snap.series_for("lin_ts", None).unwrap();
        assert_eq!(lin.decision_latency_ms.mean(), Some(5.0));
    }

    #[test]
    fn test_label_sets_bounded() {
        let metrics = Metrics::new(&MetricsConfig { max_label_sets: 2 });
        for i in 0..10 {
            metrics.record_decision(MetricLabels::new(format!("p{}", i), None), 1.0, false, false);
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.series.len(), 3);
        let other = snap.series_for(OVERFLOW_LABEL, Some(OVERFLOW_LABEL)).unwrap();
        assert_eq!(other.decisions_total, 8);
    }

    #[test]
    fn test_reward_histogram_buckets() {
        let metrics = Metrics::default();
        let labels = MetricLabels::new("epsilon_greedy", Some("control"));
        for r in [0.0, 0.05, 1.0, 2.0] {
            metrics.record_reward(labels.clone(), r);
        }
        metrics.record_reward(labels, f64::NAN);
        let snap = metrics.snapshot();
        let h = &snap.series_for("epsilon_greedy", Some("control")).unwrap().reward_distribution;
        assert_eq!(h.count, 4);
        assert_eq!(h.buckets[0], 1);
        assert_eq!(h.buckets[1], 1);
        assert_eq!(*h.buckets.last().unwrap(), 1);
    }

    #[test]
    fn test_gauges() {
        let metrics = Metrics::default();
        metrics.set_cumulative_regret(4.25);
        metrics.set_active_experiments(2);
        let snap = metrics.snapshot();
        assert_eq!(snap.cumulative_regret, 4.25);
        assert_eq!(snap.active_experiments, 2);
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("cumulative_regret"));
    }
}
