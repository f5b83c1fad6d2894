//! Reward and regret bookkeeping
//!
//! Regret per step is measured against the best mean currently known among
//! the decision's candidates (the true optimum is unobservable):
//!
//! - observed regret: `max(0, best_known - reward)`, summed and smoothed
//! - pseudo-regret: `max(0, best_known - mean(chosen))`, which should shrink
//!   toward zero on a stationary problem as the policy converges
//!
//! Flooring each step at zero keeps both cumulative sums non-decreasing.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Welford running moments for one arm
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ArmRewardStats {
    pub count: u64,
    pub mean: f64,
    m2: f64,
}

impl ArmRewardStats {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    /// Sample variance (n - 1)
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }
}

/// Aggregate regret counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RegretSummary {
    pub steps: u64,
    pub cumulative_regret: f64,
    pub ewma_regret: f64,
    pub cumulative_pseudo_regret: f64,
}

impl RegretSummary {
    pub fn average_regret(&self) -> f64 {
        if self.steps == 0 {
            0.0
        } else {
            self.cumulative_regret / self.steps as f64
        }
    }

    pub fn average_pseudo_regret(&self) -> f64 {
        if self.steps == 0 {
            0.0
        } else {
            self.cumulative_pseudo_regret / self.steps as f64
        }
    }
}

/// One logged reward
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardRecord {
    pub decision_id: Uuid,
    pub policy: String,
    pub arm: String,
    pub features: Vec<f64>,
    pub reward: f64,
    pub regret: f64,
    pub pseudo_regret: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    arms: HashMap<String, ArmRewardStats>,
    summary: RegretSummary,
    log: VecDeque<RewardRecord>,
}

/// Reward log with running regret and per-arm statistics
#[derive(Debug)]
pub struct RewardTracker {
    inner: Mutex<TrackerInner>,
    ewma_alpha: f64,
    log_capacity: usize,
}

impl Default for RewardTracker {
    fn default() -> Self {
        Self::new(0.05, 10_000)
    }
}

impl RewardTracker {
    pub fn new(ewma_alpha: f64, log_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(TrackerInner::default()),
            ewma_alpha: ewma_alpha.clamp(f64::EPSILON, 1.0),
            log_capacity,
        }
    }

    /// Fold a reward in and return the step's record
    pub fn record(
        &self,
        decision_id: Uuid,
        policy: &str,
        arm: &str,
        candidates: &[String],
        features: &[f64],
        reward: f64,
    ) -> RewardRecord {
        let mut inner = self.inner.lock();
        inner.arms.entry(arm.to_string()).or_default().push(reward);

        let chosen_mean = inner.arms.get(arm).map(|s| s.mean).unwrap_or(reward);
        let best_known = candidates
            .iter()
            .filter_map(|c| inner.arms.get(c).map(|s| s.mean))
            .fold(chosen_mean, f64::max);

        let regret = (best_known - reward).max(0.0);
        let pseudo_regret = (best_known - chosen_mean).max(0.0);

        let summary = &mut inner.summary;
        summary.ewma_regret = if summary.steps == 0 {
            regret
        } else {
            self.ewma_alpha * regret + (1.0 - self.ewma_alpha) * summary.ewma_regret
        };
        summary.steps += 1;
        summary.cumulative_regret += regret;
        summary.cumulative_pseudo_regret += pseudo_regret;

        let record = RewardRecord {
            decision_id,
            policy: policy.to_string(),
            arm: arm.to_string(),
            features: features.to_vec(),
            reward,
            regret,
            pseudo_regret,
            recorded_at: Utc::now(),
        };
        if self.log_capacity > 0 {
            if inner.log.len() == self.log_capacity {
                inner.log.pop_front();
            }
            inner.log.push_back(record.clone());
        }
        record
    }

    pub fn summary(&self) -> RegretSummary {
        self.inner.lock().summary
    }

    pub fn arm_stats(&self, arm: &str) -> Option<ArmRewardStats> {
        self.inner.lock().arms.get(arm).copied()
    }

    pub fn all_arm_stats(&self) -> Vec<(String, ArmRewardStats)> {
        let mut stats: Vec<(String, ArmRewardStats)> = self
            .inner
            .lock()
            .arms
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }

    /// Most recent records, newest last
    pub fn recent(&self, n: usize) -> Vec<RewardRecord> {
        let inner = self.inner.lock();
        let skip = inner.log.len().saturating_sub(n);
        inner.log.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arms() -> Vec<String> {
        vec!["a".into(), "b".into()]
    }

    #[test]
    fn test_welford_moments() {
        let mut stats = ArmRewardStats::default();
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            stats.push(v);
        }
        assert!((stats.mean - 5.0).abs() < 1e-12);
        assert!((stats.variance() - 32.0 / 7.0).abs() < 1e-12);
    }

    #[test]
    fn test_regret_against_best_known_candidate() {
        let tracker = RewardTracker::default();
        tracker.record(Uuid::new_v4(), "p", "a", &arms(), &[1.0], 0.9);
        let step = tracker.record(Uuid::new_v4(), "p", "b", &arms(), &[1.0], 0.2);
        assert!((step.regret - 0.7).abs() < 1e-12);
        assert!((step.pseudo_regret - 0.7).abs() < 1e-12);

        // outperforming the best known mean is not negative regret
        let step = tracker.record(Uuid::new_v4(), "p", "b", &arms(), &[1.0], 1.0);
        assert_eq!(step.regret, 0.0);
    }

    #[test]
    fn test_cumulative_regret_non_decreasing() {
        let tracker = RewardTracker::default();
        let mut last = 0.0;
        for i in 0..200 {
            let arm = if i % 3 == 0 { "a" } else { "b" };
            let reward = ((i * 37) % 11) as f64 / 10.0;
            tracker.record(Uuid::new_v4(), "p", arm, &arms(), &[1.0], reward);
            let now = tracker.summary().cumulative_regret;
            assert!(now >= last);
            last = now;
        }
        assert_eq!(tracker.summary().steps, 200);
    }

    #[test]
    fn test_log_is_bounded() {
        let tracker = RewardTracker::new(0.1, 3);
        for i in 0..5 {
            tracker.record(Uuid::new_v4(), "p", "a", &arms(), &[1.0], i as f64);
        }
        let recent = tracker.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent.last().unwrap().reward, 4.0);
    }
}
