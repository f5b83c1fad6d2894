//! Cost-aware utility scoring
//!
//! Blends a policy's reward estimate with an arm's declared cost and observed
//! p95 latency:
//!
//! ```text
//! utility = score / max(min_cost, cost)^cost_exponent
//!         * (1 / (1 + p95 / latency_scale_ms))^latency_exponent
//! ```
//!
//! Arms whose mean estimate is below the quality floor are never ranked ahead
//! of an arm that clears it, however cheap they are. The floor only judges an
//! arm once it has `floor_min_observations` rewards; colder arms stay in play.

use serde::{Deserialize, Serialize};

use super::policy::{Proposal, RewardEstimate};
use super::types::Arm;
use crate::error::{Error, Result};

/// Tunable weights (`[utility]` config section)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UtilityWeights {
    pub cost_exponent: f64,
    pub latency_exponent: f64,
    pub latency_scale_ms: f64,
    /// Lower bound on cost so free arms do not divide by zero
    pub min_cost: f64,
    pub quality_floor: f64,
    /// Observations before the floor applies to an arm
    pub floor_min_observations: u64,
}

impl Default for UtilityWeights {
    fn default() -> Self {
        Self {
            cost_exponent: 1.0,
            latency_exponent: 1.0,
            latency_scale_ms: 1000.0,
            min_cost: 1e-6,
            quality_floor: 0.1,
            floor_min_observations: 10,
        }
    }
}

impl UtilityWeights {
    pub fn validate(&self) -> Result<()> {
        let non_negative = [
            ("utility.cost_exponent", self.cost_exponent),
            ("utility.latency_exponent", self.latency_exponent),
        ];
        for (key, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::Config(format!("{} must be non-negative, got {}", key, value)));
            }
        }
        if !self.latency_scale_ms.is_finite() || self.latency_scale_ms <= 0.0 {
            return Err(Error::Config("utility.latency_scale_ms must be positive".to_string()));
        }
        if !self.min_cost.is_finite() || self.min_cost <= 0.0 {
            return Err(Error::Config("utility.min_cost must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.quality_floor) {
            return Err(Error::Config(format!(
                "utility.quality_floor must be in [0, 1], got {}",
                self.quality_floor
            )));
        }
        Ok(())
    }
}

/// An arm with its estimate and utility
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredArm {
    pub arm: String,
    pub estimate: RewardEstimate,
    pub utility: f64,
    /// Mean estimate clears the quality floor, or the arm is still warming up
    pub above_floor: bool,
}

/// Arms in descending utility order
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Ranking {
    pub ranked: Vec<ScoredArm>,
    /// No arm cleared the floor; `ranked` then holds every arm
    pub floor_unmet: bool,
}

impl Ranking {
    pub fn top(&self) -> Option<&ScoredArm> {
        self.ranked.first()
    }
}

#[derive(Debug, Clone, Default)]
pub struct UtilityScorer {
    weights: UtilityWeights,
}

impl UtilityScorer {
    pub fn new(weights: UtilityWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &UtilityWeights {
        &self.weights
    }

    /// Utility of a single estimate at the given cost and latency
    pub fn score(&self, reward: f64, cost: f64, latency_p95_ms: f64) -> f64 {
        let w = &self.weights;
        let cost_term = cost.max(w.min_cost).powf(w.cost_exponent);
        let latency_term =
            (1.0 / (1.0 + latency_p95_ms.max(0.0) / w.latency_scale_ms)).powf(w.latency_exponent);
        reward / cost_term * latency_term
    }

    fn clears_floor(&self, estimate: &RewardEstimate) -> bool {
        estimate.observations < self.weights.floor_min_observations
            || estimate.mean >= self.weights.quality_floor
    }

    /// Rank a proposal's arms
    ///
    /// Arms missing from `arms` are skipped. Ties fall back to arm id so the
    /// order is deterministic.
    pub fn rank(&self, proposal: &Proposal, arms: &[Arm]) -> Ranking {
        let mut scored: Vec<ScoredArm> = proposal
            .estimates
            .iter()
            .filter_map(|(id, estimate)| {
                let arm = arms.iter().find(|a| &a.id == id)?;
                Some(ScoredArm {
                    arm: id.clone(),
                    estimate: *estimate,
                    utility: self.score(estimate.score, arm.unit_cost, arm.latency_p95()),
                    above_floor: self.clears_floor(estimate),
                })
            })
            .collect();

        let floor_unmet = !scored.is_empty() && scored.iter().all(|s| !s.above_floor);
        if !floor_unmet {
            scored.retain(|s| s.above_floor);
        }
        scored.sort_by(|a, b| {
            b.utility
                .total_cmp(&a.utility)
                .then_with(|| a.arm.cmp(&b.arm))
        });

        Ranking {
            ranked: scored,
            floor_unmet,
        }
    }
}
