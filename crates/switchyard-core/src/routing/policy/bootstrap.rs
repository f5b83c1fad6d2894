//! Bootstrapped UCB
//!
//! K heads per arm, each an online bootstrap replicate: every reward is added
//! to each head with an independent Poisson(1) weight. Heads disagree where
//! data is thin, and scoring by the maximum head mean turns that disagreement
//! into optimism. Each head also starts with `prior_weight` pseudo-rewards at
//! the optimistic value, so a few early failures cannot retire an arm.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::prelude::*;
use rand_distr::Poisson;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::{ArmState, PolicyStateStore, StateKey};
use super::{BanditPolicy, Proposal, RewardEstimate, BOOTSTRAP_UCB};
use crate::error::{Error, Result};
use crate::routing::types::ContextFeatures;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapUcbConfig {
    pub heads: usize,
    /// Value an empty head contributes
    pub optimistic_value: f64,
    /// Pseudo-observations at `optimistic_value` every head starts with
    pub prior_weight: f64,
}

impl Default for BootstrapUcbConfig {
    fn default() -> Self {
        Self {
            heads: 8,
            optimistic_value: 1.0,
            prior_weight: 3.0,
        }
    }
}

impl BootstrapUcbConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=64).contains(&self.heads) {
            return Err(Error::Config(format!(
                "policies.bootstrap_ucb.heads must be in [1, 64], got {}",
                self.heads
            )));
        }
        if !self.optimistic_value.is_finite() {
            return Err(Error::Config(
                "policies.bootstrap_ucb.optimistic_value must be finite".to_string(),
            ));
        }
        if !self.prior_weight.is_finite() || self.prior_weight < 0.0 {
            return Err(Error::Config(format!(
                "policies.bootstrap_ucb.prior_weight must be non-negative, got {}",
                self.prior_weight
            )));
        }
        Ok(())
    }
}

pub struct BootstrappedUcb {
    config: BootstrapUcbConfig,
    state: Arc<PolicyStateStore>,
    poisson: Poisson<f64>,
    rng: Mutex<StdRng>,
}

impl BootstrappedUcb {
    pub fn new(config: BootstrapUcbConfig, state: Arc<PolicyStateStore>) -> Result<Self> {
        let poisson = Poisson::new(1.0)
            .map_err(|e| Error::numerical(BOOTSTRAP_UCB, format!("poisson: {}", e)))?;
        Ok(Self {
            config,
            state,
            poisson,
            rng: Mutex::new(StdRng::from_entropy()),
        })
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    fn estimate(&self, arm: &str) -> RewardEstimate {
        let state = self.state.read_or(&StateKey::new(BOOTSTRAP_UCB, arm), || {
            ArmState::bootstrap(self.config.heads)
        });
        let (heads, count) = match state {
            ArmState::Bootstrap { heads, count } if !heads.is_empty() => (heads, count),
            _ => {
                return RewardEstimate {
                    mean: self.config.optimistic_value,
                    score: self.config.optimistic_value,
                    uncertainty: 0.0,
                    observations: 0,
                };
            }
        };

        let prior = self.config.prior_weight;
        let optimistic = self.config.optimistic_value;
        let means: Vec<f64> = heads
            .iter()
            .map(|h| {
                if prior > 0.0 {
                    (h.sum + prior * optimistic) / (h.weight + prior)
                } else {
                    h.mean().unwrap_or(optimistic)
                }
            })
            .collect();
        let filled: Vec<f64> = heads.iter().filter_map(|h| h.mean()).collect();
        let k = means.len() as f64;
        let avg = means.iter().sum::<f64>() / k;
        let variance = means.iter().map(|m| (m - avg).powi(2)).sum::<f64>() / k;

        RewardEstimate {
            mean: if filled.is_empty() {
                self.config.optimistic_value
            } else {
                filled.iter().sum::<f64>() / filled.len() as f64
            },
            score: means.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            uncertainty: variance.sqrt(),
            observations: count,
        }
    }
}

impl BanditPolicy for BootstrappedUcb {
    fn name(&self) -> &str {
        BOOTSTRAP_UCB
    }

    fn propose(&self, _features: &ContextFeatures, arms: &[String]) -> Result<Proposal> {
        Ok(Proposal {
            policy: BOOTSTRAP_UCB.to_string(),
            estimates: arms.iter().map(|a| (a.clone(), self.estimate(a))).collect(),
            exploring: false,
        })
    }

    fn update(
        &self,
        _decision_id: Uuid,
        arm: &str,
        _features: &ContextFeatures,
        reward: f64,
    ) -> Result<()> {
        let weights: Vec<f64> = {
            let mut rng = self.rng.lock();
            (0..self.config.heads)
                .map(|_| self.poisson.sample(&mut *rng))
                .collect()
        };
        self.state.update(
            &StateKey::new(BOOTSTRAP_UCB, arm),
            || ArmState::bootstrap(self.config.heads),
            |state| {
                let ArmState::Bootstrap { heads, count } = state else {
                    return Err(Error::numerical(BOOTSTRAP_UCB, "unexpected state kind"));
                };
                for (head, w) in heads.iter_mut().zip(weights.iter()) {
                    head.weight += w;
                    head.sum += w * reward;
                }
                *count += 1;
                Ok(())
            },
        )
    }
}
