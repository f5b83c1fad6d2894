//! Epsilon-greedy baseline
//!
//! The control policy for every experiment and the fallback whenever another
//! policy fails. With probability epsilon the proposal is marked as exploring
//! and the service picks uniformly among eligible arms; otherwise the arm with
//! the highest running mean wins.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::{ArmState, PolicyStateStore, StateKey};
use super::{BanditPolicy, Proposal, RewardEstimate, EPSILON_GREEDY};
use crate::error::{Error, Result};
use crate::routing::types::ContextFeatures;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpsilonGreedyConfig {
    pub epsilon: f64,
    /// Mean assumed for arms with no rewards yet
    pub initial_mean: f64,
}

impl Default for EpsilonGreedyConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.1,
            initial_mean: 0.5,
        }
    }
}

impl EpsilonGreedyConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.epsilon) {
            return Err(Error::Config(format!(
                "policies.epsilon_greedy.epsilon must be in [0, 1], got {}",
                self.epsilon
            )));
        }
        if !self.initial_mean.is_finite() {
            return Err(Error::Config(
                "policies.epsilon_greedy.initial_mean must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct EpsilonGreedy {
    name: String,
    config: EpsilonGreedyConfig,
    state: Arc<PolicyStateStore>,
    rng: Mutex<StdRng>,
}

impl EpsilonGreedy {
    pub fn new(config: EpsilonGreedyConfig, state: Arc<PolicyStateStore>) -> Self {
        Self {
            name: EPSILON_GREEDY.to_string(),
            config,
            state,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Register under a different state namespace (e.g. a second baseline)
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn epsilon(&self) -> f64 {
        self.config.epsilon
    }
}

impl BanditPolicy for EpsilonGreedy {
    fn name(&self) -> &str {
        &self.name
    }

    fn propose(&self, _features: &ContextFeatures, arms: &[String]) -> Result<Proposal> {
        let exploring = self.rng.lock().r#gen::<f64>() < self.config.epsilon;
        let estimates = arms
            .iter()
            .map(|arm| {
                let state = self
                    .state
                    .read_or(&StateKey::new(&self.name, arm), ArmState::mean);
                let (count, mean) = match state {
                    ArmState::Mean { count, mean } if count > 0 => (count, mean),
                    _ => (0, self.config.initial_mean),
                };
                let estimate = RewardEstimate {
                    mean,
                    score: mean,
                    uncertainty: 1.0 / ((count + 1) as f64).sqrt(),
                    observations: count,
                };
                (arm.clone(), estimate)
            })
            .collect();

        Ok(Proposal {
            policy: self.name.clone(),
            estimates,
            exploring,
        })
    }

    fn update(
        &self,
        _decision_id: Uuid,
        arm: &str,
        _features: &ContextFeatures,
        reward: f64,
    ) -> Result<()> {
        self.state
            .update(&StateKey::new(&self.name, arm), ArmState::mean, |state| {
                match state {
                    ArmState::Mean { count, mean } => {
                        *count += 1;
                        *mean += (reward - *mean) / *count as f64;
                        Ok(())
                    }
                    other => Err(Error::numerical(
                        EPSILON_GREEDY,
                        format!("unexpected state kind {:?}", other),
                    )),
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arms() -> Vec<String> {
        vec!["a".into(), "b".into()]
    }

    #[test]
    fn test_running_mean() {
        let store = Arc::new(PolicyStateStore::new());
        let policy = EpsilonGreedy::new(EpsilonGreedyConfig::default(), store.clone()).with_seed(1);
        let x = ContextFeatures::bias_only();
        for r in [1.0, 0.0, 1.0, 1.0] {
            policy.update(Uuid::new_v4(), "a", &x, r).unwrap();
        }
        let proposal = policy.propose(&x, &arms()).unwrap();
        let a = proposal.get("a").unwrap();
        assert!((a.mean - 0.75).abs() < 1e-12);
        assert_eq!(a.observations, 4);
        assert_eq!(proposal.get("b").unwrap().mean, 0.5);
    }

    #[test]
    fn test_exploration_rate() {
        let store = Arc::new(PolicyStateStore::new());
        let config = EpsilonGreedyConfig {
            epsilon: 0.2,
            ..Default::default()
        };
        let policy = EpsilonGreedy::new(config, store).with_seed(7);
        let x = ContextFeatures::bias_only();
        let exploring = (0..5000)
            .filter(|_| policy.propose(&x, &arms()).unwrap().exploring)
            .count();
        assert!((800..1200).contains(&exploring), "got {}", exploring);
    }

    #[test]
    fn test_zero_epsilon_never_explores() {
        let store = Arc::new(PolicyStateStore::new());
        let config = EpsilonGreedyConfig {
            epsilon: 0.0,
            ..Default::default()
        };
        let policy = EpsilonGreedy::new(config, store).with_seed(7);
        let x = ContextFeatures::bias_only();
        assert!((0..100).all(|_| !policy.propose(&x, &arms()).unwrap().exploring));
    }

    #[test]
    fn test_validate_epsilon() {
        let bad = EpsilonGreedyConfig {
            epsilon: 1.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        assert!(EpsilonGreedyConfig::default().validate().is_ok());
    }
}
