//! Bandit policies
//!
//! Every policy implements [`BanditPolicy`]: `propose` turns a feature vector
//! and candidate arms into per-arm [`RewardEstimate`]s, `update` folds a
//! reward back into the policy's state. Policies are built by name from a
//! [`PolicyRegistry`] of factories; an unknown name is a configuration error.
//!
//! - `epsilon_greedy`: running means, control and fallback policy
//! - `lin_ts`: linear Thompson sampling over the context features
//! - `bootstrap_ucb`: online-bootstrap ensemble, max-head optimism
//! - `neural_ucb`: external scorer, flag-gated and never the default

mod bootstrap;
mod epsilon;
mod lin_ts;
mod neural;
mod state;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::routing::types::ContextFeatures;

pub use bootstrap::{BootstrapUcbConfig, BootstrappedUcb};
pub use epsilon::{EpsilonGreedy, EpsilonGreedyConfig};
pub use lin_ts::{LinTsConfig, LinearThompson};
pub use neural::{NeuralScorer, NeuralUcb, NeuralUcbConfig, TrainingExample};
pub use state::{ArmState, BootstrapHead, PolicySnapshot, PolicyStateStore, StateKey};

pub const EPSILON_GREEDY: &str = "epsilon_greedy";
pub const LIN_TS: &str = "lin_ts";
pub const BOOTSTRAP_UCB: &str = "bootstrap_ucb";
pub const NEURAL_UCB: &str = "neural_ucb";

/// A policy's view of one arm
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RewardEstimate {
    /// Point estimate of the expected reward
    pub mean: f64,
    /// Selection score (sampled or optimistic)
    pub score: f64,
    pub uncertainty: f64,
    pub observations: u64,
}

/// Output of `propose`, in candidate order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub policy: String,
    pub estimates: Vec<(String, RewardEstimate)>,
    /// The policy asks for a uniformly random eligible arm
    pub exploring: bool,
}

impl Proposal {
    pub fn get(&self, arm: &str) -> Option<&RewardEstimate> {
        self.estimates.iter().find(|(id, _)| id == arm).map(|(_, e)| e)
    }

    /// Highest mean among the proposal's arms
    pub fn best_mean(&self) -> Option<f64> {
        self.estimates
            .iter()
            .map(|(_, e)| e.mean)
            .fold(None, |best, m| Some(best.map_or(m, |b: f64| b.max(m))))
    }
}

/// Common interface of all bandit policies
///
/// `propose` runs on the blocking pool under the caller's deadline, so
/// implementations must be `Send + Sync` and keep their own interior locking.
pub trait BanditPolicy: Send + Sync {
    fn name(&self) -> &str;

    fn propose(&self, features: &ContextFeatures, arms: &[String]) -> Result<Proposal>;

    fn update(
        &self,
        decision_id: Uuid,
        arm: &str,
        features: &ContextFeatures,
        reward: f64,
    ) -> Result<()>;
}

/// Parameters for every built-in policy (`[policies]` config section)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    pub epsilon_greedy: EpsilonGreedyConfig,
    pub lin_ts: LinTsConfig,
    pub bootstrap_ucb: BootstrapUcbConfig,
    pub neural_ucb: NeuralUcbConfig,
    /// Fixed RNG seed for reproducible runs
    pub seed: Option<u64>,
}

impl PolicySettings {
    pub fn validate(&self) -> Result<()> {
        self.epsilon_greedy.validate()?;
        self.lin_ts.validate()?;
        self.bootstrap_ucb.validate()?;
        self.neural_ucb.validate()
    }

    /// Per-policy seed derived from the base seed
    fn seed_for(&self, name: &str) -> Option<u64> {
        self.seed
            .map(|s| s ^ crate::hashing::stable_bucket(&[name], u64::MAX))
    }
}

/// Inputs handed to a policy factory
pub struct PolicyContext<'a> {
    pub settings: &'a PolicySettings,
    pub state: Arc<PolicyStateStore>,
}

pub type PolicyFactory =
    Arc<dyn Fn(&PolicyContext<'_>) -> Result<Arc<dyn BanditPolicy>> + Send + Sync>;

/// Named policy factories resolved at startup
#[derive(Clone, Default)]
pub struct PolicyRegistry {
    factories: HashMap<String, PolicyFactory>,
}

impl std::fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyRegistry")
            .field("policies", &self.names())
            .finish()
    }
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `epsilon_greedy`, `lin_ts` and `bootstrap_ucb`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(EPSILON_GREEDY, |ctx| {
            let mut policy =
                EpsilonGreedy::new(ctx.settings.epsilon_greedy.clone(), Arc::clone(&ctx.state));
            if let Some(seed) = ctx.settings.seed_for(EPSILON_GREEDY) {
                policy = policy.with_seed(seed);
            }
            Ok(Arc::new(policy) as Arc<dyn BanditPolicy>)
        });
        registry.register(LIN_TS, |ctx| {
            let mut policy = LinearThompson::new(ctx.settings.lin_ts.clone(), Arc::clone(&ctx.state));
            if let Some(seed) = ctx.settings.seed_for(LIN_TS) {
                policy = policy.with_seed(seed);
            }
            Ok(Arc::new(policy) as Arc<dyn BanditPolicy>)
        });
        registry.register(BOOTSTRAP_UCB, |ctx| {
            let mut policy =
                BootstrappedUcb::new(ctx.settings.bootstrap_ucb.clone(), Arc::clone(&ctx.state))?;
            if let Some(seed) = ctx.settings.seed_for(BOOTSTRAP_UCB) {
                policy = policy.with_seed(seed);
            }
            Ok(Arc::new(policy) as Arc<dyn BanditPolicy>)
        });
        registry
    }

    /// Make `neural_ucb` available, backed by `scorer`
    pub fn with_neural_scorer(mut self, scorer: Arc<dyn NeuralScorer>) -> Self {
        self.register(NEURAL_UCB, move |ctx| {
            Ok(Arc::new(NeuralUcb::new(
                ctx.settings.neural_ucb.clone(),
                Arc::clone(&scorer),
            )) as Arc<dyn BanditPolicy>)
        });
        self
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&PolicyContext<'_>) -> Result<Arc<dyn BanditPolicy>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn build(&self, name: &str, ctx: &PolicyContext<'_>) -> Result<Arc<dyn BanditPolicy>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::UnknownPolicy(name.to_string()))?;
        factory(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(settings: &PolicySettings) -> PolicyContext<'_> {
        PolicyContext {
            settings,
            state: Arc::new(PolicyStateStore::new()),
        }
    }

    #[test]
    fn test_builtins_resolve() {
        let registry = PolicyRegistry::with_builtins();
        let settings = PolicySettings::default();
        for name in [EPSILON_GREEDY, LIN_TS, BOOTSTRAP_UCB] {
            let policy = registry.build(name, &ctx(&settings)).unwrap();
            assert_eq!(policy.name(), name);
        }
        assert!(!registry.contains(NEURAL_UCB));
    }

    #[test]
    fn test_unknown_policy_is_config_error() {
        let registry = PolicyRegistry::with_builtins();
        let settings = PolicySettings::default();
        let err = registry.build("magic", &ctx(&settings)).err().unwrap();
        assert!(matches!(err, Error::UnknownPolicy(_)));
    }

    #[test]
    fn test_proposal_best_mean() {
        let estimate = |mean| RewardEstimate {
            mean,
            score: mean,
            uncertainty: 0.0,
            observations: 1,
        };
        let proposal = Proposal {
            policy: "p".into(),
            estimates: vec![("a".into(), estimate(0.2)), ("b".into(), estimate(0.7))],
            exploring: false,
        };
        assert_eq!(proposal.best_mean(), Some(0.7));
        assert_eq!(proposal.get("a").unwrap().mean, 0.2);
        assert!(proposal.get("c").is_none());
    }

    #[test]
    fn test_seeded_policies_are_reproducible() {
        let registry = PolicyRegistry::with_builtins();
        let settings = PolicySettings {
            seed: Some(42),
            ..Default::default()
        };
        let arms = vec!["a".to_string(), "b".to_string()];
        let x = ContextFeatures::new(vec![1.0, 0.3]).unwrap();
        let first = registry.build(LIN_TS, &ctx(&settings)).unwrap();
        let second = registry.build(LIN_TS, &ctx(&settings)).unwrap();
        assert_eq!(
            first.propose(&x, &arms).unwrap(),
            second.propose(&x, &arms).unwrap()
        );
    }
}
