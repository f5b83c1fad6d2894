//! Declarative configuration with file persistence and hot reload
//!
//! ```toml
//! [routing]
//! default_policy = "lin_ts"
//! baseline_policy = "epsilon_greedy"
//! decision_budget_ms = 50
//!
//! [[arms]]
//! id = "fast"
//! unit_cost = 0.2
//!
//! [[experiments]]
//! id = "lin-vs-greedy"
//! min_detectable_effect = 0.05
//! variants = [
//!     { name = "control", policy = "epsilon_greedy" },
//!     { name = "treatment", policy = "lin_ts" },
//! ]
//! ```
//!
//! Invalid configuration is rejected as a whole; nothing is applied.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::CacheConfig;
use crate::context::TrimmerConfig;
use crate::error::{Error, Result};
use crate::experiment::ExperimentConfig;
use crate::flags::FlagConfig;
use crate::metrics::MetricsConfig;
use crate::routing::policy::{EPSILON_GREEDY, LIN_TS, NEURAL_UCB, PolicySettings};
use crate::routing::types::ArmConfig;
use crate::routing::utility::UtilityWeights;

/// Switchyard configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub routing: RoutingConfig,
    pub policies: PolicySettings,
    pub utility: UtilityWeights,
    pub cache: CacheConfig,
    pub trimmer: TrimmerConfig,
    pub metrics: MetricsConfig,
    pub arms: Vec<ArmConfig>,
    pub flags: Vec<FlagConfig>,
    pub experiments: Vec<ExperimentConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Policy used outside experiments
    pub default_policy: String,
    /// Control and fallback policy
    pub baseline_policy: String,
    /// Per-decision budget when the request carries no deadline
    pub decision_budget_ms: u64,
    /// Capacity of the reward queue feeding the updater task
    pub reward_queue_capacity: usize,
    /// Decisions remembered for reward matching and duplicate detection
    pub max_tracked_decisions: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_policy: LIN_TS.to_string(),
            baseline_policy: EPSILON_GREEDY.to_string(),
            decision_budget_ms: 50,
            reward_queue_capacity: 4096,
            max_tracked_decisions: 100_000,
        }
    }
}

impl RoutingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_policy == NEURAL_UCB {
            return Err(Error::Config(
                "neural_ucb cannot be the default policy; gate it with the 'neural_ucb' flag".to_string(),
            ));
        }
        if self.baseline_policy == NEURAL_UCB {
            return Err(Error::Config("neural_ucb cannot be the baseline policy".to_string()));
        }
        if self.decision_budget_ms == 0 {
            return Err(Error::Config("routing.decision_budget_ms must be positive".to_string()));
        }
        if self.reward_queue_capacity == 0 || self.max_tracked_decisions == 0 {
            return Err(Error::Config(
                "routing queue and ledger capacities must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

const KEYS: &[&str] = &[
    "routing.default_policy",
    "routing.baseline_policy",
    "routing.decision_budget_ms",
    "routing.reward_queue_capacity",
    "routing.max_tracked_decisions",
    "policies.epsilon_greedy.epsilon",
    "policies.lin_ts.alpha",
    "policies.lin_ts.lambda",
    "policies.bootstrap_ucb.heads",
    "policies.bootstrap_ucb.prior_weight",
    "policies.neural_ucb.beta",
    "utility.cost_exponent",
    "utility.latency_exponent",
    "utility.latency_scale_ms",
    "utility.quality_floor",
    "utility.floor_min_observations",
    "cache.enabled",
    "cache.similarity_threshold",
    "cache.top_k",
    "cache.default_ttl_secs",
    "cache.grace_window_secs",
    "cache.max_entries_per_namespace",
    "trimmer.default_token_budget",
    "metrics.max_label_sets",
];

impl Config {
    /// Load configuration from a TOML file; the file must exist and validate
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise return the defaults
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(contents).map_err(|e| Error::Config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section and the cross-section rules
    pub fn validate(&self) -> Result<()> {
        self.routing.validate()?;
        self.policies.validate()?;
        self.utility.validate()?;
        self.cache.validate()?;
        self.trimmer.validate()?;
        self.metrics.validate()?;

        let mut arm_ids = HashSet::new();
        for arm in &self.arms {
            arm.validate()?;
            if !arm_ids.insert(arm.id.as_str()) {
                return Err(Error::Config(format!("duplicate arm '{}'", arm.id)));
            }
        }

        let mut flag_names = HashSet::new();
        for flag in &self.flags {
            flag.validate()?;
            if !flag_names.insert(flag.name.as_str()) {
                return Err(Error::Config(format!("duplicate flag '{}'", flag.name)));
            }
        }

        let mut experiment_ids = HashSet::new();
        for experiment in &self.experiments {
            experiment.validate()?;
            if !experiment_ids.insert(experiment.id.as_str()) {
                return Err(Error::Config(format!("duplicate experiment '{}'", experiment.id)));
            }
            let control_policy = experiment
                .control_variant()
                .map(|v| v.policy.as_str())
                .unwrap_or_default();
            if control_policy != self.routing.baseline_policy {
                return Err(Error::Config(format!(
                    "experiment '{}': control must use the baseline policy '{}', not '{}'",
                    experiment.id, self.routing.baseline_policy, control_policy
                )));
            }
        }
        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        let value = match key {
            "routing.default_policy" => self.routing.default_policy.clone(),
            "routing.baseline_policy" => self.routing.baseline_policy.clone(),
            "routing.decision_budget_ms" => self.routing.decision_budget_ms.to_string(),
            "routing.reward_queue_capacity" => self.routing.reward_queue_capacity.to_string(),
            "routing.max_tracked_decisions" => self.routing.max_tracked_decisions.to_string(),

            "policies.epsilon_greedy.epsilon" => self.policies.epsilon_greedy.epsilon.to_string(),
            "policies.lin_ts.alpha" => self.policies.lin_ts.alpha.to_string(),
            "policies.lin_ts.lambda" => self.policies.lin_ts.lambda.to_string(),
            "policies.bootstrap_ucb.heads" => self.policies.bootstrap_ucb.heads.to_string(),
            "policies.bootstrap_ucb.prior_weight" => {
                self.policies.bootstrap_ucb.prior_weight.to_string()
            }
            "policies.neural_ucb.beta" => self.policies.neural_ucb.beta.to_string(),

            "utility.cost_exponent" => self.utility.cost_exponent.to_string(),
            "utility.latency_exponent" => self.utility.latency_exponent.to_string(),
            "utility.latency_scale_ms" => self.utility.latency_scale_ms.to_string(),
            "utility.quality_floor" => self.utility.quality_floor.to_string(),
            "utility.floor_min_observations" => self.utility.floor_min_observations.to_string(),

            "cache.enabled" => self.cache.enabled.to_string(),
            "cache.similarity_threshold" => self.cache.similarity_threshold.to_string(),
            "cache.top_k" => self.cache.top_k.to_string(),
            "cache.default_ttl_secs" => self.cache.default_ttl_secs.to_string(),
            "cache.grace_window_secs" => self.cache.grace_window_secs.to_string(),
            "cache.max_entries_per_namespace" => self.cache.max_entries_per_namespace.to_string(),

            "trimmer.default_token_budget" => self.trimmer.default_token_budget.to_string(),
            "metrics.max_label_sets" => self.metrics.max_label_sets.to_string(),

            _ => return Err(anyhow!("Unknown configuration key: {}", key)),
        };
        Ok(value)
    }

    /// Set a configuration value by key; the result must still validate
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut next = self.clone();
        match key {
            "routing.default_policy" => next.routing.default_policy = value.to_string(),
            "routing.baseline_policy" => next.routing.baseline_policy = value.to_string(),
            "routing.decision_budget_ms" => next.routing.decision_budget_ms = parse(key, value)?,
            "routing.reward_queue_capacity" => next.routing.reward_queue_capacity = parse(key, value)?,
            "routing.max_tracked_decisions" => next.routing.max_tracked_decisions = parse(key, value)?,

            "policies.epsilon_greedy.epsilon" => next.policies.epsilon_greedy.epsilon = parse(key, value)?,
            "policies.lin_ts.alpha" => next.policies.lin_ts.alpha = parse(key, value)?,
            "policies.lin_ts.lambda" => next.policies.lin_ts.lambda = parse(key, value)?,
            "policies.bootstrap_ucb.heads" => next.policies.bootstrap_ucb.heads = parse(key, value)?,
            "policies.bootstrap_ucb.prior_weight" => {
                next.policies.bootstrap_ucb.prior_weight = parse(key, value)?
            }
            "policies.neural_ucb.beta" => next.policies.neural_ucb.beta = parse(key, value)?,

            "utility.cost_exponent" => next.utility.cost_exponent = parse(key, value)?,
            "utility.latency_exponent" => next.utility.latency_exponent = parse(key, value)?,
            "utility.latency_scale_ms" => next.utility.latency_scale_ms = parse(key, value)?,
            "utility.quality_floor" => next.utility.quality_floor = parse(key, value)?,
            "utility.floor_min_observations" => {
                next.utility.floor_min_observations = parse(key, value)?
            }

            "cache.enabled" => next.cache.enabled = parse(key, value)?,
            "cache.similarity_threshold" => next.cache.similarity_threshold = parse(key, value)?,
            "cache.top_k" => next.cache.top_k = parse(key, value)?,
            "cache.default_ttl_secs" => next.cache.default_ttl_secs = parse(key, value)?,
            "cache.grace_window_secs" => next.cache.grace_window_secs = parse(key, value)?,
            "cache.max_entries_per_namespace" => {
                next.cache.max_entries_per_namespace = parse(key, value)?
            }

            "trimmer.default_token_budget" => next.trimmer.default_token_budget = parse(key, value)?,
            "metrics.max_label_sets" => next.metrics.max_label_sets = parse(key, value)?,

            _ => return Err(anyhow!("Unknown configuration key: {}", key)),
        }
        next.validate()?;
        *self = next;
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        KEYS.iter()
            .map(|key| Ok((key.to_string(), self.get(key)?)))
            .collect()
    }
}

fn parse<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid {} value: {}", key, value))
}

/// Shared, atomically replaceable configuration
#[derive(Debug)]
pub struct ConfigHandle {
    current: RwLock<Arc<Config>>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            current: RwLock::new(Arc::new(config)),
        })
    }

    pub fn current(&self) -> Arc<Config> {
        self.current.read().clone()
    }

    /// Validate, then swap; the previous config stays on failure
    pub fn replace(&self, config: Config) -> Result<Arc<Config>> {
        config.validate()?;
        let config = Arc::new(config);
        *self.current.write() = Arc::clone(&config);
        info!(
            arms = config.arms.len(),
            experiments = config.experiments.len(),
            "Configuration replaced"
        );
        Ok(config)
    }

    pub fn reload_from(&self, path: &Path) -> anyhow::Result<Arc<Config>> {
        let config = Config::load(path)?;
        Ok(self.replace(config)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{ExperimentStatus, RolloutStage};
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
[routing]
default_policy = "lin_ts"
decision_budget_ms = 25

[policies]
seed = 7

[policies.epsilon_greedy]
epsilon = 0.2

[utility]
quality_floor = 0.3

[cache]
similarity_threshold = 0.95
default_ttl_secs = 600

[[arms]]
id = "fast"
unit_cost = 0.2
expected_latency_ms = 300

[[arms]]
id = "smart"
unit_cost = 2.0
capabilities = ["code"]

[[flags]]
name = "neural_ucb"
stage = "shadow"

[[experiments]]
id = "lin-vs-greedy"
min_detectable_effect = 0.05
status = "canary"
variants = [
    { name = "control", policy = "epsilon_greedy" },
    { name = "treatment", policy = "lin_ts", weight = 2.0 },
]
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.routing.decision_budget_ms, 25);
        assert_eq!(config.routing.baseline_policy, "epsilon_greedy");
        assert_eq!(config.policies.seed, Some(7));
        assert_eq!(config.policies.epsilon_greedy.epsilon, 0.2);
        assert_eq!(config.utility.quality_floor, 0.3);
        assert_eq!(config.arms.len(), 2);
        assert_eq!(config.arms[1].capabilities, vec!["code".to_string()]);
        assert_eq!(config.flags[0].stage, RolloutStage::Shadow);
        assert_eq!(config.experiments[0].status, ExperimentStatus::Canary);
        assert_eq!(config.experiments[0].variants[1].weight, 2.0);
    }

    #[test]
    fn test_defaults_validate() {
        Config::default().validate().unwrap();
        let empty = Config::from_toml_str("").unwrap();
        assert_eq!(empty, Config::default());
    }

    #[test]
    fn test_neural_default_rejected() {
        let toml = "[routing]\ndefault_policy = \"neural_ucb\"\n";
        assert!(matches!(Config::from_toml_str(toml), Err(Error::Config(_))));
    }

    #[test]
    fn test_control_must_be_baseline() {
        let toml = r#"
[[experiments]]
id = "bad"
min_detectable_effect = 0.1
variants = [
    { name = "control", policy = "lin_ts" },
    { name = "treatment", policy = "bootstrap_ucb" },
]
"#;
        assert!(Config::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_invalid_sections_rejected() {
        assert!(Config::from_toml_str("[cache]\nsimilarity_threshold = 1.5\n").is_err());
        assert!(Config::from_toml_str("[[arms]]\nid = \"a\"\nunit_cost = -1.0\n").is_err());
        let dup = "[[arms]]\nid = \"a\"\nunit_cost = 1.0\n[[arms]]\nid = \"a\"\nunit_cost = 2.0\n";
        assert!(Config::from_toml_str(dup).is_err());
        assert!(Config::from_toml_str("[routing]\ndecision_budget_ms = \"soon\"\n").is_err());
        assert!(Config::from_toml_str("[utility]\nquality_floor = 5.0\n").is_err());
        assert!(Config::from_toml_str("[utility]\nquality_floor = -0.2\n").is_err());
        assert!(Config::from_toml_str("[policies.bootstrap_ucb]\nprior_weight = -1.0\n").is_err());
    }

    #[test]
    fn test_get_set_list() {
        let mut config = Config::default();
        config.set("cache.similarity_threshold", "0.8").unwrap();
        assert_eq!(config.get("cache.similarity_threshold").unwrap(), "0.8");

        assert!(config.set("cache.similarity_threshold", "2").is_err());
        assert_eq!(config.cache.similarity_threshold, 0.8);
        assert!(config.set("routing.default_policy", "neural_ucb").is_err());
        assert!(config.set("nope", "1").is_err());
        assert!(config.set("utility.quality_floor", "5").is_err());
        config.set("utility.floor_min_observations", "25").unwrap();
        assert_eq!(config.utility.floor_min_observations, 25);
        assert!(config.get("nope").is_err());

        let listed = config.list().unwrap();
        assert_eq!(listed.len(), KEYS.len());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("switchyard.toml");
        let config = Config::from_toml_str(SAMPLE).unwrap();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert!(Config::load(&dir.path().join("missing.toml")).is_err());
        assert_eq!(
            Config::load_or_default(&dir.path().join("missing.toml")).unwrap(),
            Config::default()
        );
    }

    #[test]
    fn test_handle_keeps_previous_on_invalid() {
        let handle = ConfigHandle::new(Config::default()).unwrap();
        let mut bad = Config::default();
        bad.routing.decision_budget_ms = 0;
        assert!(handle.replace(bad).is_err());
        assert_eq!(handle.current().routing.decision_budget_ms, 50);

        let mut good = Config::default();
        good.routing.decision_budget_ms = 10;
        handle.replace(good).unwrap();
        assert_eq!(handle.current().routing.decision_budget_ms, 10);
    }
}
