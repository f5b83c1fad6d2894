//! Feature flag rollout controller
//!
//! Every gated feature moves through an explicit lifecycle:
//!
//! ```text
//! Disabled -> Shadow -> Canary -> Full
//! ```
//!
//! - **Shadow**: the feature runs silently; `is_active` stays `false` so
//!   observable behaviour never changes.
//! - **Canary**: a deterministic fraction of scopes (tenants) see the feature.
//! - **Full**: everyone sees it.
//!
//! Rollback from any stage returns to `Disabled`. The same module also owns
//! the experiment status machine used by the experiment harness.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::hashing::stable_fraction;

/// Feature lifecycle stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStage {
    #[default]
    Disabled,
    Shadow,
    Canary,
    Full,
}

impl RolloutStage {
    /// The stage a promotion moves to, if any
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Disabled => Some(Self::Shadow),
            Self::Shadow => Some(Self::Canary),
            Self::Canary => Some(Self::Full),
            Self::Full => None,
        }
    }
}

impl std::fmt::Display for RolloutStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::Shadow => write!(f, "shadow"),
            Self::Canary => write!(f, "canary"),
            Self::Full => write!(f, "full"),
        }
    }
}

impl std::str::FromStr for RolloutStage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "disabled" => Ok(Self::Disabled),
            "shadow" => Ok(Self::Shadow),
            "canary" => Ok(Self::Canary),
            "full" => Ok(Self::Full),
            _ => Err(format!("Unknown rollout stage: {}", s)),
        }
    }
}

/// Declarative flag definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagConfig {
    pub name: String,
    #[serde(default)]
    pub stage: RolloutStage,
    /// Fraction of scopes that see the feature while in canary
    #[serde(default = "default_canary_fraction")]
    pub canary_fraction: f64,
}

fn default_canary_fraction() -> f64 {
    0.1
}

impl FlagConfig {
    pub fn new(name: impl Into<String>, stage: RolloutStage) -> Self {
        Self {
            name: name.into(),
            stage,
            canary_fraction: default_canary_fraction(),
        }
    }

    pub fn with_canary_fraction(mut self, fraction: f64) -> Self {
        self.canary_fraction = fraction;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("flag name must not be empty".to_string()));
        }
        if !(0.0..=1.0).contains(&self.canary_fraction) {
            return Err(Error::Config(format!(
                "flag '{}': canary_fraction {} outside [0, 1]",
                self.name, self.canary_fraction
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct FlagState {
    stage: RolloutStage,
    canary_fraction: f64,
    updated_at: DateTime<Utc>,
}

/// Tracks the lifecycle stage of every gated feature
#[derive(Debug, Default)]
pub struct FlagController {
    flags: RwLock<HashMap<String, FlagState>>,
}

impl FlagController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a controller from declarative flag definitions
    pub fn from_configs(configs: &[FlagConfig]) -> Result<Self> {
        let controller = Self::new();
        controller.apply(configs)?;
        Ok(controller)
    }

    /// Replace flag stages from configuration (hot reload)
    ///
    /// All definitions are validated before any stage changes.
    pub fn apply(&self, configs: &[FlagConfig]) -> Result<()> {
        for config in configs {
            config.validate()?;
        }

        let mut flags = self.flags.write();
        for config in configs {
            let changed = flags
                .get(&config.name)
                .map(|s| s.stage != config.stage)
                .unwrap_or(true);
            if changed {
                info!(flag = %config.name, stage = %config.stage, "Flag stage applied");
            }
            flags.insert(
                config.name.clone(),
                FlagState {
                    stage: config.stage,
                    canary_fraction: config.canary_fraction,
                    updated_at: Utc::now(),
                },
            );
        }
        Ok(())
    }

    /// Current stage; unknown features are disabled
    pub fn stage(&self, feature: &str) -> RolloutStage {
        self.flags
            .read()
            .get(feature)
            .map(|s| s.stage)
            .unwrap_or_default()
    }

    /// When the feature last changed stage
    pub fn updated_at(&self, feature: &str) -> Option<DateTime<Utc>> {
        self.flags.read().get(feature).map(|s| s.updated_at)
    }

    /// Whether the feature is observably on for this scope
    pub fn is_active(&self, feature: &str, scope: &str) -> bool {
        let flags = self.flags.read();
        let Some(state) = flags.get(feature) else {
            return false;
        };
        match state.stage {
            RolloutStage::Disabled | RolloutStage::Shadow => false,
            RolloutStage::Canary => stable_fraction(&[feature, scope]) < state.canary_fraction,
            RolloutStage::Full => true,
        }
    }

    /// Whether the feature should run without affecting behaviour
    pub fn is_shadowed(&self, feature: &str) -> bool {
        self.stage(feature) == RolloutStage::Shadow
    }

    /// Whether the feature runs at all (silently or observably) for this scope
    pub fn is_enabled(&self, feature: &str, scope: &str) -> bool {
        self.is_shadowed(feature) || self.is_active(feature, scope)
    }

    /// Move a feature one stage forward
    pub fn promote(&self, feature: &str) -> Result<RolloutStage> {
        let mut flags = self.flags.write();
        let state = flags.entry(feature.to_string()).or_insert_with(|| FlagState {
            stage: RolloutStage::Disabled,
            canary_fraction: default_canary_fraction(),
            updated_at: Utc::now(),
        });
        let next = state.stage.next().ok_or_else(|| {
            Error::InvalidInput(format!("flag '{}' is already fully rolled out", feature))
        })?;
        info!(flag = %feature, from = %state.stage, to = %next, "Flag promoted");
        state.stage = next;
        state.updated_at = Utc::now();
        Ok(next)
    }

    /// Return a feature to `Disabled`, yielding the stage it was in
    pub fn rollback(&self, feature: &str) -> RolloutStage {
        let mut flags = self.flags.write();
        match flags.get_mut(feature) {
            Some(state) => {
                let previous = state.stage;
                state.stage = RolloutStage::Disabled;
                state.updated_at = Utc::now();
                warn!(flag = %feature, from = %previous, "Flag rolled back");
                previous
            }
            None => RolloutStage::Disabled,
        }
    }

    /// Snapshot of every known flag and its stage
    pub fn list(&self) -> Vec<(String, RolloutStage)> {
        let mut all: Vec<(String, RolloutStage)> = self
            .flags
            .read()
            .iter()
            .map(|(name, state)| (name.clone(), state.stage))
            .collect();
        all.sort();
        all
    }
}

/// Experiment lifecycle status
///
/// Transitions only move forward (`Shadow -> Canary -> Full -> Concluded`);
/// `Aborted` is reachable from any active status. `Concluded` and `Aborted`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    #[default]
    Shadow,
    Canary,
    Full,
    Aborted,
    Concluded,
}

impl ExperimentStatus {
    /// Whether the experiment still allocates traffic
    pub fn is_active(self) -> bool {
        matches!(self, Self::Shadow | Self::Canary | Self::Full)
    }

    /// The status reached by a successful promotion
    pub fn next_stage(self) -> Option<Self> {
        match self {
            Self::Shadow => Some(Self::Canary),
            Self::Canary => Some(Self::Full),
            _ => None,
        }
    }

    pub fn can_transition_to(self, to: Self) -> bool {
        match (self, to) {
            (from, Self::Aborted) => from.is_active(),
            (from, Self::Concluded) => from.is_active(),
            (Self::Shadow, Self::Canary) | (Self::Canary, Self::Full) => true,
            _ => false,
        }
    }

    /// Validate a transition for experiment `id`
    pub fn transition(self, id: &str, to: Self) -> Result<Self> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(Error::InvalidTransition {
                id: id.to_string(),
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }
}

impl std::fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shadow => write!(f, "shadow"),
            Self::Canary => write!(f, "canary"),
            Self::Full => write!(f, "full"),
            Self::Aborted => write!(f, "aborted"),
            Self::Concluded => write!(f, "concluded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_flag_is_inactive() {
        let flags = FlagController::new();
        assert!(!flags.is_active("neural_ucb", "tenant-a"));
        assert_eq!(flags.stage("neural_ucb"), RolloutStage::Disabled);
    }

    #[test]
    fn test_shadow_never_active() {
        let flags =
            FlagController::from_configs(&[FlagConfig::new("f", RolloutStage::Shadow)]).unwrap();
        assert!(flags.is_shadowed("f"));
        assert!((0..100).all(|i| !flags.is_active("f", &format!("t{}", i))));
        assert!(flags.is_enabled("f", "t1"));
    }

    #[test]
    fn test_canary_fraction_is_deterministic() {
        let flags = FlagController::from_configs(&[
            FlagConfig::new("f", RolloutStage::Canary).with_canary_fraction(0.25)
        ])
        .unwrap();
        let active: Vec<bool> = (0..400)
            .map(|i| flags.is_active("f", &format!("tenant-{}", i)))
            .collect();
        let again: Vec<bool> = (0..400)
            .map(|i| flags.is_active("f", &format!("tenant-{}", i)))
            .collect();
        assert_eq!(active, again);
        let on = active.iter().filter(|a| **a).count();
        assert!((50..150).contains(&on), "canary share off: {}", on);
    }

    #[test]
    fn test_promote_and_rollback() {
        let flags = FlagController::new();
        assert_eq!(flags.promote("f").unwrap(), RolloutStage::Shadow);
        assert_eq!(flags.promote("f").unwrap(), RolloutStage::Canary);
        assert_eq!(flags.promote("f").unwrap(), RolloutStage::Full);
        assert!(flags.promote("f").is_err());
        assert!(flags.is_active("f", "anyone"));
        assert_eq!(flags.rollback("f"), RolloutStage::Full);
        assert!(!flags.is_active("f", "anyone"));
    }

    #[test]
    fn test_invalid_fraction_rejected() {
        let bad = FlagConfig::new("f", RolloutStage::Canary).with_canary_fraction(1.5);
        assert!(FlagController::from_configs(&[bad]).is_err());
    }

    #[test]
    fn test_experiment_transitions() {
        use ExperimentStatus::*;
        assert!(Shadow.can_transition_to(Canary));
        assert!(Canary.can_transition_to(Full));
        assert!(!Shadow.can_transition_to(Full));
        assert!(!Full.can_transition_to(Canary));
        assert!(Full.can_transition_to(Aborted));
        assert!(!Aborted.can_transition_to(Shadow));
        assert!(!Concluded.can_transition_to(Aborted));
        assert!(Canary.transition("exp", Shadow).is_err());
    }

    #[test]
    fn test_stage_parse() {
        assert_eq!("CANARY".parse::<RolloutStage>().unwrap(), RolloutStage::Canary);
        assert!("later".parse::<RolloutStage>().is_err());
    }
}
