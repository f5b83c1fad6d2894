//! Types for adaptive model routing
//!
//! This module defines the arms the router chooses between, the feature
//! vector describing a request, and the decision / reward records that
//! connect a selection to its later outcome.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Length of the vector produced by [`ContextFeatures::from_signals`]
pub const FEATURE_DIM: usize = 8;

/// Tokens at which the token feature saturates
const TOKEN_SATURATION: f64 = 128_000.0;

/// Samples kept per arm for latency percentiles
const LATENCY_WINDOW: usize = 256;

/// Broad classification of the request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Chat,
    Code,
    Analysis,
    Summarize,
    Other,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chat => write!(f, "chat"),
            Self::Code => write!(f, "code"),
            Self::Analysis => write!(f, "analysis"),
            Self::Summarize => write!(f, "summarize"),
            Self::Other => write!(f, "other"),
        }
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "chat" => Ok(Self::Chat),
            "code" => Ok(Self::Code),
            "analysis" => Ok(Self::Analysis),
            "summarize" => Ok(Self::Summarize),
            "other" => Ok(Self::Other),
            _ => Err(format!("Unknown task type: {}", s)),
        }
    }
}

/// Raw request signals the caller turns into [`ContextFeatures`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSignals {
    pub task_type: TaskType,
    /// Estimated prompt tokens after trimming
    pub estimated_tokens: usize,
    /// Tenant tier, 0 (free) to 3 (enterprise)
    pub tenant_tier: u8,
    /// Freshness of the conversation, 1.0 = just started
    pub recency: f64,
}

impl RequestSignals {
    pub fn new(task_type: TaskType) -> Self {
        Self {
            task_type,
            estimated_tokens: 1000,
            tenant_tier: 0,
            recency: 1.0,
        }
    }

    pub fn with_estimated_tokens(mut self, tokens: usize) -> Self {
        self.estimated_tokens = tokens;
        self
    }

    pub fn with_tenant_tier(mut self, tier: u8) -> Self {
        self.tenant_tier = tier.min(3);
        self
    }

    pub fn with_recency(mut self, recency: f64) -> Self {
        self.recency = recency.clamp(0.0, 1.0);
        self
    }
}

/// Fixed-length numeric description of a request
///
/// Owned by the caller of `decide`; the core only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextFeatures(Vec<f64>);

impl ContextFeatures {
    /// Wrap raw values; every value must be finite
    pub fn new(values: Vec<f64>) -> Result<Self> {
        if values.is_empty() {
            return Err(Error::InvalidInput("context features are empty".to_string()));
        }
        if let Some(bad) = values.iter().position(|v| !v.is_finite()) {
            return Err(Error::InvalidInput(format!(
                "context feature {} is not finite",
                bad
            )));
        }
        Ok(Self(values))
    }

    /// Single constant feature, for context-free bandits
    pub fn bias_only() -> Self {
        Self(vec![1.0])
    }

    /// Build the standard [`FEATURE_DIM`] layout:
    /// `[bias, chat, code, analysis, summarize, tokens, tier, recency]`
    pub fn from_signals(signals: &RequestSignals) -> Self {
        let mut values = vec![0.0; FEATURE_DIM];
        values[0] = 1.0;
        match signals.task_type {
            TaskType::Chat => values[1] = 1.0,
            TaskType::Code => values[2] = 1.0,
            TaskType::Analysis => values[3] = 1.0,
            TaskType::Summarize => values[4] = 1.0,
            TaskType::Other => {}
        }
        values[5] = ((1.0 + signals.estimated_tokens as f64).ln() / (1.0 + TOKEN_SATURATION).ln())
            .min(1.0);
        values[6] = f64::from(signals.tenant_tier.min(3)) / 3.0;
        values[7] = signals.recency.clamp(0.0, 1.0);
        Self(values)
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }
}

/// Rolling window of observed latencies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self::new(LATENCY_WINDOW)
    }
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(LATENCY_WINDOW)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, latency_ms: f64) {
        if !latency_ms.is_finite() || latency_ms < 0.0 {
            return;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Nearest-rank percentile, `q` in `[0, 1]`
    pub fn percentile(&self, q: f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let rank = (q.clamp(0.0, 1.0) * sorted.len() as f64).ceil() as usize;
        Some(sorted[rank.saturating_sub(1).min(sorted.len() - 1)])
    }

    pub fn p50(&self) -> Option<f64> {
        self.percentile(0.50)
    }

    pub fn p95(&self) -> Option<f64> {
        self.percentile(0.95)
    }
}

/// Declarative arm definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmConfig {
    pub id: String,
    /// Declared cost per unit (e.g. USD per 1k tokens)
    pub unit_cost: f64,
    /// Latency assumed until real samples arrive
    #[serde(default = "default_expected_latency")]
    pub expected_latency_ms: f64,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

fn default_expected_latency() -> f64 {
    1000.0
}

impl ArmConfig {
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Config("arm id must not be empty".to_string()));
        }
        if !self.unit_cost.is_finite() || self.unit_cost < 0.0 {
            return Err(Error::Config(format!(
                "arm '{}': unit_cost must be a non-negative number",
                self.id
            )));
        }
        if !self.expected_latency_ms.is_finite() || self.expected_latency_ms < 0.0 {
            return Err(Error::Config(format!(
                "arm '{}': expected_latency_ms must be non-negative",
                self.id
            )));
        }
        Ok(())
    }
}

/// A selectable model/provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Arm {
    pub id: String,
    pub unit_cost: f64,
    pub expected_latency_ms: f64,
    pub capabilities: Vec<String>,
    pub active: bool,
    pub latency: LatencyWindow,
    /// Mean of reported per-call cost
    pub observed_cost: f64,
    pub observations: u64,
}

impl Arm {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            unit_cost: 1.0,
            expected_latency_ms: default_expected_latency(),
            capabilities: Vec::new(),
            active: true,
            latency: LatencyWindow::default(),
            observed_cost: 0.0,
            observations: 0,
        }
    }

    pub fn with_unit_cost(mut self, cost: f64) -> Self {
        self.unit_cost = cost;
        self
    }

    pub fn with_expected_latency(mut self, latency_ms: f64) -> Self {
        self.expected_latency_ms = latency_ms;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Observed p95 latency, or the declared expectation before any samples
    pub fn latency_p95(&self) -> f64 {
        self.latency.p95().unwrap_or(self.expected_latency_ms)
    }

    pub fn latency_p50(&self) -> f64 {
        self.latency.p50().unwrap_or(self.expected_latency_ms)
    }

    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }

    /// Fold a reported outcome into the cost and latency stats
    pub fn record_outcome(&mut self, cost: f64, latency_ms: f64) {
        self.latency.push(latency_ms);
        if cost.is_finite() && cost >= 0.0 {
            self.observations += 1;
            self.observed_cost += (cost - self.observed_cost) / self.observations as f64;
        }
    }
}

impl From<&ArmConfig> for Arm {
    fn from(config: &ArmConfig) -> Self {
        Arm::new(config.id.clone())
            .with_unit_cost(config.unit_cost)
            .with_expected_latency(config.expected_latency_ms)
            .with_capabilities(config.capabilities.clone())
    }
}

/// Registry of arms; arms are deactivated, never removed
#[derive(Debug, Default)]
pub struct ArmRegistry {
    arms: RwLock<HashMap<String, Arm>>,
}

impl ArmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_arms(arms: Vec<Arm>) -> Result<Self> {
        let registry = Self::new();
        {
            let mut map = registry.arms.write();
            for arm in arms {
                if map.contains_key(&arm.id) {
                    return Err(Error::Config(format!("duplicate arm id '{}'", arm.id)));
                }
                map.insert(arm.id.clone(), arm);
            }
        }
        Ok(registry)
    }

    /// Register or refresh an arm's declared properties, keeping its stats
    pub fn register(&self, arm: Arm) {
        let mut map = self.arms.write();
        match map.get_mut(&arm.id) {
            Some(existing) => {
                existing.unit_cost = arm.unit_cost;
                existing.expected_latency_ms = arm.expected_latency_ms;
                existing.capabilities = arm.capabilities;
                existing.active = true;
            }
            None => {
                map.insert(arm.id.clone(), arm);
            }
        }
    }

    /// Apply a configured arm set; arms missing from it are deactivated
    pub fn sync(&self, configs: &[ArmConfig]) {
        for config in configs {
            self.register(Arm::from(config));
        }
        let mut map = self.arms.write();
        for arm in map.values_mut() {
            if arm.active && !configs.iter().any(|c| c.id == arm.id) {
                debug!(arm = %arm.id, "Arm no longer configured, deactivating");
                arm.active = false;
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arm> {
        self.arms.read().get(id).cloned()
    }

    pub fn all(&self) -> Vec<Arm> {
        let mut arms: Vec<Arm> = self.arms.read().values().cloned().collect();
        arms.sort_by(|a, b| a.id.cmp(&b.id));
        arms
    }

    pub fn set_active(&self, id: &str, active: bool) -> Result<()> {
        let mut map = self.arms.write();
        let arm = map
            .get_mut(id)
            .ok_or_else(|| Error::UnknownArm(id.to_string()))?;
        arm.active = active;
        Ok(())
    }

    pub fn record_outcome(&self, id: &str, cost: f64, latency_ms: f64) {
        if let Some(arm) = self.arms.write().get_mut(id) {
            arm.record_outcome(cost, latency_ms);
        }
    }

    /// Resolve requested ids to active arms carrying the required capabilities
    ///
    /// Unknown or inactive ids are skipped, preserving request order.
    pub fn resolve(&self, ids: &[String], required: &[String]) -> Vec<Arm> {
        let map = self.arms.read();
        let mut resolved = Vec::with_capacity(ids.len());
        for id in ids {
            match map.get(id) {
                Some(arm) if arm.active && arm.has_capabilities(required) => {
                    if !resolved.iter().any(|a: &Arm| a.id == arm.id) {
                        resolved.push(arm.clone());
                    }
                }
                Some(_) => debug!(arm = %id, "Candidate filtered (inactive or missing capability)"),
                None => warn!(arm = %id, "Candidate arm is not registered"),
            }
        }
        resolved
    }
}

/// Experiment membership recorded on a decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentTag {
    pub experiment_id: String,
    pub variant: String,
    /// Whether the variant's behaviour was actually served
    pub applied: bool,
}

/// Cached answer served instead of routing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheHit {
    pub response: String,
    pub similarity: f32,
}

/// An immutable routing decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub tenant: String,
    pub context_features: ContextFeatures,
    pub candidate_arms: Vec<String>,
    pub chosen_arm: String,
    pub policy_used: String,
    pub predicted_reward: f64,
    pub predicted_utility: f64,
    pub experiment: Option<ExperimentTag>,
    /// Set when the configured policy failed and the baseline decided
    pub policy_fallback: bool,
    pub fallback_reason: Option<String>,
    pub exploration: bool,
    /// Present when the semantic cache answered the request
    pub cache_hit: Option<CacheHit>,
    /// Hash of the trimmed context, when context was supplied
    pub context_hash: Option<String>,
    pub truncated_single_chunk: bool,
}

impl Decision {
    pub fn experiment_variant(&self) -> Option<&str> {
        self.experiment.as_ref().map(|e| e.variant.as_str())
    }

    pub fn is_cache_hit(&self) -> bool {
        self.cache_hit.is_some()
    }
}

/// Outcome reported by the caller after invoking the chosen arm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardObservation {
    pub decision_id: Uuid,
    /// Reward in `[0, 1]`, or a signed utility
    pub reward: f64,
    pub cost: f64,
    pub latency_ms: f64,
    pub received_at: DateTime<Utc>,
}

impl RewardObservation {
    pub fn new(decision_id: Uuid, reward: f64, cost: f64, latency_ms: f64) -> Self {
        Self {
            decision_id,
            reward,
            cost,
            latency_ms,
            received_at: Utc::now(),
        }
    }
}

/// Acknowledgement returned by `report_reward`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardAck {
    Ack,
    DuplicateIgnored,
    UnknownDecision,
}
