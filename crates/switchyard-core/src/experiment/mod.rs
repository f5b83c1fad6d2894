//! A/B experiment harness
//!
//! - **Assignment**: SHA-256 of `experiment:key` into 10 000 buckets against
//!   cumulative variant weights. Stable for the life of the experiment.
//! - **Metrics**: append-only sharded buffers, aggregated when evaluated.
//! - **Evaluation**: Welch's t-test (continuous) or two-proportion z-test
//!   (rates) against the control, gated on the power-analysis sample size.
//!   Every look that passes the gate spends one of `planned_looks`, and each
//!   is judged against the Pocock boundary for that many looks. Once the
//!   looks are spent the primary metric can no longer promote or roll back.
//! - **Rollout**: `shadow -> canary -> full -> concluded`, with `aborted`
//!   reachable from any active status. Events are broadcast to subscribers.

mod metrics;
pub mod stats;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::flags::ExperimentStatus;
use crate::hashing::{stable_bucket, stable_fraction, BUCKETS};

pub use metrics::MetricBuffer;
use stats::{Moments, TestResult};

const EVENT_CAPACITY: usize = 256;

/// Metric names the decision service records for every rewarded decision
pub const METRIC_REWARD: &str = "reward";
pub const METRIC_COST: &str = "cost";
pub const METRIC_LATENCY: &str = "latency_ms";
/// Predicted reward of the arm a variant would choose, recorded at decision time
pub const METRIC_PREDICTED: &str = "predicted_reward";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantConfig {
    pub name: String,
    /// Policy serving this variant
    pub policy: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    #[default]
    Continuous,
    /// Values are 0/1 outcomes
    Proportion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardMetric {
    pub name: String,
    /// Largest tolerated relative regression, in `[0, 1]`
    pub tolerance: f64,
    #[serde(default)]
    pub higher_is_better: bool,
}

/// Declarative experiment definition (`[[experiments]]`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub id: String,
    pub variants: Vec<VariantConfig>,
    /// Control variant name; defaults to the first variant
    #[serde(default)]
    pub control: Option<String>,
    #[serde(default = "default_primary_metric")]
    pub primary_metric: String,
    #[serde(default)]
    pub primary_kind: MetricKind,
    #[serde(default = "default_true")]
    pub higher_is_better: bool,
    #[serde(default)]
    pub guard_metrics: Vec<GuardMetric>,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_power")]
    pub power: f64,
    /// Absolute effect the experiment must be able to detect
    pub min_detectable_effect: f64,
    /// Historical standard deviation (continuous) of the primary metric
    #[serde(default)]
    pub baseline_std: Option<f64>,
    /// Historical rate (proportion) of the primary metric
    #[serde(default)]
    pub baseline_rate: Option<f64>,
    #[serde(default = "default_planned_looks")]
    pub planned_looks: u32,
    /// Minimum improvement the primary metric must show to promote
    #[serde(default)]
    pub promote_threshold: f64,
    #[serde(default = "default_canary_fraction")]
    pub canary_fraction: f64,
    /// Minimum time in a stage before it may advance
    #[serde(default = "default_min_observation")]
    pub min_observation_secs: i64,
    #[serde(default)]
    pub status: ExperimentStatus,
}

fn default_primary_metric() -> String {
    METRIC_REWARD.to_string()
}
fn default_true() -> bool {
    true
}
fn default_alpha() -> f64 {
    0.05
}
fn default_power() -> f64 {
    0.8
}
fn default_planned_looks() -> u32 {
    5
}
fn default_canary_fraction() -> f64 {
    0.1
}
fn default_min_observation() -> i64 {
    3600
}

impl ExperimentConfig {
    /// Two-variant experiment with defaults for everything else
    pub fn new(
        id: impl Into<String>,
        control_policy: impl Into<String>,
        variant_policy: impl Into<String>,
        min_detectable_effect: f64,
    ) -> Self {
        Self {
            id: id.into(),
            variants: vec![
                VariantConfig {
                    name: "control".to_string(),
                    policy: control_policy.into(),
                    weight: 1.0,
                },
                VariantConfig {
                    name: "treatment".to_string(),
                    policy: variant_policy.into(),
                    weight: 1.0,
                },
            ],
            control: None,
            primary_metric: default_primary_metric(),
            primary_kind: MetricKind::Continuous,
            higher_is_better: true,
            guard_metrics: Vec::new(),
            alpha: default_alpha(),
            power: default_power(),
            min_detectable_effect,
            baseline_std: None,
            baseline_rate: None,
            planned_looks: default_planned_looks(),
            promote_threshold: 0.0,
            canary_fraction: default_canary_fraction(),
            min_observation_secs: default_min_observation(),
            status: ExperimentStatus::Shadow,
        }
    }

    pub fn with_status(mut self, status: ExperimentStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_baseline_std(mut self, std: f64) -> Self {
        self.baseline_std = Some(std);
        self
    }

    pub fn with_guard(mut self, guard: GuardMetric) -> Self {
        self.guard_metrics.push(guard);
        self
    }

    pub fn with_min_observation_secs(mut self, secs: i64) -> Self {
        self.min_observation_secs = secs;
        self
    }

    pub fn with_canary_fraction(mut self, fraction: f64) -> Self {
        self.canary_fraction = fraction;
        self
    }

    pub fn control_name(&self) -> &str {
        self.control
            .as_deref()
            .or_else(|| self.variants.first().map(|v| v.name.as_str()))
            .unwrap_or_default()
    }

    pub fn control_variant(&self) -> Option<&VariantConfig> {
        let control = self.control_name();
        self.variants.iter().find(|v| v.name == control)
    }

    pub fn variant(&self, name: &str) -> Option<&VariantConfig> {
        self.variants.iter().find(|v| v.name == name)
    }

    /// `(name, policy)` pairs; frozen once the experiment exists
    fn variant_set(&self) -> Vec<(String, String)> {
        let mut set: Vec<(String, String)> = self
            .variants
            .iter()
            .map(|v| (v.name.clone(), v.policy.clone()))
            .collect();
        set.sort();
        set
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::Config(format!("experiment '{}': {}", self.id, msg)));

        if self.id.trim().is_empty() || self.id.contains(':') {
            return Err(Error::Config(format!(
                "experiment id '{}' must be non-empty and must not contain ':'",
                self.id
            )));
        }
        if self.variants.len() < 2 {
            return fail("needs at least two variants".to_string());
        }
        let mut names = HashSet::new();
        for variant in &self.variants {
            if variant.name.trim().is_empty() {
                return fail("variant names must not be empty".to_string());
            }
            if !names.insert(variant.name.as_str()) {
                return fail(format!("duplicate variant '{}'", variant.name));
            }
            if !variant.weight.is_finite() || variant.weight <= 0.0 {
                return fail(format!("variant '{}' weight must be positive", variant.name));
            }
        }
        if self.control_variant().is_none() {
            return fail(format!("control variant '{}' is missing", self.control_name()));
        }
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return fail(format!("alpha must be in (0, 1), got {}", self.alpha));
        }
        if !(self.power > 0.0 && self.power < 1.0) {
            return fail(format!("power must be in (0, 1), got {}", self.power));
        }
        if !self.min_detectable_effect.is_finite() || self.min_detectable_effect <= 0.0 {
            return fail("min_detectable_effect must be positive".to_string());
        }
        if let Some(std) = self.baseline_std {
            if !std.is_finite() || std <= 0.0 {
                return fail("baseline_std must be positive".to_string());
            }
        }
        if let Some(rate) = self.baseline_rate {
            if !(0.0..=1.0).contains(&rate) {
                return fail(format!("baseline_rate must be in [0, 1], got {}", rate));
            }
        }
        if self.planned_looks == 0 {
            return fail("planned_looks must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.canary_fraction) {
            return fail(format!("canary_fraction must be in [0, 1], got {}", self.canary_fraction));
        }
        if !(0.0..=1.0).contains(&self.promote_threshold) {
            return fail(format!(
                "promote_threshold must be in [0, 1], got {}",
                self.promote_threshold
            ));
        }
        for guard in &self.guard_metrics {
            if !(0.0..=1.0).contains(&guard.tolerance) {
                return fail(format!(
                    "guard '{}' tolerance must be in [0, 1], got {}",
                    guard.name, guard.tolerance
                ));
            }
        }
        if self.min_observation_secs < 0 {
            return fail("min_observation_secs must be non-negative".to_string());
        }
        if !self.status.is_active() {
            return fail(format!("cannot be declared with status {}", self.status));
        }
        Ok(())
    }
}

/// Variant chosen for an allocation key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub experiment_id: String,
    pub variant: String,
    pub control: String,
    /// Policy to serve if the variant is applied
    pub policy: String,
    pub control_policy: String,
    pub status: ExperimentStatus,
    /// The variant's behaviour is what the caller observes
    pub applied: bool,
}

impl Assignment {
    pub fn is_control(&self) -> bool {
        self.variant == self.control
    }

    /// Whether the decision should carry the variant
    pub fn is_recorded(&self) -> bool {
        self.status.is_active()
    }

    /// Policy whose choice is returned to the caller
    pub fn serving_policy(&self) -> &str {
        if self.applied {
            &self.policy
        } else {
            &self.control_policy
        }
    }

    /// Policy evaluated silently next to the serving one
    pub fn shadow_policy(&self) -> Option<&str> {
        (self.is_recorded() && !self.applied && self.policy != self.control_policy)
            .then_some(self.policy.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recommendation {
    InsufficientData,
    Promote { variant: String },
    Rollback { reason: String },
    NoSignificantEffect,
    /// Every planned look has been spent
    LooksExhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantComparison {
    pub variant: String,
    pub control_n: u64,
    pub variant_n: u64,
    pub effect: f64,
    pub p_value: f64,
    pub significant: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardCheck {
    pub metric: String,
    pub variant: String,
    /// Relative change in the bad direction (positive = worse)
    pub regression: f64,
    pub p_value: f64,
    pub breached: bool,
}

/// Output of `evaluate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub experiment_id: String,
    pub status: ExperimentStatus,
    /// Looks spent so far; only evaluations past the sample-size gate count
    pub look: u32,
    pub critical_value: f64,
    pub adjusted_alpha: f64,
    /// Smallest per-group n among all variants
    pub observed_n: u64,
    /// `None` while the variance needed for the power analysis is unknown
    pub required_n: Option<u64>,
    /// Effect and p-value of the strongest comparison
    pub effect: Option<f64>,
    pub p_value: Option<f64>,
    pub comparisons: Vec<VariantComparison>,
    pub guards: Vec<GuardCheck>,
    pub recommendation: Recommendation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExperimentEventKind {
    Started { status: ExperimentStatus },
    Advanced { from: ExperimentStatus, to: ExperimentStatus },
    Aborted { from: ExperimentStatus, reason: String },
    Concluded { winner: Option<String> },
}

/// Structured lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentEvent {
    pub experiment_id: String,
    pub event: ExperimentEventKind,
    pub at: DateTime<Utc>,
}

/// Aggregated metric for post-mortems
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantMetric {
    pub variant: String,
    pub metric: String,
    pub count: u64,
    pub mean: f64,
    pub std_dev: f64,
}

#[derive(Debug, Clone)]
struct RunState {
    status: ExperimentStatus,
    started_at: DateTime<Utc>,
    stage_entered_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Runtime {
    config: RwLock<ExperimentConfig>,
    state: RwLock<RunState>,
    looks: AtomicU32,
    metrics: MetricBuffer,
}

/// Allocation, metrics and rollout for every configured experiment
#[derive(Debug)]
pub struct ExperimentHarness {
    experiments: RwLock<HashMap<String, Arc<Runtime>>>,
    events: broadcast::Sender<ExperimentEvent>,
}

impl Default for ExperimentHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl ExperimentHarness {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            experiments: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn from_configs(configs: &[ExperimentConfig]) -> Result<Self> {
        let harness = Self::new();
        harness.apply(configs)?;
        Ok(harness)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExperimentEvent> {
        self.events.subscribe()
    }

    fn emit(&self, experiment_id: &str, event: ExperimentEventKind) {
        // no subscribers is fine
        let _ = self.events.send(ExperimentEvent {
            experiment_id: experiment_id.to_string(),
            event,
            at: Utc::now(),
        });
    }

    fn runtime(&self, id: &str) -> Result<Arc<Runtime>> {
        self.experiments
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ExperimentNotFound(id.to_string()))
    }

    /// Validate every config, then register them
    ///
    /// Existing experiments keep their status, metrics and looks; their
    /// variant set may not change. Experiments missing from `configs` are
    /// left as they are.
    pub fn apply(&self, configs: &[ExperimentConfig]) -> Result<()> {
        let mut seen = HashSet::new();
        for config in configs {
            config.validate()?;
            if !seen.insert(config.id.as_str()) {
                return Err(Error::Config(format!("duplicate experiment id '{}'", config.id)));
            }
            if let Some(existing) = self.experiments.read().get(&config.id) {
                if existing.config.read().variant_set() != config.variant_set() {
                    return Err(Error::Config(format!(
                        "experiment '{}' has started; its variant set cannot change",
                        config.id
                    )));
                }
            }
        }
        for config in configs {
            self.register(config.clone());
        }
        Ok(())
    }

    fn register(&self, config: ExperimentConfig) {
        let mut experiments = self.experiments.write();
        if let Some(existing) = experiments.get(&config.id) {
            debug!(experiment = %config.id, "Experiment tunables reloaded");
            *existing.config.write() = config;
            return;
        }
        let now = Utc::now();
        let id = config.id.clone();
        let status = config.status;
        experiments.insert(
            id.clone(),
            Arc::new(Runtime {
                config: RwLock::new(config),
                state: RwLock::new(RunState {
                    status,
                    started_at: now,
                    stage_entered_at: now,
                }),
                looks: AtomicU32::new(0),
                metrics: MetricBuffer::default(),
            }),
        );
        drop(experiments);
        info!(experiment = %id, status = %status, "Experiment started");
        self.emit(&id, ExperimentEventKind::Started { status });
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.experiments.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn status(&self, id: &str) -> Result<ExperimentStatus> {
        Ok(self.runtime(id)?.state.read().status)
    }

    pub fn started_at(&self, id: &str) -> Result<DateTime<Utc>> {
        Ok(self.runtime(id)?.state.read().started_at)
    }

    pub fn config(&self, id: &str) -> Result<ExperimentConfig> {
        Ok(self.runtime(id)?.config.read().clone())
    }

    pub fn active_count(&self) -> usize {
        self.experiments
            .read()
            .values()
            .filter(|rt| rt.state.read().status.is_active())
            .count()
    }

    /// Deterministic variant for `key`
    ///
    /// Aborted and concluded experiments always answer with the control.
    pub fn assign(&self, id: &str, key: &str) -> Result<Assignment> {
        let rt = self.runtime(id)?;
        let config = rt.config.read();
        let status = rt.state.read().status;
        let control = config.control_variant().ok_or_else(|| {
            Error::Config(format!("experiment '{}' has no control variant", id))
        })?;

        let variant = if status.is_active() {
            let total: f64 = config.variants.iter().map(|v| v.weight).sum();
            let point = stable_bucket(&[id, key], BUCKETS) as f64 / BUCKETS as f64 * total;
            let mut cumulative = 0.0;
            let mut chosen = config.variants.last().unwrap_or(control);
            for v in &config.variants {
                cumulative += v.weight;
                if point < cumulative {
                    chosen = v;
                    break;
                }
            }
            chosen
        } else {
            control
        };

        let applied = variant.name == control.name
            || match status {
                ExperimentStatus::Shadow => false,
                ExperimentStatus::Canary => {
                    stable_fraction(&["canary", id, key]) < config.canary_fraction
                }
                ExperimentStatus::Full => true,
                ExperimentStatus::Aborted | ExperimentStatus::Concluded => true,
            };

        Ok(Assignment {
            experiment_id: id.to_string(),
            variant: variant.name.clone(),
            control: control.name.clone(),
            policy: variant.policy.clone(),
            control_policy: control.policy.clone(),
            status,
            applied,
        })
    }

    /// Append one observation; data is kept after abort for post-mortems
    pub fn record_metric(&self, id: &str, variant: &str, metric: &str, value: f64) -> Result<()> {
        let rt = self.runtime(id)?;
        if rt.config.read().variant(variant).is_none() {
            return Err(Error::InvalidInput(format!(
                "experiment '{}' has no variant '{}'",
                id, variant
            )));
        }
        if !value.is_finite() {
            return Err(Error::InvalidInput(format!("metric '{}' value is not finite", metric)));
        }
        rt.metrics.record(variant, metric, value);
        Ok(())
    }

    pub fn variant_metrics(&self, id: &str) -> Result<Vec<VariantMetric>> {
        let rt = self.runtime(id)?;
        let mut out: Vec<VariantMetric> = rt
            .metrics
            .aggregate()
            .into_iter()
            .map(|((variant, metric), m)| VariantMetric {
                variant,
                metric,
                count: m.count,
                mean: m.mean,
                std_dev: m.std_dev(),
            })
            .collect();
        out.sort_by(|a, b| (&a.variant, &a.metric).cmp(&(&b.variant, &b.metric)));
        Ok(out)
    }

    /// Test every variant against the control
    ///
    /// A call spends a look only once the sample-size gate is met.
    pub fn evaluate(&self, id: &str) -> Result<Evaluation> {
        let rt = self.runtime(id)?;
        let config = rt.config.read().clone();
        let status = rt.state.read().status;
        let totals = rt.metrics.aggregate();
        let moments = |variant: &str, metric: &str| {
            totals
                .get(&(variant.to_string(), metric.to_string()))
                .copied()
                .unwrap_or_default()
        };

        let critical = stats::pocock_critical(config.alpha, config.planned_looks);
        let control = config.control_name().to_string();
        let control_primary = moments(&control, &config.primary_metric);
        let observed_n = config
            .variants
            .iter()
            .map(|v| moments(&v.name, &config.primary_metric).count)
            .min()
            .unwrap_or(0);
        let required_n = required_sample_size(&config, &control_primary);
        let gated = required_n.is_some_and(|n| observed_n >= n);
        let look = if gated {
            rt.looks.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            rt.looks.load(Ordering::SeqCst)
        };
        let exhausted = look > config.planned_looks;

        let sign = if config.higher_is_better { 1.0 } else { -1.0 };
        let mut comparisons = Vec::new();
        for variant in config.variants.iter().filter(|v| v.name != control) {
            let treatment = moments(&variant.name, &config.primary_metric);
            let test = match config.primary_kind {
                MetricKind::Continuous => stats::welch_test(&control_primary, &treatment),
                MetricKind::Proportion => stats::two_proportion_z(
                    successes(&control_primary),
                    control_primary.count,
                    successes(&treatment),
                    treatment.count,
                ),
            };
            if let Some(test) = test {
                comparisons.push(VariantComparison {
                    variant: variant.name.clone(),
                    control_n: control_primary.count,
                    variant_n: treatment.count,
                    effect: test.effect,
                    p_value: test.p_value,
                    significant: !exhausted && test.z_equivalent() >= critical,
                });
            }
        }

        let mut guards = Vec::new();
        for guard in &config.guard_metrics {
            let base = moments(&control, &guard.name);
            for variant in config.variants.iter().filter(|v| v.name != control) {
                let treatment = moments(&variant.name, &guard.name);
                let Some(test) = stats::welch_test(&base, &treatment) else {
                    continue;
                };
                guards.push(guard_check(guard, &variant.name, &base, &test, critical));
            }
        }

        let strongest = comparisons
            .iter()
            .max_by(|a, b| (a.effect * sign).total_cmp(&(b.effect * sign)));
        let recommendation = if let Some(breach) = guards.iter().find(|g| g.breached) {
            Recommendation::Rollback {
                reason: format!(
                    "guard metric '{}' regressed {:.1}% for variant '{}'",
                    breach.metric,
                    breach.regression * 100.0,
                    breach.variant
                ),
            }
        } else if !gated {
            Recommendation::InsufficientData
        } else if exhausted {
            Recommendation::LooksExhausted
        } else if let Some(best) = comparisons
            .iter()
            .filter(|c| c.significant && c.effect * sign > 0.0)
            .filter(|c| c.effect * sign >= config.promote_threshold)
            .max_by(|a, b| (a.effect * sign).total_cmp(&(b.effect * sign)))
        {
            Recommendation::Promote {
                variant: best.variant.clone(),
            }
        } else if let Some(worse) = comparisons
            .iter()
            .find(|c| c.significant && c.effect * sign < 0.0)
        {
            Recommendation::Rollback {
                reason: format!(
                    "primary metric '{}' regressed for variant '{}'",
                    config.primary_metric, worse.variant
                ),
            }
        } else {
            Recommendation::NoSignificantEffect
        };

        debug!(
            experiment = %id,
            look,
            observed_n,
            required_n = ?required_n,
            critical,
            recommendation = ?recommendation,
            "Experiment evaluated"
        );

        Ok(Evaluation {
            experiment_id: id.to_string(),
            status,
            look,
            critical_value: critical,
            adjusted_alpha: stats::alpha_for_critical(critical),
            observed_n,
            required_n,
            effect: strongest.map(|c| c.effect),
            p_value: strongest.map(|c| c.p_value),
            comparisons,
            guards,
            recommendation,
        })
    }

    pub fn advance(&self, id: &str) -> Result<ExperimentStatus> {
        self.advance_at(id, Utc::now())
    }

    /// Move to the next rollout stage if the evidence supports it
    pub fn advance_at(&self, id: &str, now: DateTime<Utc>) -> Result<ExperimentStatus> {
        let rt = self.runtime(id)?;
        let (from, entered) = {
            let state = rt.state.read();
            (state.status, state.stage_entered_at)
        };
        let to = from.next_stage().ok_or_else(|| Error::InvalidTransition {
            id: id.to_string(),
            from: from.to_string(),
            to: "next stage".to_string(),
        })?;

        let min_secs = rt.config.read().min_observation_secs;
        let observed = (now - entered).num_seconds();
        if observed < min_secs {
            return Err(Error::NotReadyToAdvance(
                id.to_string(),
                format!("observed {}s in {}, need {}s", observed, from, min_secs),
            ));
        }

        let evaluation = self.evaluate(id)?;
        if !matches!(evaluation.recommendation, Recommendation::Promote { .. }) {
            return Err(Error::NotReadyToAdvance(
                id.to_string(),
                format!("recommendation is {:?}", evaluation.recommendation),
            ));
        }

        {
            let mut state = rt.state.write();
            // status may have moved while evaluating
            state.status = state.status.transition(id, to)?;
            state.stage_entered_at = now;
        }
        info!(experiment = %id, from = %from, to = %to, "Experiment advanced");
        self.emit(id, ExperimentEventKind::Advanced { from, to });
        Ok(to)
    }

    /// Stop all non-control allocation; metrics are kept
    pub fn abort(&self, id: &str, reason: &str) -> Result<()> {
        let rt = self.runtime(id)?;
        let from = {
            let mut state = rt.state.write();
            let from = state.status;
            state.status = from.transition(id, ExperimentStatus::Aborted)?;
            state.stage_entered_at = Utc::now();
            from
        };
        warn!(experiment = %id, from = %from, reason = %reason, "Experiment aborted, rolling back to control");
        self.emit(
            id,
            ExperimentEventKind::Aborted {
                from,
                reason: reason.to_string(),
            },
        );
        Ok(())
    }

    pub fn conclude(&self, id: &str, winner: Option<String>) -> Result<()> {
        let rt = self.runtime(id)?;
        if let Some(ref w) = winner {
            if rt.config.read().variant(w).is_none() {
                return Err(Error::InvalidInput(format!(
                    "experiment '{}' has no variant '{}'",
                    id, w
                )));
            }
        }
        {
            let mut state = rt.state.write();
            state.status = state.status.transition(id, ExperimentStatus::Concluded)?;
            state.stage_entered_at = Utc::now();
        }
        info!(experiment = %id, winner = ?winner, "Experiment concluded");
        self.emit(id, ExperimentEventKind::Concluded { winner });
        Ok(())
    }
}

fn successes(m: &Moments) -> u64 {
    (m.mean * m.count as f64).round().max(0.0) as u64
}

fn required_sample_size(config: &ExperimentConfig, control: &Moments) -> Option<u64> {
    let delta = config.min_detectable_effect;
    match config.primary_kind {
        MetricKind::Continuous => {
            let sigma = match config.baseline_std {
                Some(s) => s,
                None if control.count >= 2 => control.std_dev(),
                None => return None,
            };
            Some(stats::required_n_continuous(config.alpha, config.power, sigma, delta))
        }
        MetricKind::Proportion => {
            let rate = match config.baseline_rate {
                Some(r) => r,
                None if control.count > 0 => control.mean,
                None => return None,
            };
            Some(stats::required_n_proportion(config.alpha, config.power, rate, delta))
        }
    }
}

fn guard_check(
    guard: &GuardMetric,
    variant: &str,
    base: &Moments,
    test: &TestResult,
    critical: f64,
) -> GuardCheck {
    let relative = test.effect / base.mean.abs().max(1e-12);
    let regression = if guard.higher_is_better { -relative } else { relative };
    GuardCheck {
        metric: guard.name.clone(),
        variant: variant.to_string(),
        regression,
        p_value: test.p_value,
        breached: regression > guard.tolerance && test.z_equivalent() >= critical,
    }
}
