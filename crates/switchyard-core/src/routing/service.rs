//! Decision service - the composition root
//!
//! `decide` runs trim -> cache lookup -> propose -> utility rank and returns
//! an immutable [`Decision`]. `report_reward` is idempotent and only enqueues
//! work; a dedicated updater task folds rewards into policy state, the
//! regret tracker, arm statistics, experiment metrics and persistence.
//!
//! Any policy failure or missed deadline falls back to the baseline policy
//! for that decision only; the decision carries `policy_fallback` and the
//! reason.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rand::prelude::*;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::policy::{
    BanditPolicy, NEURAL_UCB, NeuralScorer, PolicyContext, PolicyRegistry, PolicySnapshot,
    PolicyStateStore, Proposal,
};
use super::store::DecisionStore;
use super::tracker::{RegretSummary, RewardTracker};
use super::types::{
    Arm, ArmRegistry, CacheHit, ContextFeatures, Decision, ExperimentTag, RewardAck,
    RewardObservation,
};
use super::utility::{Ranking, UtilityScorer};
use crate::cache::{CacheLookup, CacheWrite, Embedder, SemanticCache};
use crate::config::{Config, ConfigHandle};
use crate::context::{ContextChunk, ContextTrimmer, TrimResult};
use crate::error::{Error, Result};
use crate::experiment::{
    Assignment, ExperimentHarness, METRIC_COST, METRIC_LATENCY, METRIC_PREDICTED, METRIC_REWARD,
};
use crate::flags::FlagController;
use crate::metrics::{MetricLabels, Metrics, MetricsSnapshot};

/// `policy_used` for decisions answered by the semantic cache
pub const CACHE_POLICY: &str = "cache";

/// A request for a routing decision
#[derive(Debug, Clone)]
pub struct DecisionRequest {
    pub features: ContextFeatures,
    pub candidates: Vec<String>,
    pub tenant: String,
    /// Allocation key; without one the request is outside every experiment
    pub experiment_key: Option<String>,
    /// Experiment to allocate in; defaults to the first active one by id
    pub experiment_id: Option<String>,
    pub chunks: Option<Vec<ContextChunk>>,
    pub token_budget: Option<usize>,
    pub required_capabilities: Vec<String>,
    pub deadline: Option<Instant>,
}

impl DecisionRequest {
    pub fn new(features: ContextFeatures, candidates: Vec<String>, tenant: impl Into<String>) -> Self {
        Self {
            features,
            candidates,
            tenant: tenant.into(),
            experiment_key: None,
            experiment_id: None,
            chunks: None,
            token_budget: None,
            required_capabilities: Vec::new(),
            deadline: None,
        }
    }

    pub fn with_experiment_key(mut self, key: impl Into<String>) -> Self {
        self.experiment_key = Some(key.into());
        self
    }

    pub fn with_experiment(mut self, id: impl Into<String>, key: impl Into<String>) -> Self {
        self.experiment_id = Some(id.into());
        self.experiment_key = Some(key.into());
        self
    }

    pub fn with_chunks(mut self, chunks: Vec<ContextChunk>) -> Self {
        self.chunks = Some(chunks);
        self
    }

    pub fn with_token_budget(mut self, budget: usize) -> Self {
        self.token_budget = Some(budget);
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.required_capabilities = capabilities;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.deadline = Some(Instant::now() + budget);
        self
    }
}

/// What a shadow policy would have chosen
#[derive(Debug, Clone)]
struct ShadowChoice {
    policy: String,
    /// Experiment variant the shadow ran for
    variant: Option<String>,
    arm: String,
}

/// A decision awaiting its reward
#[derive(Debug, Clone)]
struct PendingDecision {
    features: ContextFeatures,
    chosen_arm: String,
    candidates: Vec<String>,
    policy_used: String,
    experiment: Option<ExperimentTag>,
    control_variant: Option<String>,
    shadow: Option<ShadowChoice>,
}

/// Everything needed to cache the response to a decision
#[derive(Debug, Clone)]
struct PendingWrite {
    namespace: String,
    embedding: Vec<f32>,
    arm_id: String,
    context_hash: Option<String>,
}

/// Insertion-ordered map that forgets its oldest entries past `capacity`
#[derive(Debug)]
struct BoundedMap<K, V> {
    capacity: usize,
    map: HashMap<K, V>,
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone, V> BoundedMap<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn insert(&mut self, key: K, value: V) {
        if self.map.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
        }
        while self.map.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.map.remove(&oldest);
                }
                None => break,
            }
        }
        if self.order.len() > self.capacity * 2 {
            let map = &self.map;
            self.order.retain(|k| map.contains_key(k));
        }
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        self.map.remove(key)
    }

    fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

/// Pending and completed decision ids
#[derive(Debug)]
struct Ledger {
    pending: BoundedMap<Uuid, PendingDecision>,
    completed: BoundedMap<Uuid, ()>,
    writes: BoundedMap<Uuid, PendingWrite>,
}

impl Ledger {
    fn new(capacity: usize) -> Self {
        Self {
            pending: BoundedMap::new(capacity),
            completed: BoundedMap::new(capacity),
            writes: BoundedMap::new(capacity),
        }
    }
}

enum Intake {
    Duplicate,
    Unknown,
    Accepted(PendingDecision),
}

enum UpdaterMsg {
    Reward {
        pending: PendingDecision,
        observation: RewardObservation,
    },
    Flush(oneshot::Sender<()>),
}

struct Inner {
    config: ConfigHandle,
    registry: PolicyRegistry,
    state: Arc<PolicyStateStore>,
    policies: RwLock<HashMap<String, Arc<dyn BanditPolicy>>>,
    arms: ArmRegistry,
    scorer: RwLock<UtilityScorer>,
    trimmer: RwLock<ContextTrimmer>,
    cache: SemanticCache,
    embedder: Option<Arc<dyn Embedder>>,
    flags: FlagController,
    experiments: ExperimentHarness,
    tracker: RewardTracker,
    metrics: Metrics,
    store: Option<Arc<dyn DecisionStore>>,
    ledger: Mutex<Ledger>,
    rng: Mutex<StdRng>,
}

/// Builder for [`DecisionService`]
pub struct DecisionServiceBuilder {
    config: Config,
    registry: PolicyRegistry,
    embedder: Option<Arc<dyn Embedder>>,
    store: Option<Arc<dyn DecisionStore>>,
    state: Option<Arc<PolicyStateStore>>,
}

impl DecisionServiceBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: PolicyRegistry::with_builtins(),
            embedder: None,
            store: None,
            state: None,
        }
    }

    /// Replace the policy registry (custom policies)
    pub fn with_registry(mut self, registry: PolicyRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Make `neural_ucb` available; it still needs its flag to serve traffic
    pub fn with_neural_scorer(mut self, scorer: Arc<dyn NeuralScorer>) -> Self {
        self.registry = self.registry.with_neural_scorer(scorer);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn DecisionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_state_store(mut self, state: Arc<PolicyStateStore>) -> Self {
        self.state = Some(state);
        self
    }

    /// Validate the configuration and start the updater task
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<DecisionService> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            Error::Config("the decision service must be built inside a tokio runtime".to_string())
        })?;
        self.config.validate()?;

        let state = self.state.unwrap_or_default();
        let policies = build_policies(&self.registry, &self.config, &state)?;
        let arms = ArmRegistry::new();
        arms.sync(&self.config.arms);
        let seed = self.config.policies.seed;

        let inner = Arc::new(Inner {
            registry: self.registry,
            state,
            policies: RwLock::new(policies),
            arms,
            scorer: RwLock::new(UtilityScorer::new(self.config.utility.clone())),
            trimmer: RwLock::new(ContextTrimmer::new(self.config.trimmer.clone())),
            cache: SemanticCache::new(self.config.cache.clone()),
            embedder: self.embedder,
            flags: FlagController::from_configs(&self.config.flags)?,
            experiments: ExperimentHarness::from_configs(&self.config.experiments)?,
            tracker: RewardTracker::default(),
            metrics: Metrics::new(&self.config.metrics),
            store: self.store,
            ledger: Mutex::new(Ledger::new(self.config.routing.max_tracked_decisions)),
            rng: Mutex::new(match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            }),
            config: ConfigHandle::new(self.config.clone())?,
        });

        let (tx, rx) = mpsc::channel(self.config.routing.reward_queue_capacity);
        runtime.spawn(run_updater(Arc::clone(&inner), rx));

        info!(
            default_policy = %self.config.routing.default_policy,
            baseline_policy = %self.config.routing.baseline_policy,
            arms = self.config.arms.len(),
            experiments = self.config.experiments.len(),
            "Decision service started"
        );

        Ok(DecisionService { inner, updates: tx })
    }
}

/// Build every policy the configuration references
/// Fails once `deadline` has passed
fn within_deadline(deadline: Instant, stage: &'static str) -> Result<()> {
    if Instant::now() >= deadline {
        return Err(Error::DeadlineExceeded(stage));
    }
    Ok(())
}

fn build_policies(
    registry: &PolicyRegistry,
    config: &Config,
    state: &Arc<PolicyStateStore>,
) -> Result<HashMap<String, Arc<dyn BanditPolicy>>> {
    let mut names: HashSet<&str> = HashSet::new();
    names.insert(&config.routing.default_policy);
    names.insert(&config.routing.baseline_policy);
    for experiment in &config.experiments {
        for variant in &experiment.variants {
            names.insert(&variant.policy);
        }
    }
    if registry.contains(NEURAL_UCB) {
        names.insert(NEURAL_UCB);
    }

    let ctx = PolicyContext {
        settings: &config.policies,
        state: Arc::clone(state),
    };
    let mut policies = HashMap::new();
    for name in names {
        policies.insert(name.to_string(), registry.build(name, &ctx)?);
    }
    Ok(policies)
}

/// Adaptive routing front door
pub struct DecisionService {
    inner: Arc<Inner>,
    updates: mpsc::Sender<UpdaterMsg>,
}

impl std::fmt::Debug for DecisionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionService")
            .field("policies", &self.policy_names())
            .finish()
    }
}

impl DecisionService {
    pub fn builder(config: Config) -> DecisionServiceBuilder {
        DecisionServiceBuilder::new(config)
    }

    /// Route one request
    pub async fn decide(&self, request: DecisionRequest) -> Result<Decision> {
        let started = Instant::now();
        let config = self.inner.config.current();
        let deadline = request
            .deadline
            .unwrap_or_else(|| started + Duration::from_millis(config.routing.decision_budget_ms));

        let arms = self
            .inner
            .arms
            .resolve(&request.candidates, &request.required_capabilities);
        if arms.is_empty() {
            return Err(Error::NoCandidates(format!(
                "none of {:?} is registered, active and capable",
                request.candidates
            )));
        }
        let arm_ids: Vec<String> = arms.iter().map(|a| a.id.clone()).collect();

        let trimmed = request.chunks.as_ref().map(|chunks| {
            let trimmer = self.inner.trimmer.read();
            let budget = request.token_budget.unwrap_or_else(|| trimmer.default_budget());
            trimmer.trim(chunks, budget)
        });
        let context_hash = trimmed.as_ref().filter(|t| !t.is_empty()).map(TrimResult::context_hash);
        let truncated_single_chunk = trimmed.as_ref().is_some_and(|t| t.truncated_single_chunk);

        let mut embedding = None;
        if let Some(trimmed) = trimmed.as_ref().filter(|t| !t.is_empty()) {
            match self.lookup_context(&request.tenant, trimmed, deadline).await {
                Some((lookup, _)) if lookup.hit => {
                    return Ok(self.cache_decision(request, lookup, context_hash, started));
                }
                Some((_, emb)) => embedding = Some(emb),
                None => {}
            }
        }

        let assignment = self.assign(&request);
        let (serving, shadow) = self.select_policies(&config, &request.tenant, assignment.as_ref());

        let (primary, shadow_result) = match &shadow {
            Some(shadow_name) => tokio::join!(
                self.propose_within(&serving, &request.features, &arm_ids, deadline),
                self.propose_within(shadow_name, &request.features, &arm_ids, deadline),
            ),
            None => (
                self.propose_within(&serving, &request.features, &arm_ids, deadline).await,
                Err(Error::PolicyUnavailable("no shadow".to_string())),
            ),
        };

        let decision_id = Uuid::new_v4();
        let primary = primary.and_then(|p| within_deadline(deadline, "utility scoring").map(|_| p));
        let (policy_used, proposal, fallback_reason) = match primary {
            Ok(proposal) if !proposal.estimates.is_empty() => (serving.clone(), Some(proposal), None),
            Ok(_) => (
                config.routing.baseline_policy.clone(),
                None,
                Some(format!("{} returned no estimates", serving)),
            ),
            Err(e) => {
                warn!(
                    decision_id = %decision_id,
                    policy = %serving,
                    error = %e,
                    "Policy failed, falling back to baseline"
                );
                (config.routing.baseline_policy.clone(), None, Some(e.to_string()))
            }
        };
        let proposal = match proposal {
            Some(p) => Some(p),
            None => self.baseline_proposal(&policy_used, &request.features, &arm_ids, decision_id),
        };

        let scorer = self.inner.scorer.read().clone();
        let ranking = proposal
            .as_ref()
            .map(|p| scorer.rank(p, &arms))
            .unwrap_or_default();
        let (chosen, exploration) = self.choose(&ranking, proposal.as_ref(), &arms);
        if ranking.floor_unmet {
            debug!(decision_id = %decision_id, "No arm clears the quality floor; ranking all");
        }

        let shadow_choice = shadow.as_ref().and_then(|name| match &shadow_result {
            Ok(p) => scorer.rank(p, &arms).top().map(|top| ShadowChoice {
                policy: name.clone(),
                variant: assignment
                    .as_ref()
                    .filter(|a| a.shadow_policy() == Some(name.as_str()))
                    .map(|a| a.variant.clone()),
                arm: top.arm.clone(),
            }),
            Err(e) => {
                debug!(decision_id = %decision_id, policy = %name, error = %e, "Shadow proposal failed");
                None
            }
        });

        let experiment = assignment.as_ref().map(|a| ExperimentTag {
            experiment_id: a.experiment_id.clone(),
            variant: a.variant.clone(),
            applied: a.applied,
        });
        self.record_predictions(assignment.as_ref(), &chosen, shadow_choice.as_ref(), &shadow_result);

        let decision = Decision {
            id: decision_id,
            timestamp: Utc::now(),
            tenant: request.tenant.clone(),
            context_features: request.features.clone(),
            candidate_arms: arm_ids.clone(),
            chosen_arm: chosen.arm.clone(),
            policy_used: policy_used.clone(),
            predicted_reward: chosen.predicted_reward,
            predicted_utility: chosen.utility,
            experiment: experiment.clone(),
            policy_fallback: fallback_reason.is_some(),
            fallback_reason,
            exploration,
            cache_hit: None,
            context_hash: context_hash.clone(),
            truncated_single_chunk,
        };

        {
            let mut ledger = self.inner.ledger.lock();
            ledger.pending.insert(
                decision_id,
                PendingDecision {
                    features: request.features,
                    chosen_arm: chosen.arm.clone(),
                    candidates: arm_ids,
                    policy_used: policy_used.clone(),
                    experiment,
                    control_variant: assignment.as_ref().map(|a| a.control.clone()),
                    shadow: shadow_choice,
                },
            );
            if let Some(embedding) = embedding {
                ledger.writes.insert(
                    decision_id,
                    PendingWrite {
                        namespace: request.tenant,
                        embedding,
                        arm_id: chosen.arm,
                        context_hash,
                    },
                );
            }
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.inner.metrics.record_decision(
            MetricLabels::new(&policy_used, decision.experiment_variant()),
            elapsed_ms,
            false,
            decision.policy_fallback,
        );
        self.persist_decision(&decision);

        debug!(
            decision_id = %decision.id,
            tenant = %decision.tenant,
            arm = %decision.chosen_arm,
            policy = %decision.policy_used,
            predicted_reward = decision.predicted_reward,
            exploration = decision.exploration,
            fallback = decision.policy_fallback,
            elapsed_ms,
            "Decision made"
        );
        Ok(decision)
    }

    /// Idempotent reward intake
    ///
    /// Only the first report for a decision is applied; later ones and
    /// unknown ids are acknowledged no-ops.
    pub async fn report_reward(
        &self,
        decision_id: Uuid,
        reward: f64,
        cost: f64,
        latency_ms: f64,
    ) -> Result<RewardAck> {
        if !reward.is_finite() {
            return Err(Error::InvalidInput(format!("reward {} is not finite", reward)));
        }
        if !cost.is_finite() || cost < 0.0 || !latency_ms.is_finite() || latency_ms < 0.0 {
            return Err(Error::InvalidInput(
                "cost and latency must be finite and non-negative".to_string(),
            ));
        }

        let intake = {
            let mut ledger = self.inner.ledger.lock();
            if ledger.completed.contains(&decision_id) {
                Intake::Duplicate
            } else {
                match ledger.pending.remove(&decision_id) {
                    Some(pending) => {
                        ledger.completed.insert(decision_id, ());
                        Intake::Accepted(pending)
                    }
                    None => Intake::Unknown,
                }
            }
        };

        let pending = match intake {
            Intake::Duplicate => {
                warn!(decision_id = %decision_id, "Duplicate reward ignored");
                return Ok(RewardAck::DuplicateIgnored);
            }
            Intake::Unknown => {
                warn!(decision_id = %decision_id, "Reward for unknown decision ignored");
                return Ok(RewardAck::UnknownDecision);
            }
            Intake::Accepted(pending) => pending,
        };

        let observation = RewardObservation::new(decision_id, reward, cost, latency_ms);
        self.updates
            .send(UpdaterMsg::Reward {
                pending,
                observation,
            })
            .await
            .map_err(|_| Error::UpdaterStopped)?;
        Ok(RewardAck::Ack)
    }

    /// Wait until every reward reported so far has been applied
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.updates
            .send(UpdaterMsg::Flush(tx))
            .await
            .map_err(|_| Error::UpdaterStopped)?;
        rx.await.map_err(|_| Error::UpdaterStopped)
    }

    /// Cache the caller's response to a decision, in the background
    ///
    /// Returns `false` when the decision had no context embedding (no chunks,
    /// a cache hit, or forgotten).
    pub fn store_response(&self, decision_id: Uuid, response: impl Into<String>) -> bool {
        let Some(write) = self.inner.ledger.lock().writes.remove(&decision_id) else {
            return false;
        };
        let response = response.into();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut entry = CacheWrite::new(write.embedding, response, write.arm_id);
            if let Some(hash) = write.context_hash {
                entry = entry.with_context_hash(hash);
            }
            if let Err(e) = inner.cache.store(&write.namespace, entry) {
                warn!(decision_id = %decision_id, error = %e, "Cache write failed");
            }
        });
        true
    }

    /// Look up text directly (pre-warming, tests)
    pub async fn cache_lookup(&self, namespace: &str, text: &str) -> Result<CacheLookup> {
        let embedding = self.embed(text).await?;
        self.inner.cache.lookup(namespace, &embedding)
    }

    /// Store text and response directly (pre-warming, tests)
    pub async fn cache_store(
        &self,
        namespace: &str,
        text: &str,
        response: impl Into<String>,
        arm_id: impl Into<String>,
        ttl_secs: Option<i64>,
    ) -> Result<Uuid> {
        let embedding = self.embed(text).await?;
        let mut write = CacheWrite::new(embedding, response, arm_id)
            .with_context_hash(crate::hashing::content_hash(text));
        if let Some(ttl) = ttl_secs {
            write = write.with_ttl_secs(ttl);
        }
        self.inner.cache.store(namespace, write)
    }

    /// Validate and apply a new configuration; nothing changes on failure
    pub fn apply_config(&self, config: Config) -> Result<()> {
        config.validate()?;
        let policies = build_policies(&self.inner.registry, &config, &self.inner.state)?;
        self.inner.experiments.apply(&config.experiments)?;
        self.inner.flags.apply(&config.flags)?;
        self.inner.arms.sync(&config.arms);
        *self.inner.scorer.write() = UtilityScorer::new(config.utility.clone());
        *self.inner.trimmer.write() = ContextTrimmer::new(config.trimmer.clone());
        self.inner.cache.set_config(config.cache.clone());
        *self.inner.policies.write() = policies;
        self.inner.config.replace(config)?;
        Ok(())
    }

    /// Persist the current policy state
    pub async fn save_policy_state(&self) -> Result<usize> {
        let snapshot = self.inner.state.snapshot();
        if let Some(store) = &self.inner.store {
            store.save_policy_snapshot(&snapshot).await?;
        }
        Ok(snapshot.len())
    }

    /// Restore policy state from the store
    pub async fn load_policy_state(&self) -> Result<usize> {
        let Some(store) = &self.inner.store else {
            return Ok(0);
        };
        let snapshot: PolicySnapshot = store.load_policy_snapshot().await?;
        let count = snapshot.len();
        self.inner.state.restore(snapshot);
        info!(count, "Policy state restored");
        Ok(count)
    }

    pub fn config(&self) -> Arc<Config> {
        self.inner.config.current()
    }

    pub fn policy_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.policies.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn arms(&self) -> &ArmRegistry {
        &self.inner.arms
    }

    pub fn flags(&self) -> &FlagController {
        &self.inner.flags
    }

    pub fn experiments(&self) -> &ExperimentHarness {
        &self.inner.experiments
    }

    pub fn cache(&self) -> &SemanticCache {
        &self.inner.cache
    }

    pub fn policy_state(&self) -> &Arc<PolicyStateStore> {
        &self.inner.state
    }

    pub fn regret(&self) -> RegretSummary {
        self.inner.tracker.summary()
    }

    pub fn tracker(&self) -> &RewardTracker {
        &self.inner.tracker
    }

    pub fn pending_rewards(&self) -> usize {
        self.inner.ledger.lock().pending.len()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner
            .metrics
            .set_active_experiments(self.inner.experiments.active_count());
        self.inner.metrics.snapshot()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embedder = self
            .inner
            .embedder
            .as_ref()
            .ok_or_else(|| Error::EmbeddingFailed("no embedder configured".to_string()))?;
        embedder.embed(text).await
    }

    /// Embed and look up the trimmed context; `None` on any cache failure
    async fn lookup_context(
        &self,
        namespace: &str,
        trimmed: &TrimResult,
        deadline: Instant,
    ) -> Option<(CacheLookup, Vec<f32>)> {
        self.inner.embedder.as_ref()?;
        if !self.inner.cache.config().enabled {
            return None;
        }
        let text = trimmed.text();
        let work = async {
            let embedding = self.embed(&text).await?;
            let lookup = self.inner.cache.lookup(namespace, &embedding)?;
            Ok::<_, Error>((lookup, embedding))
        };
        match timeout_at(deadline, work).await {
            Ok(Ok(found)) => Some(found),
            Ok(Err(e)) => {
                warn!(namespace, error = %e, "Cache lookup failed, treating as miss");
                None
            }
            Err(_) => {
                warn!(namespace, "Cache lookup missed the deadline, treating as miss");
                None
            }
        }
    }

    fn cache_decision(
        &self,
        request: DecisionRequest,
        lookup: CacheLookup,
        context_hash: Option<String>,
        started: Instant,
    ) -> Decision {
        let decision = Decision {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            tenant: request.tenant,
            context_features: request.features,
            candidate_arms: request.candidates,
            chosen_arm: lookup.arm_id.unwrap_or_default(),
            policy_used: CACHE_POLICY.to_string(),
            predicted_reward: 0.0,
            predicted_utility: 0.0,
            experiment: None,
            policy_fallback: false,
            fallback_reason: None,
            exploration: false,
            cache_hit: Some(CacheHit {
                response: lookup.response.unwrap_or_default(),
                similarity: lookup.similarity,
            }),
            context_hash,
            truncated_single_chunk: false,
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.inner.metrics.record_decision(
            MetricLabels::new(CACHE_POLICY, None),
            elapsed_ms,
            true,
            false,
        );
        self.persist_decision(&decision);
        debug!(
            decision_id = %decision.id,
            tenant = %decision.tenant,
            similarity = lookup.similarity,
            "Decision answered from cache"
        );
        decision
    }

    fn assign(&self, request: &DecisionRequest) -> Option<Assignment> {
        let key = request.experiment_key.as_deref()?;
        let experiments = &self.inner.experiments;
        let id = match &request.experiment_id {
            Some(id) => id.clone(),
            None => experiments
                .ids()
                .into_iter()
                .find(|id| experiments.status(id).is_ok_and(|s| s.is_active()))?,
        };
        match experiments.assign(&id, key) {
            Ok(assignment) if assignment.is_recorded() => Some(assignment),
            Ok(_) => None,
            Err(e) => {
                warn!(experiment = %id, error = %e, "Experiment assignment failed");
                None
            }
        }
    }

    /// Serving policy and optional shadow policy for a request
    fn select_policies(
        &self,
        config: &Config,
        tenant: &str,
        assignment: Option<&Assignment>,
    ) -> (String, Option<String>) {
        if let Some(assignment) = assignment {
            return (
                assignment.serving_policy().to_string(),
                assignment.shadow_policy().map(str::to_string),
            );
        }
        let neural_ready = self.inner.policies.read().contains_key(NEURAL_UCB);
        if neural_ready && self.inner.flags.is_active(NEURAL_UCB, tenant) {
            return (NEURAL_UCB.to_string(), None);
        }
        let shadow = (neural_ready && self.inner.flags.is_shadowed(NEURAL_UCB))
            .then(|| NEURAL_UCB.to_string());
        (config.routing.default_policy.clone(), shadow)
    }

    async fn propose_within(
        &self,
        name: &str,
        features: &ContextFeatures,
        arm_ids: &[String],
        deadline: Instant,
    ) -> Result<Proposal> {
        let policy = self
            .inner
            .policies
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::PolicyUnavailable(name.to_string()))?;
        let features = features.clone();
        let arm_ids = arm_ids.to_vec();
        let task = tokio::task::spawn_blocking(move || policy.propose(&features, &arm_ids));
        match timeout_at(deadline, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(Error::PolicyUnavailable(format!("{}: {}", name, join))),
            Err(_) => Err(Error::DeadlineExceeded("propose")),
        }
    }

    /// Baseline proposal outside the deadline; the baseline is cheap
    fn baseline_proposal(
        &self,
        name: &str,
        features: &ContextFeatures,
        arm_ids: &[String],
        decision_id: Uuid,
    ) -> Option<Proposal> {
        let policy = self.inner.policies.read().get(name).cloned()?;
        match policy.propose(features, arm_ids) {
            Ok(p) => Some(p),
            Err(e) => {
                error!(decision_id = %decision_id, policy = %name, error = %e, "Baseline policy failed");
                None
            }
        }
    }

    fn choose(&self, ranking: &Ranking, proposal: Option<&Proposal>, arms: &[Arm]) -> (Chosen, bool) {
        if ranking.ranked.is_empty() {
            // nothing ranked: cheapest arm, no prediction
            let arm = arms
                .iter()
                .min_by(|a, b| a.unit_cost.total_cmp(&b.unit_cost).then_with(|| a.id.cmp(&b.id)))
                .map(|a| a.id.clone())
                .unwrap_or_default();
            return (
                Chosen {
                    arm,
                    predicted_reward: 0.0,
                    utility: 0.0,
                },
                false,
            );
        }

        let exploring = proposal.is_some_and(|p| p.exploring) && ranking.ranked.len() > 1;
        let pick = if exploring {
            let index = self.inner.rng.lock().gen_range(0..ranking.ranked.len());
            &ranking.ranked[index]
        } else {
            &ranking.ranked[0]
        };
        (
            Chosen {
                arm: pick.arm.clone(),
                predicted_reward: pick.estimate.mean,
                utility: pick.utility,
            },
            exploring,
        )
    }

    /// Shadow experiments record what both variants predicted
    fn record_predictions(
        &self,
        assignment: Option<&Assignment>,
        chosen: &Chosen,
        shadow: Option<&ShadowChoice>,
        shadow_result: &Result<Proposal>,
    ) {
        let Some(assignment) = assignment else {
            return;
        };
        let experiments = &self.inner.experiments;
        let served_variant = if assignment.applied {
            &assignment.variant
        } else {
            &assignment.control
        };
        if let Err(e) = experiments.record_metric(
            &assignment.experiment_id,
            served_variant,
            METRIC_PREDICTED,
            chosen.predicted_reward,
        ) {
            debug!(error = %e, "Prediction metric dropped");
        }

        let (Some(shadow), Ok(proposal)) = (shadow, shadow_result) else {
            return;
        };
        let Some(variant) = &shadow.variant else {
            return;
        };
        if let Some(estimate) = proposal.get(&shadow.arm) {
            if let Err(e) = experiments.record_metric(
                &assignment.experiment_id,
                variant,
                METRIC_PREDICTED,
                estimate.mean,
            ) {
                debug!(error = %e, "Shadow prediction metric dropped");
            }
        }
    }

    fn persist_decision(&self, decision: &Decision) {
        let Some(store) = self.inner.store.clone() else {
            return;
        };
        let decision = decision.clone();
        tokio::spawn(async move {
            if let Err(e) = store.save_decision(&decision).await {
                warn!(decision_id = %decision.id, error = %e, "Failed to persist decision");
            }
        });
    }
}

#[derive(Debug, Clone)]
struct Chosen {
    arm: String,
    predicted_reward: f64,
    utility: f64,
}

/// Consume rewards in arrival order
async fn run_updater(inner: Arc<Inner>, mut rx: mpsc::Receiver<UpdaterMsg>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            UpdaterMsg::Reward {
                pending,
                observation,
            } => apply_reward(&inner, pending, observation).await,
            UpdaterMsg::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Reward updater stopped");
}

async fn apply_reward(inner: &Inner, pending: PendingDecision, observation: RewardObservation) {
    let id = observation.decision_id;
    let reward = observation.reward;
    let baseline = inner.config.current().routing.baseline_policy.clone();

    let mut names = vec![pending.policy_used.clone(), baseline];
    if let Some(shadow) = &pending.shadow {
        names.push(shadow.policy.clone());
    }
    let mut seen = HashSet::new();
    names.retain(|n| seen.insert(n.clone()));

    let policies: Vec<Arc<dyn BanditPolicy>> = {
        let map = inner.policies.read();
        names.iter().filter_map(|n| map.get(n).cloned()).collect()
    };
    for policy in policies {
        if let Err(e) = policy.update(id, &pending.chosen_arm, &pending.features, reward) {
            error!(
                decision_id = %id,
                policy = %policy.name(),
                error = %e,
                "Policy update failed; state unchanged"
            );
        }
    }

    let record = inner.tracker.record(
        id,
        &pending.policy_used,
        &pending.chosen_arm,
        &pending.candidates,
        pending.features.as_slice(),
        reward,
    );
    inner
        .arms
        .record_outcome(&pending.chosen_arm, observation.cost, observation.latency_ms);
    inner
        .metrics
        .set_cumulative_regret(inner.tracker.summary().cumulative_regret);
    inner.metrics.record_reward(
        MetricLabels::new(
            &pending.policy_used,
            pending.experiment.as_ref().map(|t| t.variant.as_str()),
        ),
        reward,
    );

    if let Some(tag) = &pending.experiment {
        let mut variants = Vec::new();
        if tag.applied {
            variants.push(tag.variant.clone());
        } else {
            if let Some(control) = &pending.control_variant {
                variants.push(control.clone());
            }
            // replay: the variant would have picked the same arm
            if let Some(shadow) = &pending.shadow {
                if shadow.variant.as_deref() == Some(tag.variant.as_str())
                    && shadow.arm == pending.chosen_arm
                {
                    variants.push(tag.variant.clone());
                }
            }
        }
        for variant in variants {
            for (metric, value) in [
                (METRIC_REWARD, reward),
                (METRIC_COST, observation.cost),
                (METRIC_LATENCY, observation.latency_ms),
            ] {
                if let Err(e) = inner
                    .experiments
                    .record_metric(&tag.experiment_id, &variant, metric, value)
                {
                    warn!(decision_id = %id, error = %e, "Experiment metric dropped");
                }
            }
        }
    }

    if let Some(store) = &inner.store {
        if let Err(e) = store.save_reward(&observation).await {
            warn!(decision_id = %id, error = %e, "Failed to persist reward");
        }
    }

    debug!(
        decision_id = %id,
        arm = %pending.chosen_arm,
        policy = %pending.policy_used,
        reward,
        regret = record.regret,
        "Reward applied"
    );
}
