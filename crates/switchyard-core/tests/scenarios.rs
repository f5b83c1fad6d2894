//! Switchyard Core end-to-end scenarios

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use switchyard_core::cache::HashingEmbedder;
use switchyard_core::config::Config;
use switchyard_core::context::ContextChunk;
use switchyard_core::experiment::{
    ExperimentConfig, ExperimentHarness, METRIC_COST, METRIC_LATENCY, METRIC_PREDICTED,
    METRIC_REWARD,
};
use switchyard_core::flags::ExperimentStatus;
use switchyard_core::routing::policy::{
    ArmState, BanditPolicy, BOOTSTRAP_UCB, EPSILON_GREEDY, LIN_TS, LinTsConfig, LinearThompson,
    StateKey,
};
use switchyard_core::routing::{
    ArmConfig, ContextFeatures, DecisionRequest, DecisionService, PolicyStateStore, RewardAck,
    RewardTracker,
};

fn arm(id: &str) -> ArmConfig {
    ArmConfig {
        id: id.to_string(),
        unit_cost: 1.0,
        expected_latency_ms: 100.0,
        capabilities: Vec::new(),
    }
}

fn config(arms: &[&str]) -> Config {
    let mut config = Config::default();
    config.arms = arms.iter().map(|id| arm(id)).collect();
    config.policies.seed = Some(7);
    config.routing.decision_budget_ms = 1000;
    config
}

fn request(arms: &[&str]) -> DecisionRequest {
    DecisionRequest::new(
        ContextFeatures::bias_only(),
        arms.iter().map(|a| a.to_string()).collect(),
        "tenant-a",
    )
}

const BERNOULLI_ARMS: [(&str, f64); 3] = [("a", 0.3), ("b", 0.5), ("c", 0.8)];

/// Average pseudo-regret of `policy` served through the full decide/report loop
async fn service_regret(policy: &str, seed: u64, steps: usize) -> f64 {
    let arms: Vec<&str> = BERNOULLI_ARMS.iter().map(|(id, _)| *id).collect();
    let best = BERNOULLI_ARMS.iter().map(|(_, p)| *p).fold(0.0, f64::max);
    let mut cfg = config(&arms);
    cfg.routing.default_policy = policy.to_string();
    cfg.policies.seed = Some(seed);
    let service = DecisionService::builder(cfg).build().unwrap();
    let mut env = StdRng::seed_from_u64(1000 + seed);

    let mut pseudo_regret = 0.0;
    for _ in 0..steps {
        let decision = service.decide(request(&arms)).await.unwrap();
        assert!(!decision.policy_fallback, "{:?}", decision.fallback_reason);
        let p = BERNOULLI_ARMS
            .iter()
            .find(|(id, _)| *id == decision.chosen_arm.as_str())
            .unwrap()
            .1;
        pseudo_regret += best - p;
        let reward = if env.gen_bool(p) { 1.0 } else { 0.0 };
        service.report_reward(decision.id, reward, 1.0, 100.0).await.unwrap();
        service.flush().await.unwrap();
    }
    assert_eq!(service.regret().steps, steps as u64);
    pseudo_regret / steps as f64
}

#[tokio::test]
async fn test_lin_ts_service_converges_past_quality_floor() {
    // untried arms start at mean 0, under the default floor
    for seed in 0..=5 {
        let average = service_regret(LIN_TS, seed, 2000).await;
        assert!(average < 0.08, "seed {}: average pseudo-regret {}", seed, average);
    }
}

#[tokio::test]
async fn test_bootstrap_ucb_service_converges() {
    for seed in 0..=5 {
        let average = service_regret(BOOTSTRAP_UCB, seed, 2000).await;
        assert!(average < 0.08, "seed {}: average pseudo-regret {}", seed, average);
    }
}

#[tokio::test]
async fn test_arm_below_quality_floor_never_chosen() {
    let arms = ["good", "fine", "poor"];
    let mut cfg = config(&arms);
    cfg.routing.default_policy = EPSILON_GREEDY.to_string();
    cfg.policies.epsilon_greedy.epsilon = 0.3;
    let service = DecisionService::builder(cfg).build().unwrap();

    let state = service.policy_state();
    for (id, mean) in [("good", 0.6), ("fine", 0.5), ("poor", 0.02)] {
        state.put(
            StateKey::new(EPSILON_GREEDY, id),
            ArmState::Mean { count: 50, mean },
        );
    }

    let mut explored = 0;
    for _ in 0..1000 {
        let decision = service.decide(request(&arms)).await.unwrap();
        assert_ne!(decision.chosen_arm, "poor");
        if decision.exploration {
            explored += 1;
        }
    }
    assert!(explored > 0);
}

#[tokio::test]
async fn test_duplicate_reward_applied_once() {
    let arms = ["fast", "smart"];
    let mut cfg = config(&arms);
    cfg.routing.default_policy = EPSILON_GREEDY.to_string();
    let service = DecisionService::builder(cfg).build().unwrap();

    let decision = service.decide(request(&arms)).await.unwrap();
    assert_eq!(
        service.report_reward(decision.id, 1.0, 0.0, 50.0).await.unwrap(),
        RewardAck::Ack
    );
    assert_eq!(
        service.report_reward(decision.id, 0.0, 0.0, 50.0).await.unwrap(),
        RewardAck::DuplicateIgnored
    );
    service.flush().await.unwrap();

    let key = StateKey::new(EPSILON_GREEDY, &decision.chosen_arm);
    match service.policy_state().get(&key) {
        Some(ArmState::Mean { count, mean }) => {
            assert_eq!(count, 1);
            assert_eq!(mean, 1.0);
        }
        other => panic!("unexpected state {:?}", other),
    }
    assert_eq!(service.regret().steps, 1);
    assert_eq!(service.tracker().arm_stats(&decision.chosen_arm).unwrap().count, 1);
}

#[tokio::test]
async fn test_concurrent_reports_ack_once() {
    let arms = ["fast", "smart"];
    let service = Arc::new(DecisionService::builder(config(&arms)).build().unwrap());
    let decision = service.decide(request(&arms)).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let service = service.clone();
        let id = decision.id;
        handles.push(tokio::spawn(async move {
            service.report_reward(id, 1.0, 0.0, 10.0).await.unwrap()
        }));
    }
    let mut acks = 0;
    for handle in handles {
        if handle.await.unwrap() == RewardAck::Ack {
            acks += 1;
        }
    }
    assert_eq!(acks, 1);
    service.flush().await.unwrap();
    assert_eq!(service.regret().steps, 1);
}

#[tokio::test]
async fn test_unknown_decision_reported() {
    let service = DecisionService::builder(config(&["fast"])).build().unwrap();
    assert_eq!(
        service.report_reward(Uuid::new_v4(), 1.0, 0.0, 10.0).await.unwrap(),
        RewardAck::UnknownDecision
    );
    service.flush().await.unwrap();
    assert_eq!(service.regret().steps, 0);
}

#[tokio::test]
async fn test_zero_ttl_never_hits() {
    let arms = ["fast", "smart"];
    let service = DecisionService::builder(config(&arms))
        .with_embedder(Arc::new(HashingEmbedder::default()))
        .build()
        .unwrap();
    let text = "summarize the quarterly report";

    service
        .cache_store("tenant-a", text, "stale answer", "fast", Some(0))
        .await
        .unwrap();
    let lookup = service.cache_lookup("tenant-a", text).await.unwrap();
    assert!(!lookup.hit);

    let decision = service
        .decide(request(&arms).with_chunks(vec![ContextChunk::new("q", text)]))
        .await
        .unwrap();
    assert!(decision.cache_hit.is_none());
    assert_ne!(decision.policy_used, "cache");

    service
        .cache_store("tenant-a", text, "fresh answer", "smart", Some(3600))
        .await
        .unwrap();
    let lookup = service.cache_lookup("tenant-a", text).await.unwrap();
    assert!(lookup.hit);
    assert_eq!(lookup.response.as_deref(), Some("fresh answer"));
}

#[tokio::test]
async fn test_shadow_experiment_serves_control() {
    let arms = ["fast", "smart"];
    let mut cfg = config(&arms);
    cfg.experiments = vec![ExperimentConfig::new("router-v2", EPSILON_GREEDY, "lin_ts", 0.05)
        .with_status(ExperimentStatus::Shadow)];
    let service = DecisionService::builder(cfg).build().unwrap();

    let mut treatment = 0;
    for i in 0..1000 {
        let decision = service
            .decide(request(&arms).with_experiment_key(format!("user-{}", i)))
            .await
            .unwrap();
        assert_eq!(decision.policy_used, EPSILON_GREEDY);
        let tag = decision.experiment.clone().expect("experiment tag");
        assert_eq!(tag.experiment_id, "router-v2");
        if tag.variant == "treatment" {
            assert!(!tag.applied);
            treatment += 1;
        }
        service.report_reward(decision.id, 1.0, 0.01, 80.0).await.unwrap();
    }
    service.flush().await.unwrap();
    assert!(treatment > 0 && treatment < 1000);

    let metrics = service.experiments().variant_metrics("router-v2").unwrap();
    let count = |variant: &str, metric: &str| {
        metrics
            .iter()
            .find(|m| m.variant == variant && m.metric == metric)
            .map(|m| m.count)
            .unwrap_or(0)
    };
    assert_eq!(count("control", METRIC_PREDICTED), 1000);
    assert!(count("treatment", METRIC_PREDICTED) > 0);
    assert_eq!(count("control", METRIC_REWARD), 1000);
    assert_eq!(count("control", METRIC_COST), 1000);
    assert_eq!(count("control", METRIC_LATENCY), 1000);
    assert_eq!(service.experiments().status("router-v2").unwrap(), ExperimentStatus::Shadow);
}

#[test]
fn test_lin_ts_converges_on_bernoulli_arms() {
    let probabilities = [("a", 0.8), ("b", 0.5), ("c", 0.3)];
    let arms: Vec<String> = probabilities.iter().map(|(id, _)| id.to_string()).collect();
    let policy = LinearThompson::new(LinTsConfig::default(), Arc::new(PolicyStateStore::new()))
        .with_seed(42);
    let tracker = RewardTracker::default();
    let features = ContextFeatures::new(vec![1.0]).unwrap();
    let mut env = StdRng::seed_from_u64(1234);

    let steps = 10_000;
    let mut pseudo_regret = 0.0;
    let mut last_cumulative = 0.0;
    for _ in 0..steps {
        let proposal = policy.propose(&features, &arms).unwrap();
        let (arm, _) = proposal
            .estimates
            .iter()
            .max_by(|a, b| a.1.score.total_cmp(&b.1.score))
            .unwrap();
        let p = probabilities.iter().find(|(id, _)| *id == arm.as_str()).unwrap().1;
        pseudo_regret += 0.8 - p;

        let reward = if env.gen_bool(p) { 1.0 } else { 0.0 };
        let id = Uuid::new_v4();
        policy.update(id, arm, &features, reward).unwrap();
        tracker.record(id, policy.name(), arm, &arms, features.as_slice(), reward);

        let cumulative = tracker.summary().cumulative_regret;
        assert!(cumulative >= last_cumulative);
        last_cumulative = cumulative;
    }

    let average = pseudo_regret / steps as f64;
    assert!(average < 0.05, "average pseudo-regret {}", average);
}

#[test]
fn test_assignment_stable_across_instances() {
    let configs = vec![ExperimentConfig::new("exp", EPSILON_GREEDY, "lin_ts", 0.05)
        .with_status(ExperimentStatus::Full)];
    let first = ExperimentHarness::from_configs(&configs).unwrap();
    let second = ExperimentHarness::from_configs(&configs).unwrap();

    let mut treatment = 0;
    for i in 0..500 {
        let key = format!("user-{}", i);
        let a = first.assign("exp", &key).unwrap();
        let b = second.assign("exp", &key).unwrap();
        assert_eq!(a.variant, b.variant);
        if a.variant == "treatment" {
            treatment += 1;
        }
    }
    // equal weights split roughly in half
    assert!((200..300).contains(&treatment), "treatment = {}", treatment);
}
