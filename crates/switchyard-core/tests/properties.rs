//! Property tests for trimming, ranking, allocation and regret

use proptest::prelude::*;
use uuid::Uuid;

use switchyard_core::context::{ContextChunk, ContextTrimmer, salience_order};
use switchyard_core::experiment::{ExperimentConfig, ExperimentHarness};
use switchyard_core::flags::ExperimentStatus;
use switchyard_core::hashing::{BUCKETS, stable_bucket};
use switchyard_core::routing::policy::RewardEstimate;
use switchyard_core::routing::{Arm, Proposal, RewardTracker, UtilityScorer, UtilityWeights};

fn chunk_strategy() -> impl Strategy<Value = (usize, f64, u32)> {
    (1usize..400, 0.0f64..1.0, 0u32..50)
}

fn chunks_strategy() -> impl Strategy<Value = Vec<ContextChunk>> {
    prop::collection::vec(chunk_strategy(), 1..30).prop_map(|specs| {
        specs
            .into_iter()
            .enumerate()
            .map(|(i, (tokens, salience, recency))| {
                ContextChunk::new(format!("c{}", i), format!("chunk {}", i))
                    .with_tokens(tokens)
                    .with_salience(salience)
                    .with_recency(recency)
            })
            .collect()
    })
}

fn estimates_strategy() -> impl Strategy<Value = Vec<(f64, f64, f64)>> {
    // (mean, unit cost, latency)
    prop::collection::vec((0.0f64..1.0, 0.001f64..10.0, 1.0f64..5000.0), 1..8)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn trimmed_context_fits_budget(chunks in chunks_strategy(), budget in 1usize..2000) {
        let trimmer = ContextTrimmer::default();
        let result = trimmer.trim(&chunks, budget);

        prop_assert!(!result.chunks.is_empty());
        if !result.truncated_single_chunk {
            prop_assert!(result.total_tokens <= budget);
        } else {
            prop_assert_eq!(result.chunks.len(), 1);
        }
        prop_assert_eq!(result.chunks.len() + result.dropped.len(), chunks.len());

        let mut sorted = chunks.clone();
        sorted.sort_by(salience_order);
        prop_assert_eq!(&result.chunks[0].id, &sorted[0].id);
    }

    #[test]
    fn floor_violators_never_top_ranked(values in estimates_strategy(), floor in 0.0f64..1.0) {
        let scorer = UtilityScorer::new(UtilityWeights {
            quality_floor: floor,
            ..UtilityWeights::default()
        });
        let arms: Vec<Arm> = values
            .iter()
            .enumerate()
            .map(|(i, (_, cost, latency))| {
                Arm::new(format!("arm-{}", i))
                    .with_unit_cost(*cost)
                    .with_expected_latency(*latency)
            })
            .collect();
        let proposal = Proposal {
            policy: "prop".to_string(),
            estimates: values
                .iter()
                .enumerate()
                .map(|(i, (mean, _, _))| {
                    (
                        format!("arm-{}", i),
                        RewardEstimate {
                            mean: *mean,
                            score: *mean,
                            uncertainty: 0.0,
                            observations: 10,
                        },
                    )
                })
                .collect(),
            exploring: false,
        };

        let ranking = scorer.rank(&proposal, &arms);
        let any_above = values.iter().any(|(mean, _, _)| *mean >= floor);
        prop_assert_eq!(ranking.floor_unmet, !any_above);
        if any_above {
            for scored in &ranking.ranked {
                prop_assert!(scored.estimate.mean >= floor);
            }
        }
        prop_assert!(ranking.top().is_some());
    }

    #[test]
    fn assignment_is_deterministic(key in "[a-z0-9-]{1,24}") {
        let configs = vec![ExperimentConfig::new("exp", "epsilon_greedy", "lin_ts", 0.05)
            .with_status(ExperimentStatus::Canary)];
        let harness = ExperimentHarness::from_configs(&configs).unwrap();
        let again = ExperimentHarness::from_configs(&configs).unwrap();

        let first = harness.assign("exp", &key).unwrap();
        prop_assert_eq!(&first, &harness.assign("exp", &key).unwrap());
        prop_assert_eq!(&first, &again.assign("exp", &key).unwrap());
    }

    #[test]
    fn bucket_in_range(parts in prop::collection::vec("[a-z]{0,8}", 1..4)) {
        let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
        prop_assert!(stable_bucket(&parts, BUCKETS) < BUCKETS);
    }

    #[test]
    fn cumulative_regret_never_decreases(
        steps in prop::collection::vec((0usize..3, 0.0f64..1.0), 1..200)
    ) {
        let arms = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let tracker = RewardTracker::default();
        let mut last = tracker.summary();
        for (arm, reward) in steps {
            let record = tracker.record(Uuid::new_v4(), "prop", &arms[arm], &arms, &[1.0], reward);
            prop_assert!(record.regret >= 0.0);
            prop_assert!(record.pseudo_regret >= 0.0);
            let summary = tracker.summary();
            prop_assert!(summary.cumulative_regret >= last.cumulative_regret);
            prop_assert!(summary.cumulative_pseudo_regret >= last.cumulative_pseudo_regret);
            last = summary;
        }
    }
}
