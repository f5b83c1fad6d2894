//! Adaptive model routing
//!
//! The key components are:
//!
//! - **Policies**: contextual bandits behind one [`BanditPolicy`] trait,
//!   built by name from a [`PolicyRegistry`].
//!
//! - **Utility scorer**: turns reward estimates into cost- and latency-aware
//!   utilities and enforces the quality floor.
//!
//! - **Reward tracker**: reward log, running regret and per-arm statistics.
//!
//! - **Decision store**: SQLite persistence for decisions, rewards and
//!   policy state.
//!
//! - **Decision service**: the composition root tying the above to the
//!   semantic cache, context trimmer, flags and experiments.
//!
//! ## Example
//!
//! ```rust,ignore
//! use switchyard_core::routing::{DecisionRequest, DecisionService};
//!
//! let service = DecisionService::builder(config).build()?;
//! let decision = service
//!     .decide(DecisionRequest::new(features, vec!["fast".into(), "smart".into()], "acme"))
//!     .await?;
//!
//! // invoke decision.chosen_arm ...
//!
//! service.report_reward(decision.id, 1.0, cost, latency_ms).await?;
//! ```

pub mod policy;
mod service;
mod store;
mod tracker;
pub mod types;
pub mod utility;

pub use policy::{
    BanditPolicy, PolicyRegistry, PolicySettings, PolicySnapshot, PolicyStateStore, Proposal,
    RewardEstimate,
};
pub use service::{CACHE_POLICY, DecisionRequest, DecisionService, DecisionServiceBuilder};
pub use store::{CREATE_DECISION_TABLES_SQL, DecisionStore, MemoryStore, SqliteStore};
pub use tracker::{ArmRewardStats, RegretSummary, RewardRecord, RewardTracker};
pub use types::{
    Arm, ArmConfig, ArmRegistry, CacheHit, ContextFeatures, Decision, ExperimentTag, FEATURE_DIM,
    LatencyWindow, RequestSignals, RewardAck, RewardObservation, TaskType,
};
pub use utility::{Ranking, ScoredArm, UtilityScorer, UtilityWeights};
