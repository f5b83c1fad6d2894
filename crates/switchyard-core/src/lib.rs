//! Switchyard Core Library
//!
//! This crate provides the adaptive routing and experimentation core:
//! - Contextual bandit policies (epsilon-greedy, LinTS, bootstrapped UCB, neural UCB)
//! - Cost- and latency-aware utility ranking with a quality floor
//! - Semantic response cache with freshness semantics
//! - Context trimming to a token budget
//! - A/B experiments with sequential testing and staged rollout
//! - Feature flag rollout controller
//! - Decision service with idempotent asynchronous reward reporting

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod experiment;
pub mod flags;
pub mod hashing;
pub mod metrics;
pub mod routing;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::{Embedder, HashingEmbedder, SemanticCache};
    pub use crate::config::Config;
    pub use crate::context::ContextChunk;
    pub use crate::error::{Error, Result};
    pub use crate::experiment::{ExperimentConfig, ExperimentHarness, Recommendation};
    pub use crate::flags::{ExperimentStatus, FlagController, RolloutStage};
    pub use crate::routing::{
        ContextFeatures, Decision, DecisionRequest, DecisionService, RequestSignals, RewardAck,
        TaskType,
    };
}
