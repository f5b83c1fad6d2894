//! Neural UCB (experimental)
//!
//! Wraps an external [`NeuralScorer`] returning `(mean, uncertainty)` per arm;
//! the score is `mean + beta * uncertainty`. Rewards are forwarded to a
//! background trainer over a bounded channel and dropped when it is full, so
//! `update` never waits on training.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{BanditPolicy, Proposal, RewardEstimate, NEURAL_UCB};
use crate::error::{Error, Result};
use crate::routing::types::ContextFeatures;

/// One reward forwarded to the trainer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingExample {
    pub decision_id: Uuid,
    pub arm: String,
    pub features: Vec<f64>,
    pub reward: f64,
}

/// External model behind the neural policy
#[async_trait]
pub trait NeuralScorer: Send + Sync {
    /// Predicted `(mean, uncertainty)` for an arm; called on the blocking pool
    fn score(&self, arm: &str, features: &[f64]) -> Result<(f64, f64)>;

    /// Fine-tune on a batch of observed rewards
    async fn train(&self, batch: Vec<TrainingExample>) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NeuralUcbConfig {
    pub beta: f64,
    /// Capacity of the training queue
    pub queue_capacity: usize,
    /// Examples per `train` call
    pub batch_size: usize,
}

impl Default for NeuralUcbConfig {
    fn default() -> Self {
        Self {
            beta: 1.0,
            queue_capacity: 1024,
            batch_size: 32,
        }
    }
}

impl NeuralUcbConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.beta.is_finite() || self.beta < 0.0 {
            return Err(Error::Config(format!(
                "policies.neural_ucb.beta must be non-negative, got {}",
                self.beta
            )));
        }
        if self.queue_capacity == 0 || self.batch_size == 0 {
            return Err(Error::Config(
                "policies.neural_ucb queue_capacity and batch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct NeuralUcb {
    config: NeuralUcbConfig,
    scorer: Arc<dyn NeuralScorer>,
    training: Option<mpsc::Sender<TrainingExample>>,
}

impl NeuralUcb {
    /// Build the policy; the trainer task starts only inside a tokio runtime
    pub fn new(config: NeuralUcbConfig, scorer: Arc<dyn NeuralScorer>) -> Self {
        let training = match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let (tx, rx) = mpsc::channel(config.queue_capacity);
                handle.spawn(run_trainer(Arc::clone(&scorer), rx, config.batch_size));
                Some(tx)
            }
            Err(_) => {
                warn!("No tokio runtime; neural_ucb training disabled");
                None
            }
        };
        Self {
            config,
            scorer,
            training,
        }
    }
}

async fn run_trainer(
    scorer: Arc<dyn NeuralScorer>,
    mut rx: mpsc::Receiver<TrainingExample>,
    batch_size: usize,
) {
    let mut batch = Vec::with_capacity(batch_size);
    while let Some(example) = rx.recv().await {
        batch.push(example);
        while batch.len() < batch_size {
            match rx.try_recv() {
                Ok(example) => batch.push(example),
                Err(_) => break,
            }
        }
        let size = batch.len();
        if let Err(e) = scorer.train(std::mem::take(&mut batch)).await {
            warn!(error = %e, size, "neural_ucb training batch failed");
        } else {
            debug!(size, "neural_ucb training batch applied");
        }
    }
    debug!("neural_ucb trainer stopped");
}

impl BanditPolicy for NeuralUcb {
    fn name(&self) -> &str {
        NEURAL_UCB
    }

    fn propose(&self, features: &ContextFeatures, arms: &[String]) -> Result<Proposal> {
        let estimates = arms
            .iter()
            .map(|arm| {
                let (mean, uncertainty) = self.scorer.score(arm, features.as_slice())?;
                if !mean.is_finite() || !uncertainty.is_finite() || uncertainty < 0.0 {
                    return Err(Error::numerical(
                        NEURAL_UCB,
                        format!("scorer returned ({}, {}) for '{}'", mean, uncertainty, arm),
                    ));
                }
                Ok((
                    arm.clone(),
                    RewardEstimate {
                        mean,
                        score: mean + self.config.beta * uncertainty,
                        uncertainty,
                        observations: 0,
                    },
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Proposal {
            policy: NEURAL_UCB.to_string(),
            estimates,
            exploring: false,
        })
    }

    fn update(
        &self,
        decision_id: Uuid,
        arm: &str,
        features: &ContextFeatures,
        reward: f64,
    ) -> Result<()> {
        let Some(tx) = &self.training else {
            return Ok(());
        };
        let example = TrainingExample {
            decision_id,
            arm: arm.to_string(),
            features: features.as_slice().to_vec(),
            reward,
        };
        if let Err(e) = tx.try_send(example) {
            debug!(decision_id = %decision_id, error = %e, "neural_ucb training example dropped");
        }
        Ok(())
    }
}
