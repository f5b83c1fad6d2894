//! Linear Thompson Sampling
//!
//! Each arm keeps a precision matrix `A` (initialised to `lambda * I`) and a
//! response vector `b`. A proposal samples `w ~ N(A^-1 b, alpha^2 A^-1)` using
//! the Cholesky factor `A = L L^T`: `w = mu + alpha * L^-T z` with
//! `z ~ N(0, I)`, then scores `w . x`.
//!
//! An update that leaves `A` non-finite or not positive definite is rejected
//! and the previous state kept.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use parking_lot::Mutex;
use rand::prelude::*;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use super::state::{ArmState, PolicyStateStore, StateKey};
use super::{BanditPolicy, Proposal, RewardEstimate, LIN_TS};
use crate::error::{Error, Result};
use crate::routing::types::ContextFeatures;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinTsConfig {
    /// Exploration scale
    pub alpha: f64,
    /// Ridge prior on `A`
    pub lambda: f64,
}

impl Default for LinTsConfig {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            lambda: 1.0,
        }
    }
}

impl LinTsConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.alpha.is_finite() || self.alpha < 0.0 {
            return Err(Error::Config(format!(
                "policies.lin_ts.alpha must be non-negative, got {}",
                self.alpha
            )));
        }
        if !self.lambda.is_finite() || self.lambda <= 0.0 {
            return Err(Error::Config(format!(
                "policies.lin_ts.lambda must be positive, got {}",
                self.lambda
            )));
        }
        Ok(())
    }
}

pub struct LinearThompson {
    config: LinTsConfig,
    state: Arc<PolicyStateStore>,
    rng: Mutex<StdRng>,
}

impl LinearThompson {
    pub fn new(config: LinTsConfig, state: Arc<PolicyStateStore>) -> Self {
        Self {
            config,
            state,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    fn key(arm: &str) -> StateKey {
        StateKey::new(LIN_TS, arm)
    }

    fn estimate(&self, arm: &str, x: &DVector<f64>) -> Result<RewardEstimate> {
        let d = x.len();
        let state = self
            .state
            .read_or(&Self::key(arm), || ArmState::linear(d, self.config.lambda));
        let ArmState::Linear { dim, a, b, count } = state else {
            return Err(Error::numerical(LIN_TS, format!("arm '{}' has non-linear state", arm)));
        };
        if dim != d {
            return Err(Error::numerical(
                LIN_TS,
                format!("arm '{}' has dimension {}, features have {}", arm, dim, d),
            ));
        }

        let a = DMatrix::from_column_slice(d, d, &a);
        let b = DVector::from_column_slice(&b);
        let chol = a.cholesky().ok_or_else(|| {
            Error::numerical(LIN_TS, format!("precision matrix for '{}' is not positive definite", arm))
        })?;

        let mu = chol.solve(&b);
        let z = {
            let mut rng = self.rng.lock();
            DVector::from_iterator(d, (0..d).map(|_| rng.sample::<f64, _>(StandardNormal)))
        };
        let l = chol.l();
        let noise = l.transpose().solve_upper_triangular(&z).ok_or_else(|| {
            Error::numerical(LIN_TS, format!("triangular solve failed for '{}'", arm))
        })?;
        let w = &mu + noise * self.config.alpha;

        // sqrt(x^T A^-1 x) = ||L^-1 x||
        let spread = l
            .solve_lower_triangular(x)
            .map(|v| v.norm())
            .ok_or_else(|| Error::numerical(LIN_TS, format!("triangular solve failed for '{}'", arm)))?;

        let estimate = RewardEstimate {
            mean: mu.dot(x),
            score: w.dot(x),
            uncertainty: self.config.alpha * spread,
            observations: count,
        };
        if !(estimate.mean.is_finite() && estimate.score.is_finite()) {
            return Err(Error::numerical(LIN_TS, format!("non-finite estimate for '{}'", arm)));
        }
        Ok(estimate)
    }
}

impl BanditPolicy for LinearThompson {
    fn name(&self) -> &str {
        LIN_TS
    }

    fn propose(&self, features: &ContextFeatures, arms: &[String]) -> Result<Proposal> {
        let x = DVector::from_column_slice(features.as_slice());
        let estimates = arms
            .iter()
            .map(|arm| Ok((arm.clone(), self.estimate(arm, &x)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Proposal {
            policy: LIN_TS.to_string(),
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
        let x = features.as_slice();
        let d = x.len();
        let result = self.state.update(
            &Self::key(arm),
            || ArmState::linear(d, self.config.lambda),
            |state| {
                let ArmState::Linear { dim, a, b, count } = state else {
                    return Err(Error::numerical(LIN_TS, "unexpected state kind"));
                };
                if *dim != d {
                    return Err(Error::numerical(
                        LIN_TS,
                        format!("dimension mismatch: state {}, features {}", dim, d),
                    ));
                }
                for j in 0..d {
                    for i in 0..d {
                        a[j * d + i] += x[i] * x[j];
                    }
                    b[j] += reward * x[j];
                }
                *count += 1;

                if DMatrix::from_column_slice(d, d, a.as_slice()).cholesky().is_none() {
                    return Err(Error::numerical(LIN_TS, "precision matrix lost positive definiteness"));
                }
                Ok(())
            },
        );
        if let Err(ref e) = result {
            warn!(decision_id = %decision_id, arm = %arm, error = %e, "LinTS update rejected");
        }
        result
    }
}
