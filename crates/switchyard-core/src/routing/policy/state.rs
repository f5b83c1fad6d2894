//! Per-(policy, arm) sufficient statistics
//!
//! State lives in an injected [`PolicyStateStore`] rather than inside the
//! policies themselves. Each key owns its own lock so updates to unrelated
//! arms never serialize against each other; `propose` works on clones.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Identifies one arm's state under one policy
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateKey {
    pub policy: String,
    pub arm: String,
}

impl StateKey {
    pub fn new(policy: impl Into<String>, arm: impl Into<String>) -> Self {
        Self {
            policy: policy.into(),
            arm: arm.into(),
        }
    }
}

/// One bootstrap head: Poisson-weighted reward total
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BootstrapHead {
    pub weight: f64,
    pub sum: f64,
}

impl BootstrapHead {
    pub fn mean(&self) -> Option<f64> {
        (self.weight > 0.0).then(|| self.sum / self.weight)
    }
}

/// Sufficient statistics for one arm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArmState {
    /// Running mean (epsilon-greedy)
    Mean { count: u64, mean: f64 },
    /// Precision matrix `a` (column-major, `dim * dim`) and response vector `b`
    Linear {
        dim: usize,
        a: Vec<f64>,
        b: Vec<f64>,
        count: u64,
    },
    Bootstrap { heads: Vec<BootstrapHead>, count: u64 },
}

impl ArmState {
    pub fn mean() -> Self {
        Self::Mean { count: 0, mean: 0.0 }
    }

    /// `A = lambda * I`, `b = 0`
    pub fn linear(dim: usize, lambda: f64) -> Self {
        let mut a = vec![0.0; dim * dim];
        for i in 0..dim {
            a[i * dim + i] = lambda;
        }
        Self::Linear {
            dim,
            a,
            b: vec![0.0; dim],
            count: 0,
        }
    }

    pub fn bootstrap(heads: usize) -> Self {
        Self::Bootstrap {
            heads: vec![BootstrapHead::default(); heads],
            count: 0,
        }
    }

    /// Number of rewards folded into this state
    pub fn count(&self) -> u64 {
        match self {
            Self::Mean { count, .. } | Self::Linear { count, .. } | Self::Bootstrap { count, .. } => {
                *count
            }
        }
    }

    /// Every stored number is finite
    pub fn is_finite(&self) -> bool {
        match self {
            Self::Mean { mean, .. } => mean.is_finite(),
            Self::Linear { a, b, .. } => a.iter().chain(b.iter()).all(|v| v.is_finite()),
            Self::Bootstrap { heads, .. } => {
                heads.iter().all(|h| h.weight.is_finite() && h.sum.is_finite())
            }
        }
    }
}

/// Serializable copy of every key's state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub entries: Vec<(StateKey, ArmState)>,
}

impl PolicySnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Store of policy state with a lock per (policy, arm)
#[derive(Debug, Default)]
pub struct PolicyStateStore {
    states: RwLock<HashMap<StateKey, Arc<Mutex<ArmState>>>>,
}

impl PolicyStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &StateKey, init: impl FnOnce() -> ArmState) -> Arc<Mutex<ArmState>> {
        if let Some(slot) = self.states.read().get(key) {
            return Arc::clone(slot);
        }
        let mut states = self.states.write();
        Arc::clone(
            states
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(init()))),
        )
    }

    /// Clone of the current state, or `init()` when the key has never been touched
    ///
    /// Reading does not insert the key.
    pub fn read_or(&self, key: &StateKey, init: impl FnOnce() -> ArmState) -> ArmState {
        let slot = self.states.read().get(key).map(Arc::clone);
        match slot {
            Some(slot) => slot.lock().clone(),
            None => init(),
        }
    }

    pub fn get(&self, key: &StateKey) -> Option<ArmState> {
        let slot = self.states.read().get(key).map(Arc::clone);
        slot.map(|s| s.lock().clone())
    }

    /// Apply `f` to a copy of the key's state and commit it only if `f`
    /// succeeds and the result is finite
    pub fn update<F>(&self, key: &StateKey, init: impl FnOnce() -> ArmState, f: F) -> Result<()>
    where
        F: FnOnce(&mut ArmState) -> Result<()>,
    {
        let slot = self.slot(key, init);
        let mut guard = slot.lock();
        let mut next = guard.clone();
        f(&mut next)?;
        if !next.is_finite() {
            return Err(crate::error::Error::numerical(
                key.policy.clone(),
                format!("update for arm '{}' produced non-finite state", key.arm),
            ));
        }
        *guard = next;
        Ok(())
    }

    /// Overwrite a key's state
    pub fn put(&self, key: StateKey, state: ArmState) {
        let slot = self.slot(&key, || state.clone());
        *slot.lock() = state;
    }

    pub fn keys(&self) -> Vec<StateKey> {
        let mut keys: Vec<StateKey> = self.states.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn snapshot(&self) -> PolicySnapshot {
        let slots: Vec<(StateKey, Arc<Mutex<ArmState>>)> = self
            .states
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        let mut entries: Vec<(StateKey, ArmState)> = slots
            .into_iter()
            .map(|(k, slot)| (k, slot.lock().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        PolicySnapshot { entries }
    }

    /// Replace every key present in the snapshot; other keys are untouched
    pub fn restore(&self, snapshot: PolicySnapshot) {
        for (key, state) in snapshot.entries {
            self.put(key, state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_linear_init_is_scaled_identity() {
        match ArmState::linear(3, 2.0) {
            ArmState::Linear { a, b, dim, .. } => {
                assert_eq!(dim, 3);
                assert_eq!(a[0], 2.0);
                assert_eq!(a[4], 2.0);
                assert_eq!(a[1], 0.0);
                assert!(b.iter().all(|v| *v == 0.0));
            }
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn test_failed_update_is_not_committed() {
        let store = PolicyStateStore::new();
        let key = StateKey::new("epsilon_greedy", "a");
        store
            .update(&key, ArmState::mean, |s| {
                if let ArmState::Mean { count, mean } = s {
                    *count += 1;
                    *mean = 0.7;
                }
                Ok(())
            })
            .unwrap();

        let result = store.update(&key, ArmState::mean, |s| {
            if let ArmState::Mean { mean, .. } = s {
                *mean = 99.0;
            }
            Err(Error::numerical("epsilon_greedy", "boom"))
        });
        assert!(result.is_err());

        let nan = store.update(&key, ArmState::mean, |s| {
            if let ArmState::Mean { mean, .. } = s {
                *mean = f64::NAN;
            }
            Ok(())
        });
        assert!(nan.is_err());

        assert_eq!(store.get(&key), Some(ArmState::Mean { count: 1, mean: 0.7 }));
    }

    #[test]
    fn test_read_does_not_insert() {
        let store = PolicyStateStore::new();
        let key = StateKey::new("p", "a");
        assert_eq!(store.read_or(&key, ArmState::mean).count(), 0);
        assert!(store.keys().is_empty());
    }

    #[test]
    fn test_snapshot_restore() {
        let store = PolicyStateStore::new();
        store.put(StateKey::new("p", "a"), ArmState::Mean { count: 3, mean: 0.5 });
        store.put(StateKey::new("p", "b"), ArmState::bootstrap(4));
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 2);

        let json = serde_json::to_string(&snapshot).unwrap();
        let decoded: PolicySnapshot = serde_json::from_str(&json).unwrap();

        let other = PolicyStateStore::new();
        other.restore(decoded);
        assert_eq!(other.snapshot(), snapshot);
    }
}
