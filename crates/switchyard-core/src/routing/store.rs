//! Persistence for decisions, rewards and policy state
//!
//! The decision service writes through a [`DecisionStore`] in the background;
//! persistence failures are logged and never affect routing. [`SqliteStore`]
//! keeps rows as JSON documents so schema changes stay additive.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::policy::{ArmState, PolicySnapshot, StateKey};
use super::types::{Decision, RewardObservation};
use crate::error::Result;

/// SQL to create the decision, reward and policy state tables
pub const CREATE_DECISION_TABLES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS decisions (
    id TEXT PRIMARY KEY,
    tenant TEXT NOT NULL,
    chosen_arm TEXT NOT NULL,
    policy_used TEXT NOT NULL,
    body TEXT NOT NULL,
    created_at DATETIME NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_decisions_tenant ON decisions(tenant);

CREATE TABLE IF NOT EXISTS rewards (
    decision_id TEXT PRIMARY KEY,
    reward REAL NOT NULL,
    cost REAL NOT NULL,
    latency_ms REAL NOT NULL,
    received_at DATETIME NOT NULL
);

CREATE TABLE IF NOT EXISTS policy_state (
    policy TEXT NOT NULL,
    arm_id TEXT NOT NULL,
    state TEXT NOT NULL,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(policy, arm_id)
);
"#;

/// Persistence backend consumed by the decision service
#[async_trait]
pub trait DecisionStore: Send + Sync {
    async fn save_decision(&self, decision: &Decision) -> Result<()>;

    /// First reward per decision wins; later writes are ignored
    async fn save_reward(&self, reward: &RewardObservation) -> Result<()>;

    async fn load_decision(&self, id: Uuid) -> Result<Option<Decision>>;

    async fn load_reward(&self, decision_id: Uuid) -> Result<Option<RewardObservation>>;

    async fn save_policy_snapshot(&self, snapshot: &PolicySnapshot) -> Result<()>;

    async fn load_policy_snapshot(&self) -> Result<PolicySnapshot>;
}

/// In-process store, used by default and in tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    decisions: RwLock<HashMap<Uuid, Decision>>,
    rewards: RwLock<HashMap<Uuid, RewardObservation>>,
    policy_state: RwLock<HashMap<StateKey, ArmState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decision_count(&self) -> usize {
        self.decisions.read().len()
    }

    pub fn reward_count(&self) -> usize {
        self.rewards.read().len()
    }
}

#[async_trait]
impl DecisionStore for MemoryStore {
    async fn save_decision(&self, decision: &Decision) -> Result<()> {
        self.decisions.write().insert(decision.id, decision.clone());
        Ok(())
    }

    async fn save_reward(&self, reward: &RewardObservation) -> Result<()> {
        self.rewards
            .write()
            .entry(reward.decision_id)
            .or_insert_with(|| reward.clone());
        Ok(())
    }

    async fn load_decision(&self, id: Uuid) -> Result<Option<Decision>> {
        Ok(self.decisions.read().get(&id).cloned())
    }

    async fn load_reward(&self, decision_id: Uuid) -> Result<Option<RewardObservation>> {
        Ok(self.rewards.read().get(&decision_id).cloned())
    }

    async fn save_policy_snapshot(&self, snapshot: &PolicySnapshot) -> Result<()> {
        let mut state = self.policy_state.write();
        for (key, arm_state) in &snapshot.entries {
            state.insert(key.clone(), arm_state.clone());
        }
        Ok(())
    }

    async fn load_policy_snapshot(&self) -> Result<PolicySnapshot> {
        let mut entries: Vec<(StateKey, ArmState)> = self
            .policy_state
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(PolicySnapshot { entries })
    }
}

/// SQLite-backed store
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new store from an existing connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new store and connect to the database
    pub async fn connect(database_path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}?mode=rwc", database_path.display());
        let pool = SqlitePool::connect(&url).await?;
        Ok(Self { pool })
    }

    /// Initialize the database schema
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_DECISION_TABLES_SQL)
            .execute(&self.pool)
            .await?;

        info!("Decision store tables initialized");
        Ok(())
    }

    /// Decisions recorded for a tenant, newest first
    pub async fn decisions_for_tenant(&self, tenant: &str, limit: u32) -> Result<Vec<Decision>> {
        let rows = sqlx::query(
            r#"
            SELECT body FROM decisions
            WHERE tenant = ?
            ORDER BY created_at DESC
            LIMIT ?
            "#,
        )
        .bind(tenant)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut decisions = Vec::with_capacity(rows.len());
        for row in rows {
            let body: String = row.get("body");
            decisions.push(serde_json::from_str(&body)?);
        }
        Ok(decisions)
    }

    /// Delete decisions and rewards older than `cutoff`
    pub async fn prune_before(&self, cutoff: chrono::DateTime<chrono::Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM rewards WHERE decision_id IN (SELECT id FROM decisions WHERE created_at < ?)",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query("DELETE FROM decisions WHERE created_at < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let deleted = result.rows_affected();
        warn!(deleted = deleted, "Pruned decision history");
        Ok(deleted)
    }
}

#[async_trait]
impl DecisionStore for SqliteStore {
    async fn save_decision(&self, decision: &Decision) -> Result<()> {
        let body = serde_json::to_string(decision)?;
        sqlx::query(
            r#"
            INSERT INTO decisions (id, tenant, chosen_arm, policy_used, body, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(decision.id.to_string())
        .bind(&decision.tenant)
        .bind(&decision.chosen_arm)
        .bind(&decision.policy_used)
        .bind(body)
        .bind(decision.timestamp)
        .execute(&self.pool)
        .await?;

        debug!(decision_id = %decision.id, "Saved decision");
        Ok(())
    }

    async fn save_reward(&self, reward: &RewardObservation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rewards (decision_id, reward, cost, latency_ms, received_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(decision_id) DO NOTHING
            "#,
        )
        .bind(reward.decision_id.to_string())
        .bind(reward.reward)
        .bind(reward.cost)
        .bind(reward.latency_ms)
        .bind(reward.received_at)
        .execute(&self.pool)
        .await?;

        debug!(decision_id = %reward.decision_id, "Saved reward");
        Ok(())
    }

    async fn load_decision(&self, id: Uuid) -> Result<Option<Decision>> {
        let row = sqlx::query("SELECT body FROM decisions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let body: String = row.get("body");
                Ok(Some(serde_json::from_str(&body)?))
            }
            None => Ok(None),
        }
    }

    async fn load_reward(&self, decision_id: Uuid) -> Result<Option<RewardObservation>> {
        let row = sqlx::query(
            r#"
            SELECT reward, cost, latency_ms, received_at
            FROM rewards
            WHERE decision_id = ?
            "#,
        )
        .bind(decision_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| RewardObservation {
            decision_id,
            reward: row.get("reward"),
            cost: row.get("cost"),
            latency_ms: row.get("latency_ms"),
            received_at: row.get("received_at"),
        }))
    }

    async fn save_policy_snapshot(&self, snapshot: &PolicySnapshot) -> Result<()> {
        if snapshot.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for (key, state) in &snapshot.entries {
            sqlx::query(
                r#"
                INSERT INTO policy_state (policy, arm_id, state, updated_at)
                VALUES (?, ?, ?, CURRENT_TIMESTAMP)
                ON CONFLICT(policy, arm_id) DO UPDATE SET
                    state = excluded.state,
                    updated_at = CURRENT_TIMESTAMP
                "#,
            )
            .bind(&key.policy)
            .bind(&key.arm)
            .bind(serde_json::to_string(state)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        info!(count = snapshot.len(), "Saved policy snapshot");
        Ok(())
    }

    async fn load_policy_snapshot(&self) -> Result<PolicySnapshot> {
        let rows = sqlx::query(
            r#"
            SELECT policy, arm_id, state
            FROM policy_state
            ORDER BY policy, arm_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let policy: String = row.get("policy");
            let arm: String = row.get("arm_id");
            let state: String = row.get("state");
            entries.push((StateKey::new(policy, arm), serde_json::from_str(&state)?));
        }

        info!(count = entries.len(), "Loaded policy snapshot");
        Ok(PolicySnapshot { entries })
    }
}
