//! Semantic response cache
//!
//! Entries are grouped by namespace (tenant or workspace); lookups never cross
//! namespaces. Each namespace publishes an immutable `Arc` snapshot of its
//! entries. Readers clone the `Arc` and scan without holding any lock; writers
//! serialize on a per-namespace mutex, build the next snapshot and swap it in.
//!
//! A lookup is a hit when the best cosine similarity among the top-k live
//! entries reaches the configured threshold. Hits bump `hit_count` and slide
//! the entry's expiry only when it is already inside the grace window.

mod embed;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};

pub use embed::{Embedder, HashingEmbedder};

/// `[cache]` config section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub similarity_threshold: f32,
    pub top_k: usize,
    pub default_ttl_secs: i64,
    /// Hits inside this window before expiry extend the entry's life
    pub grace_window_secs: i64,
    pub max_entries_per_namespace: usize,
    /// Sweep drops entries older than this with fewer than `min_hits` hits
    pub low_usage_after_secs: i64,
    pub min_hits: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            similarity_threshold: 0.90,
            top_k: 3,
            default_ttl_secs: 3600,
            grace_window_secs: 300,
            max_entries_per_namespace: 10_000,
            low_usage_after_secs: 1800,
            min_hits: 1,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(Error::Config(format!(
                "cache.similarity_threshold must be in [0, 1], got {}",
                self.similarity_threshold
            )));
        }
        if self.top_k == 0 {
            return Err(Error::Config("cache.top_k must be positive".to_string()));
        }
        if self.grace_window_secs < 0 || self.low_usage_after_secs < 0 {
            return Err(Error::Config(
                "cache grace and low-usage windows must be non-negative".to_string(),
            ));
        }
        if self.max_entries_per_namespace == 0 {
            return Err(Error::Config(
                "cache.max_entries_per_namespace must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// A stored response keyed by its context embedding
#[derive(Debug)]
pub struct CacheEntry {
    pub id: Uuid,
    pub embedding: Vec<f32>,
    norm: f32,
    pub context_hash: Option<String>,
    pub response: String,
    pub arm_id: String,
    /// Milliseconds since the epoch; moves forward on sliding refresh
    created_at_ms: AtomicI64,
    pub ttl_ms: i64,
    hit_count: AtomicU64,
}

impl CacheEntry {
    pub fn created_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.created_at_ms.load(Ordering::Acquire))
            .unwrap_or_default()
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    /// Entries with a non-positive ttl never match
    pub fn is_live(&self, now_ms: i64) -> bool {
        self.ttl_ms > 0 && now_ms <= self.created_at_ms.load(Ordering::Acquire) + self.ttl_ms
    }

    fn remaining_ms(&self, now_ms: i64) -> i64 {
        self.created_at_ms.load(Ordering::Acquire) + self.ttl_ms - now_ms
    }
}

/// What the caller wants stored
#[derive(Debug, Clone)]
pub struct CacheWrite {
    pub embedding: Vec<f32>,
    pub response: String,
    pub arm_id: String,
    pub context_hash: Option<String>,
    /// Seconds; `None` uses the configured default
    pub ttl_secs: Option<i64>,
}

impl CacheWrite {
    pub fn new(embedding: Vec<f32>, response: impl Into<String>, arm_id: impl Into<String>) -> Self {
        Self {
            embedding,
            response: response.into(),
            arm_id: arm_id.into(),
            context_hash: None,
            ttl_secs: None,
        }
    }

    pub fn with_ttl_secs(mut self, ttl: i64) -> Self {
        self.ttl_secs = Some(ttl);
        self
    }

    pub fn with_context_hash(mut self, hash: impl Into<String>) -> Self {
        self.context_hash = Some(hash.into());
        self
    }
}

/// Result of a lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheLookup {
    pub hit: bool,
    pub response: Option<String>,
    pub arm_id: Option<String>,
    /// Best similarity seen, hit or not
    pub similarity: f32,
    pub entry_id: Option<Uuid>,
}

impl CacheLookup {
    fn miss(similarity: f32) -> Self {
        Self {
            hit: false,
            response: None,
            arm_id: None,
            similarity,
            entry_id: None,
        }
    }
}

/// Counts from a sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub expired: usize,
    pub low_usage: usize,
    pub remaining: usize,
}

type Snapshot = Arc<Vec<Arc<CacheEntry>>>;

#[derive(Debug, Default)]
struct Namespace {
    snapshot: RwLock<Snapshot>,
    writer: Mutex<()>,
}

impl Namespace {
    fn load(&self) -> Snapshot {
        self.snapshot.read().clone()
    }

    /// Build the next snapshot from the current one and publish it
    fn rewrite<T>(&self, f: impl FnOnce(&mut Vec<Arc<CacheEntry>>) -> T) -> T {
        let _guard = self.writer.lock();
        let mut next: Vec<Arc<CacheEntry>> = self.load().as_ref().clone();
        let out = f(&mut next);
        *self.snapshot.write() = Arc::new(next);
        out
    }
}

/// Namespaced semantic cache
#[derive(Debug, Default)]
pub struct SemanticCache {
    config: RwLock<CacheConfig>,
    namespaces: RwLock<HashMap<String, Arc<Namespace>>>,
}

fn validate_embedding(embedding: &[f32]) -> Result<f32> {
    if embedding.is_empty() {
        return Err(Error::InvalidEmbedding("embedding is empty".to_string()));
    }
    if embedding.iter().any(|v| !v.is_finite()) {
        return Err(Error::InvalidEmbedding("embedding has non-finite values".to_string()));
    }
    let norm = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return Err(Error::InvalidEmbedding("embedding has zero norm".to_string()));
    }
    Ok(norm)
}

impl SemanticCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config: RwLock::new(config),
            namespaces: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> CacheConfig {
        self.config.read().clone()
    }

    /// Swap tunables; stored entries are kept
    pub fn set_config(&self, config: CacheConfig) {
        *self.config.write() = config;
    }

    fn namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        self.namespaces.read().get(name).map(Arc::clone)
    }

    fn namespace_or_create(&self, name: &str) -> Arc<Namespace> {
        if let Some(ns) = self.namespace(name) {
            return ns;
        }
        self.namespaces
            .write()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    pub fn lookup(&self, namespace: &str, embedding: &[f32]) -> Result<CacheLookup> {
        self.lookup_at(namespace, embedding, Utc::now())
    }

    pub fn lookup_at(
        &self,
        namespace: &str,
        embedding: &[f32],
        now: DateTime<Utc>,
    ) -> Result<CacheLookup> {
        let norm = validate_embedding(embedding)?;
        let config = self.config();
        if !config.enabled {
            return Ok(CacheLookup::miss(0.0));
        }
        let Some(ns) = self.namespace(namespace) else {
            return Ok(CacheLookup::miss(0.0));
        };
        let entries = ns.load();
        if entries.is_empty() {
            return Ok(CacheLookup::miss(0.0));
        }
        if let Some(first) = entries.first() {
            if first.embedding.len() != embedding.len() {
                return Err(Error::InvalidEmbedding(format!(
                    "dimension {} does not match namespace dimension {}",
                    embedding.len(),
                    first.embedding.len()
                )));
            }
        }

        let now_ms = now.timestamp_millis();
        let mut neighbors: Vec<(f32, &Arc<CacheEntry>)> = entries
            .iter()
            .filter(|e| e.is_live(now_ms))
            .map(|e| {
                let dot: f32 = e.embedding.iter().zip(embedding).map(|(a, b)| a * b).sum();
                (dot / (e.norm * norm), e)
            })
            .collect();
        neighbors.sort_by(|a, b| b.0.total_cmp(&a.0));
        neighbors.truncate(config.top_k);

        let Some((similarity, best)) = neighbors.first() else {
            return Ok(CacheLookup::miss(0.0));
        };
        if *similarity < config.similarity_threshold {
            return Ok(CacheLookup::miss(*similarity));
        }

        best.hit_count.fetch_add(1, Ordering::Relaxed);
        if best.remaining_ms(now_ms) <= config.grace_window_secs * 1000 {
            best.created_at_ms.store(now_ms, Ordering::Release);
            debug!(namespace, entry = %best.id, "Cache entry refreshed inside grace window");
        }

        Ok(CacheLookup {
            hit: true,
            response: Some(best.response.clone()),
            arm_id: Some(best.arm_id.clone()),
            similarity: *similarity,
            entry_id: Some(best.id),
        })
    }

    pub fn store(&self, namespace: &str, write: CacheWrite) -> Result<Uuid> {
        self.store_at(namespace, write, Utc::now())
    }

    pub fn store_at(&self, namespace: &str, write: CacheWrite, now: DateTime<Utc>) -> Result<Uuid> {
        let norm = validate_embedding(&write.embedding)?;
        let config = self.config();
        let ttl_secs = write.ttl_secs.unwrap_or(config.default_ttl_secs);
        let entry = Arc::new(CacheEntry {
            id: Uuid::new_v4(),
            embedding: write.embedding,
            norm,
            context_hash: write.context_hash,
            response: write.response,
            arm_id: write.arm_id,
            created_at_ms: AtomicI64::new(now.timestamp_millis()),
            ttl_ms: ttl_secs.saturating_mul(1000),
            hit_count: AtomicU64::new(0),
        });
        let id = entry.id;

        let ns = self.namespace_or_create(namespace);
        ns.rewrite(|entries| {
            if let Some(first) = entries.first() {
                if first.embedding.len() != entry.embedding.len() {
                    return Err(Error::InvalidEmbedding(format!(
                        "dimension {} does not match namespace dimension {}",
                        entry.embedding.len(),
                        first.embedding.len()
                    )));
                }
            }
            entries.push(entry);
            let excess = entries.len().saturating_sub(config.max_entries_per_namespace);
            if excess > 0 {
                evict_least_used(entries, excess);
            }
            Ok(())
        })?;
        debug!(namespace, entry = %id, ttl_secs, "Cache entry stored");
        Ok(id)
    }

    /// Drop expired entries and old entries that were rarely hit
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let config = self.config();
        let now_ms = now.timestamp_millis();
        let low_usage_ms = config.low_usage_after_secs.saturating_mul(1000);
        let namespaces: Vec<Arc<Namespace>> = self.namespaces.read().values().cloned().collect();

        let mut report = SweepReport::default();
        for ns in namespaces {
            ns.rewrite(|entries| {
                entries.retain(|e| {
                    if !e.is_live(now_ms) {
                        report.expired += 1;
                        return false;
                    }
                    let age = now_ms - e.created_at_ms.load(Ordering::Acquire);
                    if age > low_usage_ms && e.hit_count() < config.min_hits {
                        report.low_usage += 1;
                        return false;
                    }
                    true
                });
                report.remaining += entries.len();
            });
        }
        debug!(
            expired = report.expired,
            low_usage = report.low_usage,
            remaining = report.remaining,
            "Cache sweep finished"
        );
        report
    }

    /// Remove every entry in a namespace, returning how many were dropped
    pub fn purge(&self, namespace: &str) -> usize {
        match self.namespaces.write().remove(namespace) {
            Some(ns) => ns.load().len(),
            None => 0,
        }
    }

    pub fn len(&self, namespace: &str) -> usize {
        self.namespace(namespace).map_or(0, |ns| ns.load().len())
    }

    pub fn is_empty(&self, namespace: &str) -> bool {
        self.len(namespace) == 0
    }

    /// Snapshot of one namespace's entries
    pub fn entries(&self, namespace: &str) -> Vec<Arc<CacheEntry>> {
        self.namespace(namespace)
            .map(|ns| ns.load().as_ref().clone())
            .unwrap_or_default()
    }
}

/// Remove `count` entries, fewest hits first, oldest first among equals
fn evict_least_used(entries: &mut Vec<Arc<CacheEntry>>, count: usize) {
    let mut order: Vec<(u64, i64, Uuid)> = entries
        .iter()
        .map(|e| (e.hit_count(), e.created_at_ms.load(Ordering::Acquire), e.id))
        .collect();
    order.sort();
    let victims: Vec<Uuid> = order.into_iter().take(count).map(|(_, _, id)| id).collect();
    entries.retain(|e| !victims.contains(&e.id));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn unit(dim: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[axis] = 1.0;
        v
    }

    #[test]
    fn test_round_trip_hit() {
        let cache = SemanticCache::new(CacheConfig::default());
        let e = vec![0.3, 0.4, 0.5, 0.1];
        cache
            .store("tenant-a", CacheWrite::new(e.clone(), "cached answer", "arm-1"))
            .unwrap();
        let lookup = cache.lookup("tenant-a", &e).unwrap();
        assert!(lookup.hit);
        assert!((lookup.similarity - 1.0).abs() < 1e-5);
        assert_eq!(lookup.response.as_deref(), Some("cached answer"));
        assert_eq!(lookup.arm_id.as_deref(), Some("arm-1"));
    }

    #[test]
    fn test_orthogonal_miss() {
        let cache = SemanticCache::new(CacheConfig::default());
        cache
            .store("t", CacheWrite::new(unit(4, 0), "x", "a"))
            .unwrap();
        let lookup = cache.lookup("t", &unit(4, 1)).unwrap();
        assert!(!lookup.hit);
        assert!(lookup.similarity.abs() < 1e-6);
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let cache = SemanticCache::new(CacheConfig::default());
        cache.store("t1", CacheWrite::new(unit(4, 0), "x", "a")).unwrap();
        assert!(!cache.lookup("t2", &unit(4, 0)).unwrap().hit);
    }

    #[test]
    fn test_invalid_embeddings_rejected() {
        let cache = SemanticCache::new(CacheConfig::default());
        assert!(matches!(
            cache.lookup("t", &[0.0, 0.0]),
            Err(Error::InvalidEmbedding(_))
        ));
        assert!(cache.lookup("t", &[]).is_err());
        assert!(cache.lookup("t", &[f32::NAN, 1.0]).is_err());

        cache.store("t", CacheWrite::new(unit(4, 0), "x", "a")).unwrap();
        assert!(cache.lookup("t", &unit(3, 0)).is_err());
        assert!(cache.store("t", CacheWrite::new(unit(3, 0), "y", "a")).is_err());
    }

    #[test]
    fn test_empty_namespace_misses() {
        let cache = SemanticCache::new(CacheConfig::default());
        let lookup = cache.lookup("nobody", &unit(4, 0)).unwrap();
        assert!(!lookup.hit);
    }

    #[test]
    fn test_zero_ttl_never_matches() {
        let cache = SemanticCache::new(CacheConfig::default());
        cache
            .store("t", CacheWrite::new(unit(4, 0), "x", "a").with_ttl_secs(0))
            .unwrap();
        assert_eq!(cache.len("t"), 1);
        assert!(!cache.lookup("t", &unit(4, 0)).unwrap().hit);
    }

    #[test]
    fn test_expiry_and_grace_refresh() {
        let cache = SemanticCache::new(CacheConfig {
            grace_window_secs: 60,
            ..Default::default()
        });
        let t0 = Utc::now();
        cache
            .store_at("t", CacheWrite::new(unit(4, 0), "x", "a").with_ttl_secs(600), t0)
            .unwrap();

        // outside the grace window: created_at untouched
        let early = t0 + Duration::seconds(100);
        assert!(cache.lookup_at("t", &unit(4, 0), early).unwrap().hit);
        assert_eq!(
            cache.entries("t")[0].created_at().timestamp_millis(),
            t0.timestamp_millis()
        );

        // inside the grace window: expiry slides forward
        let late = t0 + Duration::seconds(570);
        assert!(cache.lookup_at("t", &unit(4, 0), late).unwrap().hit);
        assert_eq!(
            cache.entries("t")[0].created_at().timestamp_millis(),
            late.timestamp_millis()
        );
        assert_eq!(cache.entries("t")[0].hit_count(), 2);

        // past the refreshed expiry
        let gone = late + Duration::seconds(601);
        assert!(!cache.lookup_at("t", &unit(4, 0), gone).unwrap().hit);
    }

    #[test]
    fn test_sweep_prunes_expired_and_unused() {
        let cache = SemanticCache::new(CacheConfig {
            low_usage_after_secs: 100,
            min_hits: 1,
            ..Default::default()
        });
        let t0 = Utc::now();
        cache
            .store_at("t", CacheWrite::new(unit(4, 0), "used", "a").with_ttl_secs(10_000), t0)
            .unwrap();
        cache
            .store_at("t", CacheWrite::new(unit(4, 1), "unused", "a").with_ttl_secs(10_000), t0)
            .unwrap();
        cache
            .store_at("t", CacheWrite::new(unit(4, 2), "short", "a").with_ttl_secs(10), t0)
            .unwrap();
        assert!(cache.lookup_at("t", &unit(4, 0), t0).unwrap().hit);

        let report = cache.sweep_at(t0 + Duration::seconds(200));
        assert_eq!(report.expired, 1);
        assert_eq!(report.low_usage, 1);
        assert_eq!(report.remaining, 1);
        assert_eq!(cache.entries("t")[0].response, "used");
    }

    #[test]
    fn test_capacity_evicts_least_used() {
        let cache = SemanticCache::new(CacheConfig {
            max_entries_per_namespace: 2,
            ..Default::default()
        });
        let t0 = Utc::now();
        cache.store_at("t", CacheWrite::new(unit(4, 0), "a", "x"), t0).unwrap();
        cache
            .store_at("t", CacheWrite::new(unit(4, 1), "b", "x"), t0 + Duration::seconds(1))
            .unwrap();
        assert!(cache.lookup_at("t", &unit(4, 0), t0 + Duration::seconds(2)).unwrap().hit);
        cache
            .store_at("t", CacheWrite::new(unit(4, 2), "c", "x"), t0 + Duration::seconds(3))
            .unwrap();

        let responses: Vec<String> = cache.entries("t").iter().map(|e| e.response.clone()).collect();
        assert_eq!(responses.len(), 2);
        assert!(responses.contains(&"a".to_string()));
        assert!(!responses.contains(&"b".to_string()));
    }

    #[test]
    fn test_purge() {
        let cache = SemanticCache::new(CacheConfig::default());
        cache.store("t", CacheWrite::new(unit(4, 0), "a", "x")).unwrap();
        assert_eq!(cache.purge("t"), 1);
        assert!(cache.is_empty("t"));
        assert_eq!(cache.purge("t"), 0);
    }

    #[test]
    fn test_disabled_cache_misses() {
        let cache = SemanticCache::new(CacheConfig::default());
        cache.store("t", CacheWrite::new(unit(4, 0), "a", "x")).unwrap();
        cache.set_config(CacheConfig {
            enabled: false,
            ..Default::default()
        });
        assert!(!cache.lookup("t", &unit(4, 0)).unwrap().hit);
    }
}
