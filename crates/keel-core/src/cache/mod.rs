//! Hierarchical query cache
//!
//! Three tiers behind one interface:
//!
//! - hot: small map of the most recently touched responses
//! - warm: larger LRU of responses pushed out of the hot tier
//! - cold: the durable `query_cache` table, written through on every set
//!
//! Promotion and demotion happen synchronously on access. An entry lives in at
//! most one in-memory tier, and in the cold tier until it expires or is
//! invalidated.

pub mod cold;
pub mod hot;
pub mod warm;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::knowledge::{CacheEntry, KnowledgeStore};
use crate::error::Result;

pub use cold::ColdTier;
pub use hot::HotTier;
pub use warm::WarmTier;

/// Cache sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub hot_capacity: usize,
    pub warm_capacity: usize,
    /// Upper bound on a single durable read
    pub cold_read_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hot_capacity: 64,
            warm_capacity: 256,
            cold_read_timeout_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    Hot,
    Warm,
    Cold,
}

/// Tier sizes and hit/miss counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hot_entries: usize,
    pub warm_entries: usize,
    pub hot_hits: u64,
    pub warm_hits: u64,
    pub cold_hits: u64,
    pub misses: u64,
    pub promotions: u64,
    pub demotions: u64,
    pub invalidations: u64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hot_hits + self.warm_hits + self.cold_hits
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits() as f64 / total as f64
        }
    }
}

/// Query response cache used by the pipeline
#[async_trait]
pub trait QueryCache: Send + Sync {
    /// Unexpired entry, or `None`; never fails
    async fn get(&self, fingerprint: &str) -> Option<CacheEntry>;

    /// Store an entry (last writer wins)
    async fn set(&self, entry: CacheEntry) -> Result<()>;

    /// Drop one entry from every tier
    async fn invalidate(&self, fingerprint: &str) -> Result<bool>;

    /// Drop every entry depending on `path`, returning their fingerprints
    async fn invalidate_dependents(&self, path: &str) -> Result<Vec<String>>;

    /// Move an entry one tier toward hot, returning where it now lives
    async fn promote(&self, fingerprint: &str) -> Result<Option<CacheTier>>;

    /// Move an entry one tier toward cold, returning where it now lives
    async fn demote(&self, fingerprint: &str) -> Result<Option<CacheTier>>;

    /// Drop expired entries from every tier
    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Drop everything, returning the number of durable entries removed
    async fn clear(&self) -> Result<u64>;

    fn stats(&self) -> CacheStats;
}

#[derive(Default)]
struct Counters {
    hot_hits: AtomicU64,
    warm_hits: AtomicU64,
    cold_hits: AtomicU64,
    misses: AtomicU64,
    promotions: AtomicU64,
    demotions: AtomicU64,
    invalidations: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Hot map, warm LRU and cold store composed into one cache
pub struct TieredCache {
    hot: Mutex<HotTier>,
    warm: Mutex<WarmTier>,
    cold: ColdTier,
    counters: Counters,
}

impl TieredCache {
    pub fn new(store: Arc<dyn KnowledgeStore>, config: &CacheConfig) -> Self {
        Self {
            hot: Mutex::new(HotTier::new(config.hot_capacity)),
            warm: Mutex::new(WarmTier::new(config.warm_capacity)),
            cold: ColdTier::new(store, Duration::from_millis(config.cold_read_timeout_ms)),
            counters: Counters::default(),
        }
    }

    fn hot(&self) -> MutexGuard<'_, HotTier> {
        self.hot.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn warm(&self) -> MutexGuard<'_, WarmTier> {
        self.warm.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Place an entry in the hot tier, cascading overflow down to warm
    fn admit_hot(&self, entry: CacheEntry) {
        let fingerprint = entry.fingerprint.clone();
        self.warm().remove(&fingerprint);
        let pushed = self.hot().insert(entry);
        if let Some(pushed) = pushed {
            Counters::bump(&self.counters.demotions);
            self.admit_warm(pushed);
        }
    }

    /// Place an entry in the warm tier; warm overflow falls back to cold only
    fn admit_warm(&self, entry: CacheEntry) {
        let evicted = self.warm().insert(entry);
        if evicted.is_some() {
            Counters::bump(&self.counters.demotions);
        }
    }

    /// Where an entry currently lives in memory
    pub fn tier_of(&self, fingerprint: &str) -> Option<CacheTier> {
        if self.hot().contains(fingerprint) {
            Some(CacheTier::Hot)
        } else if self.warm().contains(fingerprint) {
            Some(CacheTier::Warm)
        } else {
            None
        }
    }

    fn miss(&self, fingerprint: &str) -> Option<CacheEntry> {
        Counters::bump(&self.counters.misses);
        debug!(fingerprint = %fingerprint, "Cache miss");
        None
    }
}

#[async_trait]
impl QueryCache for TieredCache {
    async fn get(&self, fingerprint: &str) -> Option<CacheEntry> {
        let now = Utc::now();

        let hot = self.hot().get(fingerprint);
        if let Some(entry) = hot {
            if entry.is_expired(now) {
                self.hot().remove(fingerprint);
                return self.miss(fingerprint);
            }
            Counters::bump(&self.counters.hot_hits);
            return Some(entry);
        }

        let warm = self.warm().remove(fingerprint);
        if let Some(mut entry) = warm {
            if entry.is_expired(now) {
                return self.miss(fingerprint);
            }
            entry.access_count += 1;
            Counters::bump(&self.counters.warm_hits);
            Counters::bump(&self.counters.promotions);
            self.admit_hot(entry.clone());
            return Some(entry);
        }

        match self.cold.get(fingerprint).await {
            Some(entry) if !entry.is_expired(now) => {
                Counters::bump(&self.counters.cold_hits);
                Counters::bump(&self.counters.promotions);
                self.admit_warm(entry.clone());
                Some(entry)
            }
            _ => self.miss(fingerprint),
        }
    }

    async fn set(&self, entry: CacheEntry) -> Result<()> {
        self.cold.set(&entry).await?;
        debug!(
            fingerprint = %entry.fingerprint,
            expires_at = %entry.expires_at,
            dependencies = entry.dependencies.len(),
            "Cache entry stored"
        );
        self.admit_hot(entry);
        Ok(())
    }

    async fn invalidate(&self, fingerprint: &str) -> Result<bool> {
        let in_hot = self.hot().remove(fingerprint).is_some();
        let in_warm = self.warm().remove(fingerprint).is_some();
        let in_cold = self.cold.delete(fingerprint).await?;
        let removed = in_hot || in_warm || in_cold;
        if removed {
            Counters::bump(&self.counters.invalidations);
        }
        Ok(removed)
    }

    async fn invalidate_dependents(&self, path: &str) -> Result<Vec<String>> {
        let mut evicted = self.hot().remove_where(|e| e.depends_on(path));
        evicted.extend(self.warm().remove_where(|e| e.depends_on(path)));
        evicted.extend(self.cold.invalidate_dependents(path).await?);
        evicted.sort();
        evicted.dedup();

        self.counters
            .invalidations
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        if !evicted.is_empty() {
            debug!(path = %path, evicted = evicted.len(), "Dependent cache entries invalidated");
        }
        Ok(evicted)
    }

    async fn promote(&self, fingerprint: &str) -> Result<Option<CacheTier>> {
        if self.hot().contains(fingerprint) {
            return Ok(Some(CacheTier::Hot));
        }
        let warm = self.warm().remove(fingerprint);
        if let Some(entry) = warm {
            Counters::bump(&self.counters.promotions);
            self.admit_hot(entry);
            return Ok(Some(CacheTier::Hot));
        }
        match self.cold.get(fingerprint).await {
            Some(entry) if !entry.is_expired(Utc::now()) => {
                Counters::bump(&self.counters.promotions);
                self.admit_warm(entry);
                Ok(Some(CacheTier::Warm))
            }
            _ => Ok(None),
        }
    }

    async fn demote(&self, fingerprint: &str) -> Result<Option<CacheTier>> {
        let hot = self.hot().remove(fingerprint);
        if let Some(entry) = hot {
            Counters::bump(&self.counters.demotions);
            self.admit_warm(entry);
            return Ok(Some(CacheTier::Warm));
        }
        if self.warm().remove(fingerprint).is_some() {
            Counters::bump(&self.counters.demotions);
            return Ok(Some(CacheTier::Cold));
        }
        Ok(None)
    }

    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let in_memory = self.hot().remove_where(|e| e.is_expired(now)).len()
            + self.warm().remove_where(|e| e.is_expired(now)).len();
        let durable = self.cold.prune_expired(now).await?;
        debug!(in_memory, durable, "Expired cache entries pruned");
        Ok(durable)
    }

    async fn clear(&self) -> Result<u64> {
        self.hot().clear();
        self.warm().clear();
        self.cold.clear().await
    }

    fn stats(&self) -> CacheStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CacheStats {
            hot_entries: self.hot().len(),
            warm_entries: self.warm().len(),
            hot_hits: load(&self.counters.hot_hits),
            warm_hits: load(&self.counters.warm_hits),
            cold_hits: load(&self.counters.cold_hits),
            misses: load(&self.counters.misses),
            promotions: load(&self.counters.promotions),
            demotions: load(&self.counters.demotions),
            invalidations: load(&self.counters.invalidations),
        }
    }
}
