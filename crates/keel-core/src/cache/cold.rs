//! Cold tier: the durable query cache in the knowledge store

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::domain::knowledge::{CacheEntry, KnowledgeStore};
use crate::error::{Error, Result};

pub struct ColdTier {
    store: Arc<dyn KnowledgeStore>,
    read_timeout: Duration,
}

impl ColdTier {
    pub fn new(store: Arc<dyn KnowledgeStore>, read_timeout: Duration) -> Self {
        Self {
            store,
            read_timeout,
        }
    }

    /// Bounded read; corrupt rows, store errors and slow reads are all misses
    pub async fn get(&self, fingerprint: &str) -> Option<CacheEntry> {
        match tokio::time::timeout(self.read_timeout, self.store.get_cached(fingerprint)).await {
            Ok(Ok(entry)) => entry,
            Ok(Err(Error::CacheCorrupt(fp))) => {
                warn!(fingerprint = %fp, "Corrupt cache entry discarded");
                if let Err(e) = self.store.delete_cached(&fp).await {
                    warn!(fingerprint = %fp, error = %e, "Failed to delete corrupt cache entry");
                }
                None
            }
            Ok(Err(e)) => {
                warn!(fingerprint = %fingerprint, error = %e, "Cold cache read failed");
                None
            }
            Err(_) => {
                warn!(
                    fingerprint = %fingerprint,
                    timeout_ms = self.read_timeout.as_millis() as u64,
                    "Cold cache read timed out"
                );
                None
            }
        }
    }

    pub async fn set(&self, entry: &CacheEntry) -> Result<()> {
        self.store.set_cached(entry).await
    }

    pub async fn delete(&self, fingerprint: &str) -> Result<bool> {
        self.store.delete_cached(fingerprint).await
    }

    pub async fn invalidate_dependents(&self, path: &str) -> Result<Vec<String>> {
        self.store.invalidate_dependents(path).await
    }

    pub async fn prune_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        self.store.prune_expired(now).await
    }

    pub async fn clear(&self) -> Result<u64> {
        self.store.clear_cache().await
    }
}
