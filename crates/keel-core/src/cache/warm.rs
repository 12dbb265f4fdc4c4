//! Warm tier: bounded LRU between the hot map and the durable store

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::domain::knowledge::CacheEntry;

pub struct WarmTier {
    entries: LruCache<String, CacheEntry>,
}

impl WarmTier {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    pub fn get(&mut self, fingerprint: &str) -> Option<CacheEntry> {
        let entry = self.entries.get_mut(fingerprint)?;
        entry.access_count += 1;
        Some(entry.clone())
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.entries.contains(fingerprint)
    }

    /// Insert as most recent, returning a different entry evicted on overflow
    pub fn insert(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        let fingerprint = entry.fingerprint.clone();
        match self.entries.push(fingerprint.clone(), entry) {
            Some((evicted, old)) if evicted != fingerprint => Some(old),
            _ => None,
        }
    }

    pub fn remove(&mut self, fingerprint: &str) -> Option<CacheEntry> {
        self.entries.pop(fingerprint)
    }

    pub fn remove_where(&mut self, predicate: impl Fn(&CacheEntry) -> bool) -> Vec<String> {
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(fingerprint, _)| fingerprint.clone())
            .collect();
        for fingerprint in &doomed {
            self.entries.pop(fingerprint);
        }
        doomed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn entry(fp: &str) -> CacheEntry {
        CacheEntry::new(fp, json!({}), json!(fp), Duration::from_secs(60))
    }

    #[test]
    fn test_lru_eviction() {
        let mut warm = WarmTier::new(2);
        warm.insert(entry("a"));
        warm.insert(entry("b"));
        warm.get("a");

        let evicted = warm.insert(entry("c")).unwrap();
        assert_eq!(evicted.fingerprint, "b");
        assert_eq!(warm.len(), 2);
    }

    #[test]
    fn test_reinsert_is_not_an_eviction() {
        let mut warm = WarmTier::new(1);
        warm.insert(entry("a"));
        assert!(warm.insert(entry("a")).is_none());
        assert!(warm.contains("a"));
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let mut warm = WarmTier::new(0);
        warm.insert(entry("a"));
        assert_eq!(warm.len(), 1);
    }
}
