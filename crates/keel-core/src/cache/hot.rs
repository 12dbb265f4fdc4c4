//! Hot tier: a small map ordered by a logical access clock

use std::collections::HashMap;

use crate::domain::knowledge::CacheEntry;

#[derive(Debug)]
pub struct HotTier {
    capacity: usize,
    clock: u64,
    entries: HashMap<String, (u64, CacheEntry)>,
}

impl HotTier {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            clock: 0,
            entries: HashMap::new(),
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Read and mark as most recently used
    pub fn get(&mut self, fingerprint: &str) -> Option<CacheEntry> {
        let now = self.tick();
        let (at, entry) = self.entries.get_mut(fingerprint)?;
        *at = now;
        entry.access_count += 1;
        Some(entry.clone())
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.entries.contains_key(fingerprint)
    }

    /// Insert as most recently used, returning the entry pushed out on overflow
    pub fn insert(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        let now = self.tick();
        self.entries.insert(entry.fingerprint.clone(), (now, entry));
        if self.entries.len() > self.capacity {
            self.pop_oldest()
        } else {
            None
        }
    }

    pub fn remove(&mut self, fingerprint: &str) -> Option<CacheEntry> {
        self.entries.remove(fingerprint).map(|(_, entry)| entry)
    }

    /// Least recently used entry
    pub fn pop_oldest(&mut self) -> Option<CacheEntry> {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, (at, _))| *at)
            .map(|(fingerprint, _)| fingerprint.clone())?;
        self.remove(&oldest)
    }

    /// Drop every entry matching `predicate`, returning their fingerprints
    pub fn remove_where(&mut self, predicate: impl Fn(&CacheEntry) -> bool) -> Vec<String> {
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, (_, entry))| predicate(entry))
            .map(|(fingerprint, _)| fingerprint.clone())
            .collect();
        for fingerprint in &doomed {
            self.entries.remove(fingerprint);
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
    fn test_overflow_pushes_out_least_recent() {
        let mut hot = HotTier::new(2);
        assert!(hot.insert(entry("a")).is_none());
        assert!(hot.insert(entry("b")).is_none());
        hot.get("a");

        let evicted = hot.insert(entry("c")).unwrap();
        assert_eq!(evicted.fingerprint, "b");
        assert!(hot.contains("a"));
        assert!(hot.contains("c"));
    }

    #[test]
    fn test_get_counts_access() {
        let mut hot = HotTier::new(4);
        hot.insert(entry("a"));
        hot.get("a");
        assert_eq!(hot.get("a").unwrap().access_count, 2);
        assert!(hot.get("missing").is_none());
    }
}
