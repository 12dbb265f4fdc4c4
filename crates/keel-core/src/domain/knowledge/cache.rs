//! Query cache entries

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A cached query response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Deterministic hash of the normalized query parameters
    pub fingerprint: String,
    /// Normalized parameters, kept for inspection
    pub params: serde_json::Value,
    /// Serialized response
    pub response: serde_json::Value,
    /// Files whose change invalidates this entry
    pub dependencies: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub access_count: u64,
}

impl CacheEntry {
    pub fn new(
        fingerprint: impl Into<String>,
        params: serde_json::Value,
        response: serde_json::Value,
        ttl: std::time::Duration,
    ) -> Self {
        let now = Utc::now();
        let ttl = Duration::from_std(ttl).unwrap_or(Duration::zero());
        Self {
            fingerprint: fingerprint.into(),
            params,
            response,
            dependencies: Vec::new(),
            created_at: now,
            expires_at: now + ttl,
            access_count: 0,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        let mut dependencies = dependencies;
        dependencies.sort();
        dependencies.dedup();
        self.dependencies = dependencies;
        self
    }

    /// Set an explicit expiry (used by tests and by re-hydration from storage)
    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = expires_at;
        self
    }

    /// An entry at or past its expiry must never be served
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn depends_on(&self, path: &str) -> bool {
        self.dependencies.iter().any(|d| d == path)
    }
}
