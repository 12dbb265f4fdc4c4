//! Query depth and budget

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How much computation a query may spend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QueryDepth {
    /// Lexical scoring only, no embeddings
    L0,
    /// Embedding search over candidates
    #[default]
    L1,
    /// Full scan of every live entity
    L2,
}

impl QueryDepth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::L0 => "L0",
            Self::L1 => "L1",
            Self::L2 => "L2",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "L0" => Some(Self::L0),
            "L1" => Some(Self::L1),
            "L2" => Some(Self::L2),
            _ => None,
        }
    }

    pub fn uses_embeddings(&self) -> bool {
        !matches!(self, Self::L0)
    }
}

/// Limits on a single query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    /// Packs returned across all tiers
    pub max_files: usize,
    /// Estimated tokens across all returned packs
    pub max_tokens: usize,
    /// Graph hops used for related files
    pub max_depth: usize,
    pub timeout_ms: u64,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            max_files: 8,
            max_tokens: 12_000,
            max_depth: 2,
            timeout_ms: 5_000,
        }
    }
}

impl Budget {
    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_parse() {
        assert_eq!(QueryDepth::parse("l2"), Some(QueryDepth::L2));
        assert_eq!(QueryDepth::parse("L3"), None);
        assert!(!QueryDepth::L0.uses_embeddings());
        assert!(QueryDepth::L1.uses_embeddings());
    }

    #[test]
    fn test_budget_serializes_camel_case() {
        let json = serde_json::to_value(Budget::default().with_max_files(2)).unwrap();
        assert_eq!(json["maxFiles"], 2);
        assert_eq!(json["timeoutMs"], 5_000);
    }
}
