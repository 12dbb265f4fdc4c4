//! Relationships between code entities
//!
//! Relationships are directed edges. The store guarantees there is at most one
//! edge per `(source, target, kind)`; re-saving the same triple updates weight.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A directed relationship between two entities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// Source entity id (or owner id for `Owns`, test file for `Tests`)
    pub source_id: String,
    /// Target entity id
    pub target_id: String,
    /// Kind of relationship
    pub kind: RelationshipKind,
    /// Weight/strength of the relationship (0.0 to 1.0)
    pub weight: f32,
    /// When the relationship was created
    pub created_at: DateTime<Utc>,
}

impl Relationship {
    /// Create a new relationship with weight 1.0
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        kind: RelationshipKind,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            target_id: target_id.into(),
            kind,
            weight: 1.0,
            created_at: Utc::now(),
        }
    }

    /// `source` imports `target`
    pub fn imports(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(source, target, RelationshipKind::Imports)
    }

    /// `source` calls `target`
    pub fn calls(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(source, target, RelationshipKind::Calls)
    }

    /// `owner` owns `target`
    pub fn owns(owner: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(owner, target, RelationshipKind::Owns)
    }

    /// `test_file` tests `target`
    pub fn tests(test_file: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(test_file, target, RelationshipKind::Tests)
    }

    /// Set the weight
    pub fn with_weight(mut self, weight: f32) -> Self {
        self.weight = weight.clamp(0.0, 1.0);
        self
    }

    /// Whether this edge takes part in cycle and centrality computation
    pub fn is_structural(&self) -> bool {
        self.kind.is_structural()
    }

    /// Stable key used for the edge-set checksum
    pub fn edge_key(&self) -> String {
        format!("{}|{}|{}", self.source_id, self.kind.as_str(), self.target_id)
    }
}

/// Kinds of relationships
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    /// Source imports target
    Imports,
    /// Source calls target
    Calls,
    /// Source and target tend to change together
    CoChanges,
    /// Source (an owner) owns target
    Owns,
    /// Source (a test) exercises target
    Tests,
}

impl RelationshipKind {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Imports => "imports",
            Self::Calls => "calls",
            Self::CoChanges => "co_changes",
            Self::Owns => "owns",
            Self::Tests => "tests",
        }
    }

    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "imports" | "import" => Some(Self::Imports),
            "calls" | "call" => Some(Self::Calls),
            "co_changes" | "cochanges" | "co-changes" => Some(Self::CoChanges),
            "owns" => Some(Self::Owns),
            "tests" => Some(Self::Tests),
            _ => None,
        }
    }

    /// Get all relationship kinds
    pub fn all() -> &'static [RelationshipKind] {
        &[
            Self::Imports,
            Self::Calls,
            Self::CoChanges,
            Self::Owns,
            Self::Tests,
        ]
    }

    /// Kinds that form the module/call graph
    pub fn structural() -> &'static [RelationshipKind] {
        &[Self::Imports, Self::Calls]
    }

    /// Check if this kind is structural (imports, calls)
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Imports | Self::Calls)
    }
}

impl std::fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
