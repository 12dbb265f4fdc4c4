//! Pipeline requests and their cache fingerprints

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::engines::constraint::FileChange;
use crate::engines::meta::QualifyTarget;
use crate::engines::{Budget, QueryDepth};

/// A context query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub intent: String,
    #[serde(default)]
    pub depth: QueryDepth,
    /// Files the consuming task expects to touch
    #[serde(default)]
    pub affected_files: Vec<String>,
    /// Overrides the depth profile; `max_files` is still capped by the profile
    #[serde(default)]
    pub budget: Option<Budget>,
    /// Attach constraint, risk and blast-radius reports
    #[serde(default)]
    pub include_engines: bool,
}

impl QueryRequest {
    pub fn new(intent: impl Into<String>, depth: QueryDepth) -> Self {
        Self {
            intent: intent.into(),
            depth,
            affected_files: Vec::new(),
            budget: None,
            include_engines: false,
        }
    }

    pub fn with_affected_files(mut self, files: Vec<String>) -> Self {
        self.affected_files = files;
        self
    }

    pub fn with_budget(mut self, budget: Budget) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_engines(mut self) -> Self {
        self.include_engines = true;
        self
    }

    /// Intent with whitespace collapsed and case folded
    pub fn normalized_intent(&self) -> String {
        self.intent
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Parameters that determine the response, in canonical form
    pub fn normalized_params(&self) -> serde_json::Value {
        let mut files = self.affected_files.clone();
        files.sort();
        files.dedup();
        json!({
            "intent": self.normalized_intent(),
            "depth": self.depth.as_str(),
            "affectedFiles": files,
            "budget": self.budget,
            "includeEngines": self.include_engines,
        })
    }

    /// Deterministic cache key: SHA-256 of the normalized parameters
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.normalized_params().to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Every question the pipeline can dispatch
#[derive(Debug, Clone)]
pub enum KnowledgeQuery {
    Context(QueryRequest),
    BlastRadius { files: Vec<String>, max_depth: usize },
    TestCoverage { files: Vec<String> },
    SimilarPatterns { target_id: String },
    FindExamples { pattern: String },
    ApplicableConstraints { files: Vec<String> },
    ValidateChanges { changes: Vec<FileChange> },
    ExplainConstraint { id: String },
    Qualify { id: String, target: QualifyTarget },
    AssessRisk { files: Vec<String> },
    BlindSpots,
    Experts { file: String },
    Architecture { top: usize },
}

impl KnowledgeQuery {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Context(_) => "context",
            Self::BlastRadius { .. } => "blast_radius",
            Self::TestCoverage { .. } => "test_coverage",
            Self::SimilarPatterns { .. } => "similar_patterns",
            Self::FindExamples { .. } => "find_examples",
            Self::ApplicableConstraints { .. } => "applicable_constraints",
            Self::ValidateChanges { .. } => "validate_changes",
            Self::ExplainConstraint { .. } => "explain_constraint",
            Self::Qualify { .. } => "qualify",
            Self::AssessRisk { .. } => "assess_risk",
            Self::BlindSpots => "blind_spots",
            Self::Experts { .. } => "experts",
            Self::Architecture { .. } => "architecture",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_ignores_formatting() {
        let a = QueryRequest::new("Add  retry to\tHTTP client", QueryDepth::L1)
            .with_affected_files(vec!["b.rs".into(), "a.rs".into()]);
        let b = QueryRequest::new("add retry to http client", QueryDepth::L1)
            .with_affected_files(vec!["a.rs".into(), "b.rs".into(), "a.rs".into()]);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_fingerprint_distinguishes_parameters() {
        let base = QueryRequest::new("retry", QueryDepth::L1);
        assert_ne!(
            base.fingerprint(),
            QueryRequest::new("retry", QueryDepth::L2).fingerprint()
        );
        assert_ne!(
            base.fingerprint(),
            base.clone().with_budget(Budget::default().with_max_files(2)).fingerprint()
        );
        assert_ne!(base.fingerprint(), base.clone().with_engines().fingerprint());
    }

    #[test]
    fn test_request_deserializes_camel_case() {
        let request: QueryRequest = serde_json::from_value(json!({
            "intent": "parse config",
            "depth": "L0",
            "affectedFiles": ["src/config.rs"],
            "budget": {"maxFiles": 2, "maxTokens": 500, "maxDepth": 1, "timeoutMs": 100},
            "includeEngines": true
        }))
        .unwrap();
        assert_eq!(request.depth, QueryDepth::L0);
        assert_eq!(request.budget.unwrap().max_files, 2);
        assert!(request.include_engines);
    }
}
