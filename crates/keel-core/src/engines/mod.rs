//! Reasoning engines
//!
//! - `relevance`: ranked, budgeted context for an intent, and the learning loop
//! - `constraint`: explicit and inferred rules checked against proposed changes
//! - `meta`: confidence, risk, blind spots, experts and failure attribution
//!
//! Engines are plain owned components: each holds the store and whatever
//! other components it reads, and is handed to the query pipeline by the
//! backbone.

pub mod budget;
pub mod constraint;
pub mod meta;
pub mod relevance;

pub use budget::{Budget, QueryDepth};
pub use constraint::{
    ApplicableConstraint, ConstraintConfig, ConstraintEngine, ConstraintExplanation,
    ConstraintSuggestion, DriftReport, DriftedConstraint, EvaluationFailure, FileChange,
    ValidationReport,
};
pub use meta::{
    BlindSpot, Expert, MetaConfig, MetaEngine, QualifyTarget, RiskAssessment,
};
pub use relevance::{
    OutcomeReceipt, RelevanceConfig, RelevanceEngine, RelevanceResult, ScoreBreakdown,
    ScoredEntity, ScoringWeights, SimilarMatch, SimilarityResult, TestCoverage,
};
