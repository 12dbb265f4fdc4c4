//! Constraints, exceptions and observed patterns
//!
//! A constraint pairs a scope glob with a rule predicate. Its state is derived
//! from the clock rather than stored, so an exception reverts to `Active` the
//! moment its window closes even before the sweeper clears it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A rule a change must satisfy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub id: String,
    /// Glob over paths (`src/**/*.rs`) or symbols
    pub scope: String,
    pub rule: ConstraintRule,
    pub source: ConstraintSource,
    /// Shown to users when the constraint is explained or violated
    pub rationale: String,
    /// The constraint itself stops applying after this instant
    pub expires_at: Option<DateTime<Utc>>,
    pub exception: Option<ConstraintException>,
    /// Key of the pattern an inferred constraint was promoted from
    pub origin_pattern: Option<String>,
    /// Distinct files the originating pattern was observed in
    pub observation_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Constraint {
    /// Create an explicit constraint
    pub fn new(id: impl Into<String>, scope: impl Into<String>, rule: ConstraintRule) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            scope: scope.into(),
            rule,
            source: ConstraintSource::Explicit,
            rationale: String::new(),
            expires_at: None,
            exception: None,
            origin_pattern: None,
            observation_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Mark as inferred from an observed pattern
    pub fn inferred_from(mut self, pattern: &ObservedPattern) -> Self {
        self.source = ConstraintSource::Inferred;
        self.origin_pattern = Some(pattern.key());
        self.observation_count = pattern.example_files.len() as u32;
        self
    }

    /// Lifecycle state at `now`
    pub fn state(&self, now: DateTime<Utc>) -> ConstraintState {
        if let Some(expires_at) = self.expires_at {
            if expires_at <= now {
                return ConstraintState::Expired;
            }
        }
        match &self.exception {
            Some(exception) if exception.is_active(now) => ConstraintState::ExceptionGranted,
            _ => ConstraintState::Active,
        }
    }

    /// Whether violations should be reported at `now`
    pub fn is_enforced(&self, now: DateTime<Utc>) -> bool {
        self.state(now) == ConstraintState::Active
    }
}

/// Rule predicates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConstraintRule {
    /// Added lines must not match the regex
    ForbidPattern { regex: String },
    /// The resulting content must contain a match for the regex
    RequirePattern { regex: String },
    /// Added lines must not import the module
    ForbidImport { module: String },
    /// The resulting content must not exceed this many lines
    MaxLines { limit: usize },
}

impl ConstraintRule {
    /// Human-readable form of the predicate
    pub fn describe(&self) -> String {
        match self {
            Self::ForbidPattern { regex } => format!("must not contain /{}/", regex),
            Self::RequirePattern { regex } => format!("must contain /{}/", regex),
            Self::ForbidImport { module } => format!("must not import `{}`", module),
            Self::MaxLines { limit } => format!("must not exceed {} lines", limit),
        }
    }
}

/// Where a constraint came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintSource {
    Explicit,
    Inferred,
}

impl ConstraintSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Inferred => "inferred",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "explicit" => Some(Self::Explicit),
            "inferred" => Some(Self::Inferred),
            _ => None,
        }
    }
}

/// Derived lifecycle state of a constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintState {
    Active,
    Expired,
    ExceptionGranted,
}

/// A time-boxed waiver of a constraint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintException {
    pub reason: String,
    pub expires_at: DateTime<Utc>,
}

impl ConstraintException {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// A rule breach found during validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub constraint_id: String,
    /// File (or symbol) the violation was found in
    pub entity: String,
    /// Matched lines or symbols
    pub evidence: Vec<String>,
    pub message: String,
}

/// A recurring pattern seen across validated changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedPattern {
    pub scope: String,
    pub rule: ConstraintRule,
    pub rationale: String,
    /// Files the pattern was observed in
    pub example_files: Vec<String>,
}

impl ObservedPattern {
    pub fn new(scope: impl Into<String>, rule: ConstraintRule) -> Self {
        Self {
            scope: scope.into(),
            rule,
            rationale: String::new(),
            example_files: Vec::new(),
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }

    pub fn with_examples(mut self, files: Vec<String>) -> Self {
        let mut files = files;
        files.sort();
        files.dedup();
        self.example_files = files;
        self
    }

    /// Stable identity of the pattern, independent of its examples
    pub fn key(&self) -> String {
        let rule = serde_json::to_string(&self.rule).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(self.scope.as_bytes());
        hasher.update([0u8]);
        hasher.update(rule.as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("pattern-{}", &digest[..16])
    }

    /// Id given to the constraint inferred from this pattern
    pub fn constraint_id(&self) -> String {
        format!("inferred-{}", &self.key()["pattern-".len()..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn no_unwrap() -> Constraint {
        Constraint::new(
            "no-unwrap",
            "src/**/*.rs",
            ConstraintRule::ForbidPattern {
                regex: r"\.unwrap\(\)".to_string(),
            },
        )
    }

    #[test]
    fn test_state_active_by_default() {
        let constraint = no_unwrap();
        assert_eq!(constraint.state(Utc::now()), ConstraintState::Active);
        assert!(constraint.is_enforced(Utc::now()));
    }

    #[test]
    fn test_state_expired() {
        let now = Utc::now();
        let constraint = no_unwrap().with_expiry(now - Duration::seconds(1));
        assert_eq!(constraint.state(now), ConstraintState::Expired);
        assert!(!constraint.is_enforced(now));
    }

    #[test]
    fn test_exception_reverts_to_active() {
        let now = Utc::now();
        let mut constraint = no_unwrap();
        constraint.exception = Some(ConstraintException {
            reason: "migration".to_string(),
            expires_at: now + Duration::days(7),
        });

        assert_eq!(constraint.state(now), ConstraintState::ExceptionGranted);
        assert_eq!(
            constraint.state(now + Duration::days(7)),
            ConstraintState::Active
        );
    }

    #[test]
    fn test_rule_serialization_is_tagged() {
        let rule = ConstraintRule::MaxLines { limit: 500 };
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["type"], "max_lines");
        assert_eq!(json["limit"], 500);
        assert_eq!(rule.describe(), "must not exceed 500 lines");
    }

    #[test]
    fn test_pattern_key_ignores_examples() {
        let rule = ConstraintRule::ForbidImport {
            module: "std::sync::Mutex".to_string(),
        };
        let a = ObservedPattern::new("src/**", rule.clone()).with_examples(vec!["a".into()]);
        let b = ObservedPattern::new("src/**", rule).with_examples(vec!["b".into(), "c".into()]);
        assert_eq!(a.key(), b.key());
        assert!(a.constraint_id().starts_with("inferred-"));
    }

    #[test]
    fn test_inferred_from_pattern() {
        let pattern = ObservedPattern::new("src/**", ConstraintRule::MaxLines { limit: 10 })
            .with_examples(vec!["a".into(), "b".into(), "c".into()]);
        let constraint = Constraint::new(pattern.constraint_id(), "src/**", pattern.rule.clone())
            .inferred_from(&pattern);
        assert_eq!(constraint.source, ConstraintSource::Inferred);
        assert_eq!(constraint.observation_count, 3);
        assert_eq!(constraint.origin_pattern, Some(pattern.key()));
    }
}
