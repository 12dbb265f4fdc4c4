//! Constraint engine
//!
//! Validates proposed changes against explicit rules and rules inferred from
//! recurring patterns. Scopes are globs:
//! - `**` matches across directories
//! - `*` matches within one path segment
//! - `?` matches a single non-separator character
//!
//! A constraint that cannot be evaluated (bad regex, bad scope) is reported
//! on its own and never aborts the rest of the batch.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::domain::knowledge::{
    Constraint, ConstraintException, ConstraintRule, ConstraintSource, ConstraintState,
    KnowledgeStore, ObservedPattern, Violation,
};
use crate::error::{Error, Result};

/// Constraint engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstraintConfig {
    /// Length of a granted exception
    pub exception_days: i64,
    /// Distinct files a pattern must be seen in before it is promoted
    pub min_observations: u32,
    /// Period of the background exception sweep
    pub sweep_interval_secs: u64,
}

impl Default for ConstraintConfig {
    fn default() -> Self {
        Self {
            exception_days: 7,
            min_observations: 3,
            sweep_interval_secs: 3600,
        }
    }
}

/// A proposed change to one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    /// Content before the change; `None` for a new file or a preview
    pub before: Option<String>,
    pub after: String,
}

impl FileChange {
    pub fn new(path: impl Into<String>, before: impl Into<String>, after: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            before: Some(before.into()),
            after: after.into(),
        }
    }

    pub fn preview(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            before: None,
            after: content.into(),
        }
    }
}

/// A constraint whose scope matches at least one requested file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicableConstraint {
    pub constraint: Constraint,
    pub state: ConstraintState,
    pub matched_files: Vec<String>,
}

/// A constraint that could not be evaluated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationFailure {
    pub constraint_id: String,
    pub path: String,
    pub reason: String,
}

/// Outcome of validating one or more changes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub violations: Vec<Violation>,
    /// Constraint evaluations performed
    pub evaluated: usize,
    /// Constraints skipped because an exception is active
    pub waived: Vec<String>,
    pub failures: Vec<EvaluationFailure>,
}

impl ValidationReport {
    /// No violations and every constraint could be evaluated
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty() && self.failures.is_empty()
    }
}

/// User-facing description of a constraint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintExplanation {
    pub id: String,
    pub scope: String,
    pub rule: String,
    pub source: ConstraintSource,
    pub state: ConstraintState,
    pub rationale: String,
    pub exception: Option<ConstraintException>,
    pub observation_count: u32,
}

/// A candidate inferred constraint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSuggestion {
    pub constraint: Constraint,
    /// Distinct files the pattern has been seen in, including this call's examples
    pub observations: u32,
    /// Enough observations to promote
    pub ready: bool,
}

/// An inferred constraint a file no longer follows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftedConstraint {
    pub constraint_id: String,
    pub origin_pattern: Option<String>,
    pub evidence: Vec<String>,
}

/// Drift of one file from the patterns behind inferred constraints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub file: String,
    pub drifted: Vec<DriftedConstraint>,
    pub caveats: Vec<String>,
}

impl DriftReport {
    pub fn has_drifted(&self) -> bool {
        !self.drifted.is_empty()
    }
}

pub struct ConstraintEngine {
    store: Arc<dyn KnowledgeStore>,
    config: ConstraintConfig,
}

impl ConstraintEngine {
    pub fn new(store: Arc<dyn KnowledgeStore>, config: ConstraintConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &ConstraintConfig {
        &self.config
    }

    // ========== Constraint Definitions ==========

    /// Store an explicit constraint after checking its scope and patterns compile
    pub async fn define_constraint(&self, constraint: &Constraint) -> Result<()> {
        glob_to_regex(&constraint.scope)?;
        match &constraint.rule {
            ConstraintRule::ForbidPattern { regex } | ConstraintRule::RequirePattern { regex } => {
                Regex::new(regex).map_err(|e| Error::InvalidPattern {
                    pattern: regex.clone(),
                    reason: e.to_string(),
                })?;
            }
            ConstraintRule::ForbidImport { .. } | ConstraintRule::MaxLines { .. } => {}
        }
        self.store.save_constraint(constraint).await?;
        info!(constraint_id = %constraint.id, scope = %constraint.scope, "Constraint defined");
        Ok(())
    }

    /// Non-expired constraints whose scope matches any of `files`
    pub async fn get_applicable(&self, files: &[String]) -> Result<Vec<ApplicableConstraint>> {
        let now = Utc::now();
        let mut applicable = Vec::new();
        for constraint in self.store.list_constraints().await? {
            let state = constraint.state(now);
            if state == ConstraintState::Expired {
                continue;
            }
            let scope = match glob_to_regex(&constraint.scope) {
                Ok(scope) => scope,
                Err(e) => {
                    warn!(constraint_id = %constraint.id, error = %e, "Skipping constraint with invalid scope");
                    continue;
                }
            };
            let matched_files: Vec<String> = files
                .iter()
                .filter(|f| scope.is_match(f))
                .cloned()
                .collect();
            if !matched_files.is_empty() {
                applicable.push(ApplicableConstraint {
                    constraint,
                    state,
                    matched_files,
                });
            }
        }
        Ok(applicable)
    }

    // ========== Validation ==========

    /// Validate full content as if every line were new
    pub async fn preview_change(&self, file: &str, content: &str) -> Result<ValidationReport> {
        self.validate_batch(&[FileChange::preview(file, content)]).await
    }

    pub async fn validate_change(&self, file: &str, before: &str, after: &str) -> Result<ValidationReport> {
        self.validate_batch(&[FileChange::new(file, before, after)]).await
    }

    /// Validate several changes against one snapshot of the constraints
    pub async fn validate_batch(&self, changes: &[FileChange]) -> Result<ValidationReport> {
        let now = Utc::now();
        let constraints = self.store.list_constraints().await?;
        let mut report = ValidationReport::default();
        let mut waived = BTreeSet::new();

        for constraint in &constraints {
            let state = constraint.state(now);
            if state == ConstraintState::Expired {
                continue;
            }
            let scope = match glob_to_regex(&constraint.scope) {
                Ok(scope) => scope,
                Err(e) => {
                    report.failures.push(EvaluationFailure {
                        constraint_id: constraint.id.clone(),
                        path: constraint.scope.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            for change in changes.iter().filter(|c| scope.is_match(&c.path)) {
                if state == ConstraintState::ExceptionGranted {
                    waived.insert(constraint.id.clone());
                    continue;
                }
                report.evaluated += 1;
                match evaluate(constraint, &change.path, change.before.as_deref(), &change.after) {
                    Ok(Some(violation)) => report.violations.push(violation),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(constraint_id = %constraint.id, path = %change.path, error = %e, "Constraint evaluation failed");
                        report.failures.push(EvaluationFailure {
                            constraint_id: constraint.id.clone(),
                            path: change.path.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        report.waived = waived.into_iter().collect();
        debug!(
            changes = changes.len(),
            evaluated = report.evaluated,
            violations = report.violations.len(),
            failures = report.failures.len(),
            "Changes validated"
        );
        Ok(report)
    }

    // ========== Explanation & Exceptions ==========

    pub async fn explain(&self, id: &str) -> Result<ConstraintExplanation> {
        let constraint = self.require(id).await?;
        let now = Utc::now();
        let rationale = if constraint.rationale.is_empty() {
            format!("No rationale recorded; the rule {}", constraint.rule.describe())
        } else {
            constraint.rationale.clone()
        };
        Ok(ConstraintExplanation {
            id: constraint.id.clone(),
            scope: constraint.scope.clone(),
            rule: constraint.rule.describe(),
            source: constraint.source,
            state: constraint.state(now),
            rationale,
            exception: constraint.exception.clone().filter(|e| e.is_active(now)),
            observation_count: constraint.observation_count,
        })
    }

    /// Waive a constraint for the configured window
    pub async fn request_exception(&self, id: &str, reason: &str) -> Result<ConstraintException> {
        self.request_exception_at(id, reason, Utc::now()).await
    }

    pub async fn request_exception_at(
        &self,
        id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<ConstraintException> {
        if reason.trim().is_empty() {
            return Err(Error::InvalidInput(
                "an exception needs a reason".to_string(),
            ));
        }
        let mut constraint = self.require(id).await?;
        let exception = ConstraintException {
            reason: reason.trim().to_string(),
            expires_at: now + chrono::Duration::days(self.config.exception_days),
        };
        constraint.exception = Some(exception.clone());
        constraint.updated_at = now;
        self.store.save_constraint(&constraint).await?;

        info!(
            constraint_id = %id,
            expires_at = %exception.expires_at,
            "Constraint exception granted"
        );
        Ok(exception)
    }

    /// Clear exceptions whose window has closed
    pub async fn sweep_expired_exceptions(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let cleared = self.store.clear_expired_exceptions(now).await?;
        if !cleared.is_empty() {
            info!(count = cleared.len(), "Expired constraint exceptions cleared");
        }
        Ok(cleared)
    }

    /// Sweep expired exceptions every `sweep_interval_secs` until `shutdown` flips
    pub fn spawn_exception_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_expired_exceptions(Utc::now()).await {
                            warn!(error = %e, "Exception sweep failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Exception sweeper stopped");
                            break;
                        }
                    }
                }
            }
        })
    }

    // ========== Inference ==========

    /// Record observations and promote patterns seen often enough
    ///
    /// Returns the constraints created or refreshed by this call.
    pub async fn infer_constraints(&self, patterns: &[ObservedPattern]) -> Result<Vec<Constraint>> {
        let mut promoted = Vec::new();
        for pattern in patterns {
            let observations = self.store.record_pattern(pattern).await?;
            if observations < self.config.min_observations {
                debug!(
                    pattern_key = %pattern.key(),
                    observations,
                    required = self.config.min_observations,
                    "Pattern below promotion threshold"
                );
                continue;
            }

            let merged = self
                .store
                .get_pattern(&pattern.key())
                .await?
                .unwrap_or_else(|| pattern.clone());
            let constraint = self.inferred_constraint(&merged).await?;
            self.store.save_constraint(&constraint).await?;
            info!(
                constraint_id = %constraint.id,
                observations,
                "Pattern promoted to inferred constraint"
            );
            promoted.push(constraint);
        }
        Ok(promoted)
    }

    /// Preview the constraint a pattern would become, without recording it
    pub async fn suggest_constraint(&self, pattern: &ObservedPattern) -> Result<ConstraintSuggestion> {
        let mut files: BTreeSet<String> = pattern.example_files.iter().cloned().collect();
        if let Some(stored) = self.store.get_pattern(&pattern.key()).await? {
            files.extend(stored.example_files);
        }
        let merged = pattern.clone().with_examples(files.into_iter().collect());
        let observations = merged.example_files.len() as u32;

        Ok(ConstraintSuggestion {
            constraint: self.inferred_constraint(&merged).await?,
            observations,
            ready: observations >= self.config.min_observations,
        })
    }

    /// Inferred constraints in scope that the file's current content breaks
    pub async fn detect_drift(&self, file: &str, content: &str) -> Result<DriftReport> {
        let now = Utc::now();
        let mut report = DriftReport {
            file: file.to_string(),
            ..DriftReport::default()
        };

        for constraint in self.store.list_constraints().await? {
            if constraint.source != ConstraintSource::Inferred
                || constraint.state(now) == ConstraintState::Expired
            {
                continue;
            }
            match glob_to_regex(&constraint.scope) {
                Ok(scope) if scope.is_match(file) => {}
                Ok(_) => continue,
                Err(e) => {
                    report.caveats.push(format!("{}: {}", constraint.id, e));
                    continue;
                }
            }
            match evaluate(&constraint, file, None, content) {
                Ok(Some(violation)) => report.drifted.push(DriftedConstraint {
                    constraint_id: constraint.id.clone(),
                    origin_pattern: constraint.origin_pattern.clone(),
                    evidence: violation.evidence,
                }),
                Ok(None) => {}
                Err(e) => report.caveats.push(e.to_string()),
            }
        }

        if report.has_drifted() {
            info!(file = %file, drifted = report.drifted.len(), "Pattern drift detected");
        }
        Ok(report)
    }

    async fn inferred_constraint(&self, pattern: &ObservedPattern) -> Result<Constraint> {
        let id = pattern.constraint_id();
        let constraint = match self.store.get_constraint(&id).await? {
            Some(mut existing) => {
                existing.observation_count = pattern.example_files.len() as u32;
                existing.updated_at = Utc::now();
                existing
            }
            None => {
                let rationale = if pattern.rationale.is_empty() {
                    format!(
                        "Observed in {} files: {}",
                        pattern.example_files.len(),
                        pattern.example_files.join(", ")
                    )
                } else {
                    pattern.rationale.clone()
                };
                Constraint::new(id, pattern.scope.clone(), pattern.rule.clone())
                    .with_rationale(rationale)
                    .inferred_from(pattern)
            }
        };
        Ok(constraint)
    }

    async fn require(&self, id: &str) -> Result<Constraint> {
        self.store
            .get_constraint(id)
            .await?
            .ok_or_else(|| Error::ConstraintNotFound(id.to_string()))
    }
}

/// Anchored regex for a scope glob
pub fn glob_to_regex(glob: &str) -> Result<Regex> {
    let mut pattern = String::with_capacity(glob.len() * 2 + 2);
    pattern.push('^');
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    pattern.push_str("(?:.*/)?");
                } else {
                    pattern.push_str(".*");
                }
            }
            '*' => pattern.push_str("[^/]*"),
            '?' => pattern.push_str("[^/]"),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');

    Regex::new(&pattern).map_err(|e| Error::InvalidPattern {
        pattern: glob.to_string(),
        reason: e.to_string(),
    })
}

/// Lines of `after` that are not in `before`, with 1-based line numbers
///
/// Lines are compared as a multiset, so moving a line is not an addition
/// but duplicating one is.
pub fn added_lines<'a>(before: Option<&str>, after: &'a str) -> Vec<(usize, &'a str)> {
    let mut remaining: HashMap<&str, usize> = HashMap::new();
    for line in before.unwrap_or_default().lines() {
        *remaining.entry(line).or_default() += 1;
    }
    after
        .lines()
        .enumerate()
        .filter(|(_, line)| match remaining.get_mut(line) {
            Some(count) if *count > 0 => {
                *count -= 1;
                false
            }
            _ => true,
        })
        .map(|(i, line)| (i + 1, line))
        .collect()
}

/// Check one constraint against one change
pub fn evaluate(
    constraint: &Constraint,
    path: &str,
    before: Option<&str>,
    after: &str,
) -> Result<Option<Violation>> {
    let evidence: Vec<String> = match &constraint.rule {
        ConstraintRule::ForbidPattern { regex } => {
            let re = compile(&constraint.id, regex)?;
            added_lines(before, after)
                .into_iter()
                .filter(|(_, line)| re.is_match(line))
                .map(|(n, line)| format!("L{}: {}", n, line.trim()))
                .collect()
        }
        ConstraintRule::RequirePattern { regex } => {
            let re = compile(&constraint.id, regex)?;
            if after.lines().any(|line| re.is_match(line)) {
                Vec::new()
            } else {
                vec![format!("no line matches /{}/", regex)]
            }
        }
        ConstraintRule::ForbidImport { module } => {
            let re = compile(
                &constraint.id,
                &format!(
                    r"^\s*(?:pub\s+)?(?:use|import|from|require|extern\s+crate|#include)\b.*{}",
                    regex::escape(module)
                ),
            )?;
            added_lines(before, after)
                .into_iter()
                .filter(|(_, line)| re.is_match(line))
                .map(|(n, line)| format!("L{}: {}", n, line.trim()))
                .collect()
        }
        ConstraintRule::MaxLines { limit } => {
            let lines = after.lines().count();
            if lines > *limit {
                vec![format!("{} lines (limit {})", lines, limit)]
            } else {
                Vec::new()
            }
        }
    };

    if evidence.is_empty() {
        return Ok(None);
    }

    let mut message = format!("{} {}", path, constraint.rule.describe());
    if !constraint.rationale.is_empty() {
        message.push_str(": ");
        message.push_str(&constraint.rationale);
    }
    Ok(Some(Violation {
        constraint_id: constraint.id.clone(),
        entity: path.to_string(),
        evidence,
        message,
    }))
}

fn compile(constraint_id: &str, pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::ConstraintEvaluation {
        id: constraint_id.to_string(),
        reason: format!("invalid regex /{}/: {}", pattern, e),
    })
}
