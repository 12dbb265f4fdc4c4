//! Confidence model
//!
//! Scores how far a knowledge entity can be trusted along three axes:
//! - freshness: exponential decay on the time since the entity was indexed
//! - coverage: relationships, tests and ownership known for the entity
//! - reliability: smoothed success rate of the packs that used the entity,
//!   penalised by recent failures
//!
//! The overall score is the geometric mean of the three, so a single
//! neglected axis drags the whole record down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::knowledge::{CodeEntity, KnowledgeStore, Relationship, RelationshipKind};
use crate::error::Result;

/// Relationships needed for full relationship coverage
const RELATIONSHIP_SATURATION: f64 = 3.0;

/// Confidence model settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    /// Freshness half-life in days
    pub half_life_days: f64,
    /// Number of most recent outcomes used for the trend factor
    pub reliability_window: usize,
    /// Reliability lost when every outcome in the window failed
    pub trend_penalty: f64,
    /// How long a computed record may be served before recomputation
    pub cache_ttl_secs: u64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            half_life_days: 7.0,
            reliability_window: 10,
            trend_penalty: 0.5,
            cache_ttl_secs: 30,
        }
    }
}

/// Per-entity confidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceRecord {
    pub entity_id: String,
    pub freshness: f64,
    pub coverage: f64,
    pub reliability: f64,
    /// Geometric mean of the three dimensions
    pub overall: f64,
    /// What is known
    pub signals: Vec<String>,
    /// What is missing or stale
    pub caveats: Vec<String>,
    pub computed_at: DateTime<Utc>,
}

impl ConfidenceRecord {
    pub fn from_scores(
        entity_id: impl Into<String>,
        freshness: f64,
        coverage: f64,
        reliability: f64,
    ) -> Self {
        let freshness = clamp_unit(freshness);
        let coverage = clamp_unit(coverage);
        let reliability = clamp_unit(reliability);
        Self {
            entity_id: entity_id.into(),
            freshness,
            coverage,
            reliability,
            overall: geometric_mean(freshness, coverage, reliability),
            signals: Vec::new(),
            caveats: Vec::new(),
            computed_at: Utc::now(),
        }
    }

    /// Record for an entity the store knows nothing about
    pub fn unknown(entity_id: impl Into<String>) -> Self {
        let entity_id = entity_id.into();
        let mut record = Self::from_scores(entity_id.clone(), 0.0, 0.0, 0.0);
        record
            .caveats
            .push(format!("'{}' is not indexed in the knowledge store", entity_id));
        record
    }

    pub fn with_signal(mut self, signal: impl Into<String>) -> Self {
        self.signals.push(signal.into());
        self
    }

    pub fn with_caveat(mut self, caveat: impl Into<String>) -> Self {
        self.caveats.push(caveat.into());
        self
    }
}

/// `(f * c * r)^(1/3)`, zero whenever any input is zero
pub fn geometric_mean(freshness: f64, coverage: f64, reliability: f64) -> f64 {
    let product = clamp_unit(freshness) * clamp_unit(coverage) * clamp_unit(reliability);
    if product <= 0.0 {
        return 0.0;
    }
    clamp_unit(product.cbrt())
}

/// `exp(-ln 2 * days / half_life)`
pub fn freshness(days_since_index: f64, half_life_days: f64) -> f64 {
    if half_life_days <= 0.0 {
        return 0.0;
    }
    let days = days_since_index.max(0.0);
    clamp_unit((-std::f64::consts::LN_2 * days / half_life_days).exp())
}

/// Raw coverage observations for one entity
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CoverageSignals {
    pub exists: bool,
    pub relationships: usize,
    pub has_tests: bool,
    pub has_ownership: bool,
}

/// Mean of the four coverage signals
pub fn coverage(signals: &CoverageSignals) -> f64 {
    let values = [
        bool_score(signals.exists),
        (signals.relationships as f64 / RELATIONSHIP_SATURATION).min(1.0),
        bool_score(signals.has_tests),
        bool_score(signals.has_ownership),
    ];
    values.iter().sum::<f64>() / values.len() as f64
}

/// Laplace-smoothed success rate times a recent-failure trend factor
///
/// With no history this is 0.5. Each success strictly raises it, each
/// failure never does.
pub fn reliability(
    successes: u32,
    failures: u32,
    recent_failures: usize,
    window: usize,
    trend_penalty: f64,
) -> f64 {
    let total = successes as f64 + failures as f64;
    let smoothed = (successes as f64 + 1.0) / (total + 2.0);
    let trend = if window == 0 {
        1.0
    } else {
        1.0 - trend_penalty.clamp(0.0, 1.0) * (recent_failures.min(window) as f64 / window as f64)
    };
    clamp_unit(smoothed * trend)
}

/// Store-backed confidence computation with a short-lived memo
pub struct ConfidenceModel {
    store: Arc<dyn KnowledgeStore>,
    config: ConfidenceConfig,
    memo: Mutex<HashMap<String, (Instant, ConfidenceRecord)>>,
}

impl ConfidenceModel {
    pub fn new(store: Arc<dyn KnowledgeStore>, config: ConfidenceConfig) -> Self {
        Self {
            store,
            config,
            memo: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ConfidenceConfig {
        &self.config
    }

    /// Confidence for an entity, served from the memo while it is younger than the TTL
    pub async fn qualify(&self, entity_id: &str) -> Result<ConfidenceRecord> {
        let ttl = Duration::from_secs(self.config.cache_ttl_secs);
        if let Some((at, record)) = self.lock().get(entity_id) {
            if at.elapsed() < ttl {
                return Ok(record.clone());
            }
        }

        let record = self.compute(entity_id, Utc::now()).await?;
        self.lock()
            .insert(entity_id.to_string(), (Instant::now(), record.clone()));
        Ok(record)
    }

    /// Compute a fresh record from the latest committed store state
    pub async fn compute(&self, entity_id: &str, now: DateTime<Utc>) -> Result<ConfidenceRecord> {
        let Some(entity) = self.store.get_entity(entity_id).await? else {
            return Ok(ConfidenceRecord::unknown(entity_id));
        };

        let signals = self.coverage_signals(&entity).await?;
        let outcomes = self.store.outcomes_for_entity(entity_id).await?;
        let successes = outcomes.iter().filter(|o| o.success).count() as u32;
        let failures = outcomes.len() as u32 - successes;
        let recent_failures = outcomes
            .iter()
            .rev()
            .take(self.config.reliability_window)
            .filter(|o| !o.success)
            .count();

        let days = entity.days_since_index(now);
        let mut record = ConfidenceRecord::from_scores(
            entity_id,
            freshness(days, self.config.half_life_days),
            coverage(&signals),
            reliability(
                successes,
                failures,
                recent_failures,
                self.config.reliability_window,
                self.config.trend_penalty,
            ),
        );
        record.computed_at = now;

        if entity.tombstoned {
            record
                .caveats
                .push("Entity was removed from the codebase".to_string());
        }
        if record.freshness < 0.5 {
            record
                .caveats
                .push(format!("Index is stale ({:.1} days old)", days));
        } else {
            record.signals.push(format!("Indexed {:.1} days ago", days));
        }

        if signals.relationships == 0 {
            record.caveats.push("No relationships recorded".to_string());
        } else {
            record
                .signals
                .push(format!("{} relationships recorded", signals.relationships));
        }
        if signals.has_tests {
            record.signals.push("Covered by mapped tests".to_string());
        } else {
            record.caveats.push("No mapped tests".to_string());
        }
        if signals.has_ownership {
            record.signals.push("Ownership known".to_string());
        } else {
            record.caveats.push("No ownership records".to_string());
        }

        if outcomes.is_empty() {
            record.caveats.push("No recorded outcomes".to_string());
        } else {
            record.signals.push(format!(
                "{} of {} outcomes succeeded",
                successes,
                outcomes.len()
            ));
        }
        if recent_failures > 0 {
            record.caveats.push(format!(
                "{} failures in the last {} outcomes",
                recent_failures,
                outcomes.len().min(self.config.reliability_window)
            ));
        }

        debug!(
            entity_id = %entity_id,
            freshness = record.freshness,
            coverage = record.coverage,
            reliability = record.reliability,
            overall = record.overall,
            "Confidence computed"
        );
        Ok(record)
    }

    /// Forget memoized records for the given entities
    pub fn invalidate(&self, entity_ids: &[String]) {
        let mut memo = self.lock();
        for id in entity_ids {
            memo.remove(id);
        }
    }

    pub fn invalidate_all(&self) {
        self.lock().clear();
    }

    async fn coverage_signals(&self, entity: &CodeEntity) -> Result<CoverageSignals> {
        let mut relationships = self.store.get_relationships(&entity.id, None).await?;
        if entity.path != entity.id {
            relationships.extend(
                self.store
                    .get_relationships(&entity.path, None)
                    .await?
                    .into_iter()
                    .filter(|r| matches!(r.kind, RelationshipKind::Tests | RelationshipKind::Owns)),
            );
        }

        let targets = |r: &Relationship| r.target_id == entity.id || r.target_id == entity.path;

        Ok(CoverageSignals {
            exists: true,
            relationships: relationships
                .iter()
                .filter(|r| {
                    matches!(
                        r.kind,
                        RelationshipKind::Imports
                            | RelationshipKind::Calls
                            | RelationshipKind::CoChanges
                    )
                })
                .count(),
            has_tests: relationships
                .iter()
                .any(|r| r.kind == RelationshipKind::Tests && targets(r)),
            has_ownership: relationships
                .iter()
                .any(|r| r.kind == RelationshipKind::Owns && targets(r)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, (Instant, ConfidenceRecord)>> {
        self.memo.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn bool_score(value: bool) -> f64 {
    if value { 1.0 } else { 0.0 }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}
