//! Meta-knowledge engine
//!
//! Answers questions about the knowledge itself: how far it can be trusted,
//! how risky a change is, where the gaps are and who knows a file best.
//! Failure attribution is delegated to [`crate::attribution`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::attribution::{self, Attribution};
use crate::confidence::{self, ConfidenceModel, ConfidenceRecord};
use crate::domain::knowledge::{KnowledgeStore, OutcomeRecord, RelationshipKind};
use crate::error::{Error, Result};

/// Confidence events inspected for a declining trend
const TREND_WINDOW: usize = 10;

/// Meta engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    /// Minimum overall confidence to proceed without review
    pub proceed_threshold: f64,
    /// Entities below this coverage are blind spots
    pub coverage_floor: f64,
    /// Minimum Ochiai score for a pack to be flagged
    pub suspicion_threshold: f64,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            proceed_threshold: 0.4,
            coverage_floor: 0.5,
            suspicion_threshold: 0.3,
        }
    }
}

/// What `qualify` scores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualifyTarget {
    Entity,
    Pack,
}

/// Risk of changing a set of files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// `1 - mean confidence`
    pub risk: f64,
    pub mean_confidence: f64,
    /// File and its overall confidence, riskiest first
    pub files: Vec<(String, f64)>,
    pub caveats: Vec<String>,
}

/// An entity the knowledge store knows too little about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlindSpot {
    pub entity_id: String,
    pub coverage: f64,
    pub overall: f64,
    /// Net confidence delta over recent events is negative
    pub declining: bool,
    pub reasons: Vec<String>,
}

/// A likely owner of a file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expert {
    pub owner: String,
    /// Ownership weight scaled by the confidence of what is owned
    pub score: f64,
    pub owns: Vec<String>,
}

pub struct MetaEngine {
    store: Arc<dyn KnowledgeStore>,
    confidence: Arc<ConfidenceModel>,
    config: MetaConfig,
}

impl MetaEngine {
    pub fn new(store: Arc<dyn KnowledgeStore>, confidence: Arc<ConfidenceModel>, config: MetaConfig) -> Self {
        Self {
            store,
            confidence,
            config,
        }
    }

    pub fn config(&self) -> &MetaConfig {
        &self.config
    }

    /// Confidence of an entity, or of a pack across the entities it covers
    pub async fn qualify(&self, id: &str, target: QualifyTarget) -> Result<ConfidenceRecord> {
        match target {
            QualifyTarget::Entity => self.confidence.qualify(id).await,
            QualifyTarget::Pack => self.qualify_pack(id).await,
        }
    }

    async fn qualify_pack(&self, pack_id: &str) -> Result<ConfidenceRecord> {
        let pack = self
            .store
            .get_pack(pack_id)
            .await?
            .ok_or_else(|| Error::PackNotFound(pack_id.to_string()))?;

        let mut records = Vec::new();
        for entity_id in pack.entity_ids() {
            records.push(self.confidence.qualify(&entity_id).await?);
        }
        let count = records.len().max(1) as f64;
        let freshness = records.iter().map(|r| r.freshness).sum::<f64>() / count;
        let coverage = records.iter().map(|r| r.coverage).sum::<f64>() / count;
        let cfg = self.confidence.config();
        let recent_failures = self
            .store
            .outcomes_for_pack(pack_id)
            .await?
            .iter()
            .rev()
            .take(cfg.reliability_window)
            .filter(|o| !o.success)
            .count();
        let reliability = confidence::reliability(
            pack.success_count,
            pack.failure_count,
            recent_failures,
            cfg.reliability_window,
            cfg.trend_penalty,
        );

        let mut record = ConfidenceRecord::from_scores(pack_id, freshness, coverage, reliability)
            .with_signal(format!("Covers {} entities", records.len()));
        match pack.success_rate() {
            Some(rate) => record.signals.push(format!(
                "Used {} times, {:.0}% success",
                pack.usage_count(),
                rate * 100.0
            )),
            None => record.caveats.push("Pack has never been used".to_string()),
        }
        for entity in records.iter().filter(|r| r.overall == 0.0) {
            record
                .caveats
                .push(format!("No confidence in '{}'", entity.entity_id));
        }
        Ok(record)
    }

    /// Gate on the default threshold
    pub fn should_proceed(&self, record: &ConfidenceRecord) -> bool {
        self.should_proceed_with(record, self.config.proceed_threshold)
    }

    pub fn should_proceed_with(&self, record: &ConfidenceRecord, threshold: f64) -> bool {
        record.overall >= threshold
    }

    /// `risk = 1 - mean confidence` over the files; no files means full risk
    pub async fn assess_risk(&self, files: &[String]) -> Result<RiskAssessment> {
        let mut caveats = Vec::new();
        if files.is_empty() {
            caveats.push("No files supplied; risk cannot be estimated".to_string());
            return Ok(RiskAssessment {
                risk: 1.0,
                mean_confidence: 0.0,
                files: Vec::new(),
                caveats,
            });
        }

        let mut scored = Vec::with_capacity(files.len());
        for file in files {
            let record = self.confidence.qualify(file).await?;
            if record.overall == 0.0 {
                caveats.push(format!("No usable knowledge about '{}'", file));
            }
            scored.push((file.clone(), record.overall));
        }

        let mean = scored.iter().map(|(_, c)| c).sum::<f64>() / scored.len() as f64;
        scored.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        Ok(RiskAssessment {
            risk: 1.0 - mean,
            mean_confidence: mean,
            files: scored,
            caveats,
        })
    }

    /// Entities below the coverage floor or with declining confidence
    pub async fn get_blind_spots(&self) -> Result<Vec<BlindSpot>> {
        let mut spots = Vec::new();
        for entity in self.store.list_entities(false).await? {
            let record = self.confidence.qualify(&entity.id).await?;
            let history = self.store.confidence_history(&entity.id, TREND_WINDOW).await?;
            let net: f32 = history.iter().map(|e| e.delta).sum();
            let declining = net < 0.0;

            if record.coverage >= self.config.coverage_floor && !declining {
                continue;
            }

            let mut reasons = Vec::new();
            if record.coverage < self.config.coverage_floor {
                reasons.push(format!(
                    "coverage {:.2} below {:.2}",
                    record.coverage, self.config.coverage_floor
                ));
                reasons.extend(record.caveats.iter().cloned());
            }
            if declining {
                reasons.push(format!(
                    "declining confidence ({:+.0} over last {} events)",
                    net,
                    history.len()
                ));
            }

            spots.push(BlindSpot {
                entity_id: entity.id,
                coverage: record.coverage,
                overall: record.overall,
                declining,
                reasons,
            });
        }

        spots.sort_by(|a, b| {
            a.overall
                .partial_cmp(&b.overall)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        debug!(count = spots.len(), "Blind spots found");
        Ok(spots)
    }

    /// Owners of a file or its entities, ranked by weight times confidence
    pub async fn get_experts(&self, file: &str) -> Result<Vec<Expert>> {
        let mut targets: BTreeSet<String> = BTreeSet::from([file.to_string()]);
        targets.extend(
            self.store
                .entities_for_path(file)
                .await?
                .into_iter()
                .map(|e| e.id),
        );

        let mut experts: BTreeMap<String, Expert> = BTreeMap::new();
        for target in &targets {
            let owners: Vec<_> = self
                .store
                .get_relationships(target, Some(RelationshipKind::Owns))
                .await?
                .into_iter()
                .filter(|r| r.target_id == *target)
                .collect();
            if owners.is_empty() {
                continue;
            }

            let record = self.confidence.qualify(target).await?;
            for rel in owners {
                let expert = experts.entry(rel.source_id.clone()).or_insert_with(|| Expert {
                    owner: rel.source_id.clone(),
                    score: 0.0,
                    owns: Vec::new(),
                });
                expert.score += f64::from(rel.weight) * record.overall;
                expert.owns.push(target.clone());
            }
        }

        let mut experts: Vec<Expert> = experts.into_values().collect();
        experts.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.owner.cmp(&b.owner))
        });
        Ok(experts)
    }

    /// Rank the packs of a failed outcome by Ochiai suspicion
    pub async fn attribute_failure(&self, outcome: &OutcomeRecord) -> Result<Attribution> {
        let history = self.store.list_outcomes().await?;
        let attribution =
            attribution::attribute(outcome, &history, self.config.suspicion_threshold);
        debug!(
            outcome_id = %outcome.id,
            flagged = attribution.flagged().len(),
            "Failure attributed"
        );
        Ok(attribution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confidence::ConfidenceConfig;
    use crate::domain::knowledge::{CodeEntity, ConfidenceEvent, ContextPack, Relationship};
    use crate::infrastructure::knowledge::SqliteKnowledgeStore;
    use crate::storage::Database;

    async fn engine() -> (Arc<dyn KnowledgeStore>, MetaEngine) {
        let db = Database::in_memory().await.expect("db");
        let store: Arc<dyn KnowledgeStore> = Arc::new(SqliteKnowledgeStore::new(db.pool().clone()));
        let confidence = Arc::new(ConfidenceModel::new(store.clone(), ConfidenceConfig::default()));
        (store.clone(), MetaEngine::new(store, confidence, MetaConfig::default()))
    }

    async fn well_known(store: &Arc<dyn KnowledgeStore>, id: &str) {
        store
            .upsert_entity(&CodeEntity::module(id).with_content(id))
            .await
            .unwrap();
        for other in ["x", "y", "z"] {
            store
                .upsert_relationship(&Relationship::imports(id, other))
                .await
                .unwrap();
        }
        store
            .upsert_relationship(&Relationship::tests(format!("tests/{id}"), id))
            .await
            .unwrap();
        store
            .upsert_relationship(&Relationship::owns("alice", id))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_should_proceed_threshold() {
        let (_, engine) = engine().await;
        let confident = ConfidenceRecord::from_scores("a", 1.0, 1.0, 0.5);
        let unknown = ConfidenceRecord::unknown("b");

        assert!(engine.should_proceed(&confident));
        assert!(!engine.should_proceed(&unknown));
        assert!(!engine.should_proceed_with(&confident, 0.9));
    }

    #[tokio::test]
    async fn test_assess_risk() {
        let (store, engine) = engine().await;
        well_known(&store, "src/a.rs").await;

        let record = engine.qualify("src/a.rs", QualifyTarget::Entity).await.unwrap();
        let assessment = engine
            .assess_risk(&["src/a.rs".to_string(), "src/unknown.rs".to_string()])
            .await
            .unwrap();

        let expected_mean = record.overall / 2.0;
        assert!((assessment.mean_confidence - expected_mean).abs() < 1e-9);
        assert!((assessment.risk - (1.0 - expected_mean)).abs() < 1e-9);
        assert_eq!(assessment.files[0].0, "src/unknown.rs");
        assert!(!assessment.caveats.is_empty());

        assert_eq!(engine.assess_risk(&[]).await.unwrap().risk, 1.0);
    }

    #[tokio::test]
    async fn test_blind_spots() {
        let (store, engine) = engine().await;
        well_known(&store, "src/known.rs").await;
        store
            .upsert_entity(&CodeEntity::module("src/lonely.rs").with_content("l"))
            .await
            .unwrap();
        store
            .log_confidence_event(&ConfidenceEvent::new("src/known.rs", -1.0, "outcome failed"))
            .await
            .unwrap();

        let spots = engine.get_blind_spots().await.unwrap();
        let ids: Vec<&str> = spots.iter().map(|s| s.entity_id.as_str()).collect();
        assert!(ids.contains(&"src/lonely.rs"));
        assert!(ids.contains(&"src/known.rs"));

        let known = spots.iter().find(|s| s.entity_id == "src/known.rs").unwrap();
        assert!(known.declining);
        assert!(known.coverage >= 0.5);
    }

    #[tokio::test]
    async fn test_experts_ranked() {
        let (store, engine) = engine().await;
        well_known(&store, "src/a.rs").await;
        store
            .upsert_relationship(&Relationship::owns("bob", "src/a.rs").with_weight(0.2))
            .await
            .unwrap();

        let experts = engine.get_experts("src/a.rs").await.unwrap();
        assert_eq!(experts.len(), 2);
        assert_eq!(experts[0].owner, "alice");
        assert!(experts[0].score > experts[1].score);
    }

    #[tokio::test]
    async fn test_qualify_pack() {
        let (store, engine) = engine().await;
        well_known(&store, "src/a.rs").await;
        let pack = ContextPack::new("src/a.rs");
        store.save_pack(&pack).await.unwrap();

        let record = engine.qualify(&pack.id, QualifyTarget::Pack).await.unwrap();
        assert!(record.overall > 0.0);
        assert!(record.caveats.iter().any(|c| c.contains("never been used")));

        assert!(matches!(
            engine.qualify("pack-missing", QualifyTarget::Pack).await.unwrap_err(),
            Error::PackNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_qualify_pack_penalizes_recent_failures() {
        let (store, engine) = engine().await;
        well_known(&store, "src/a.rs").await;
        let pack = ContextPack::new("src/a.rs");
        store.save_pack(&pack).await.unwrap();

        for (i, success) in [true, true, false, false].into_iter().enumerate() {
            store
                .record_outcome(&OutcomeRecord::new(vec![pack.id.clone()], success).with_task_id(format!("t{i}")))
                .await
                .unwrap();
        }

        let cfg = ConfidenceConfig::default();
        let record = engine.qualify(&pack.id, QualifyTarget::Pack).await.unwrap();
        let penalized = confidence::reliability(2, 2, 2, cfg.reliability_window, cfg.trend_penalty);
        let unpenalized = confidence::reliability(2, 2, 0, cfg.reliability_window, cfg.trend_penalty);
        assert!((record.reliability - penalized).abs() < 1e-9);
        assert!(record.reliability < unpenalized);
    }

    #[tokio::test]
    async fn test_attribute_failure_uses_history() {
        let (store, engine) = engine().await;
        for id in ["src/a.rs", "src/b.rs"] {
            store
                .upsert_entity(&CodeEntity::module(id).with_content(id))
                .await
                .unwrap();
            store.save_pack(&ContextPack::new(id)).await.unwrap();
        }
        let bad = ContextPack::id_for("src/a.rs");
        let good = ContextPack::id_for("src/b.rs");

        for i in 0..3 {
            store
                .record_outcome(&OutcomeRecord::failure(vec![bad.clone()], "wrong api").with_task_id(format!("f{i}")))
                .await
                .unwrap();
        }
        for i in 0..3 {
            store
                .record_outcome(&OutcomeRecord::success(vec![good.clone()]).with_task_id(format!("s{i}")))
                .await
                .unwrap();
        }

        let failing = OutcomeRecord::failure(vec![bad.clone(), good.clone()], "build broke");
        let attribution = engine.attribute_failure(&failing).await.unwrap();
        assert_eq!(attribution.suspects[0].pack_id, bad);
        assert_eq!(attribution.flagged(), vec![bad.as_str()]);
    }
}
