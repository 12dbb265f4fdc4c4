//! Relevance engine
//!
//! Ranks live entities against an intent and assembles budgeted context
//! packs. Every candidate is scored as a weighted sum of
//!
//! | signal     | weight | source                                   |
//! |------------|--------|------------------------------------------|
//! | semantic   | 0.40   | cosine similarity (L1/L2), lexical (L0)   |
//! | importance | 0.20   | PageRank, normalized to the top entity   |
//! | confidence | 0.20   | overall confidence                       |
//! | centrality | 0.10   | normalized betweenness                   |
//! | recency    | 0.10   | decay on time since last modification    |
//!
//! Ties go to the higher confidence, then to the lexically smaller id.
//!
//! The engine also owns the outcome side of the learning loop: recording
//! outcomes against packs, in submission order per pack.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::budget::{Budget, QueryDepth};
use crate::confidence::{self, ConfidenceModel};
use crate::domain::knowledge::{
    CodeEntity, ConfidenceEvent, ContextPack, Embedding, KnowledgeStore, OutcomeRecord,
    RelationshipKind,
};
use crate::embedding::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::graph::{AffectedEntity, BlastRadius, CodeGraph, GraphAnalytics, expand_scope};

/// Related files attached to a pack
const MAX_RELATED_FILES: usize = 8;
/// Neighbours named in a pack's key facts
const MAX_FACT_NEIGHBOURS: usize = 5;

/// Weights of the relevance signals
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub semantic: f64,
    pub importance: f64,
    pub confidence: f64,
    pub centrality: f64,
    pub recency: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            semantic: 0.40,
            importance: 0.20,
            confidence: 0.20,
            centrality: 0.10,
            recency: 0.10,
        }
    }
}

impl ScoringWeights {
    pub fn total(&self) -> f64 {
        self.semantic + self.importance + self.confidence + self.centrality + self.recency
    }
}

/// Relevance engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelevanceConfig {
    pub weights: ScoringWeights,
    /// Minimum cosine similarity for nearest-neighbour matches
    pub similarity_threshold: f32,
    /// Half-life of the recency signal in days
    pub recency_half_life_days: f64,
}

impl Default for RelevanceConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            similarity_threshold: 0.35,
            recency_half_life_days: 14.0,
        }
    }
}

/// Per-signal contributions before weighting
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub semantic: f64,
    pub importance: f64,
    pub confidence: f64,
    pub centrality: f64,
    pub recency: f64,
}

impl ScoreBreakdown {
    pub fn weighted(&self, weights: &ScoringWeights) -> f64 {
        weights.semantic * self.semantic
            + weights.importance * self.importance
            + weights.confidence * self.confidence
            + weights.centrality * self.centrality
            + weights.recency * self.recency
    }
}

/// A ranked candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredEntity {
    pub entity_id: String,
    pub path: String,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

/// Ranked, budgeted context for an intent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelevanceResult {
    /// Packs in rank order
    pub packs: Vec<ContextPack>,
    /// Every scored candidate in rank order
    pub ranked: Vec<ScoredEntity>,
    pub caveats: Vec<String>,
    /// Candidates were dropped to respect the file or token budget
    pub truncated: bool,
    /// The deadline passed before every candidate was considered
    pub partial: bool,
    pub tokens_used: usize,
}

impl RelevanceResult {
    pub fn is_empty(&self) -> bool {
        self.packs.is_empty()
    }
}

/// A nearest-neighbour hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarMatch {
    pub entity_id: String,
    pub similarity: f32,
}

/// Nearest-neighbour hits above the similarity threshold
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimilarityResult {
    pub matches: Vec<SimilarMatch>,
    pub caveats: Vec<String>,
}

/// Tests mapped to source files
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestCoverage {
    /// Source file -> tests exercising it
    pub tests: BTreeMap<String, Vec<String>>,
    /// Source files with no mapped test
    pub untested: Vec<String>,
}

impl TestCoverage {
    pub fn ratio(&self) -> f64 {
        let total = self.tests.len() + self.untested.len();
        if total == 0 {
            0.0
        } else {
            self.tests.len() as f64 / total as f64
        }
    }
}

/// Result of submitting an outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeReceipt {
    pub outcome_id: String,
    /// False when an identical submission was already recorded
    pub recorded: bool,
    /// Entities whose confidence was invalidated
    pub affected_entities: Vec<String>,
}

pub struct RelevanceEngine {
    store: Arc<dyn KnowledgeStore>,
    analytics: Arc<GraphAnalytics>,
    confidence: Arc<ConfidenceModel>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    config: RelevanceConfig,
    pack_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RelevanceEngine {
    pub fn new(
        store: Arc<dyn KnowledgeStore>,
        analytics: Arc<GraphAnalytics>,
        confidence: Arc<ConfidenceModel>,
        config: RelevanceConfig,
    ) -> Self {
        Self {
            store,
            analytics,
            confidence,
            embedder: None,
            config,
            pack_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn config(&self) -> &RelevanceConfig {
        &self.config
    }

    // ========== Context Assembly ==========

    /// Rank entities for an intent and assemble packs within the budget
    ///
    /// `L0` scores lexically and never needs an embedding provider; `L1` and
    /// `L2` fail with [`Error::EmbeddingUnavailable`] when none is reachable.
    pub async fn query(
        &self,
        intent: &str,
        depth: QueryDepth,
        budget: &Budget,
    ) -> Result<RelevanceResult> {
        let started = Instant::now();
        let deadline = started + budget.timeout();
        // Scoring stops here so assembly keeps at least half the budget
        let rank_by = started + budget.timeout() / 2;
        let mut result = RelevanceResult::default();

        // Packs land in `result` as they are finished, so a deadline cut keeps them
        let collected = tokio::time::timeout_at(
            deadline,
            self.collect(intent, depth, budget, rank_by, &mut result),
        )
        .await;
        match collected {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => result.partial = true,
        }

        if result.truncated {
            result.caveats.push(format!(
                "Budget kept {} of {} ranked entities",
                result.packs.len(),
                result.ranked.len()
            ));
        }
        if result.partial {
            result.caveats.push(format!(
                "Timed out after {} ms; returning {} packs for {} ranked entities",
                budget.timeout_ms,
                result.packs.len(),
                result.ranked.len()
            ));
        }

        debug!(
            depth = depth.as_str(),
            ranked = result.ranked.len(),
            packs = result.packs.len(),
            tokens = result.tokens_used,
            truncated = result.truncated,
            partial = result.partial,
            "Relevance query answered"
        );
        Ok(result)
    }

    async fn collect(
        &self,
        intent: &str,
        depth: QueryDepth,
        budget: &Budget,
        rank_by: Instant,
        result: &mut RelevanceResult,
    ) -> Result<()> {
        let entities = self.store.list_entities(false).await?;
        if entities.is_empty() {
            result
                .caveats
                .push("Knowledge store has no indexed entities".to_string());
            return Ok(());
        }

        let intent_terms = terms(intent);
        let semantic = if depth.uses_embeddings() {
            let query = self.embed_one(intent).await?;
            let (scores, skipped) = self.similarities(&query, None).await?;
            if skipped > 0 {
                result.caveats.push(format!(
                    "{} embeddings skipped: incompatible with model '{}'",
                    skipped, query.model
                ));
            }
            Some(scores)
        } else {
            None
        };

        let mut candidates: Vec<(&CodeEntity, f64)> = Vec::new();
        let mut unembedded = 0;
        for entity in &entities {
            let lexical = lexical_overlap(&intent_terms, entity);
            let (score, is_candidate) = match &semantic {
                None => (lexical, lexical > 0.0),
                Some(scores) => match scores.get(&entity.id) {
                    Some(&similarity) => {
                        let similarity = f64::from(similarity.max(0.0));
                        let above = similarity >= f64::from(self.config.similarity_threshold);
                        (similarity, depth == QueryDepth::L2 || above || lexical > 0.0)
                    }
                    None => {
                        unembedded += 1;
                        (lexical, depth == QueryDepth::L2 || lexical > 0.0)
                    }
                },
            };
            if is_candidate {
                candidates.push((entity, score));
            }
        }
        if unembedded > 0 {
            result.caveats.push(format!(
                "{} entities have no embedding; lexical overlap used instead",
                unembedded
            ));
        }

        if candidates.is_empty() {
            result
                .caveats
                .push(format!("No entities matched intent '{}'", intent.trim()));
            return Ok(());
        }

        // Most similar first, so a scoring cut keeps the best candidates
        candidates.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.id.cmp(&b.0.id))
        });

        let graph = self.analytics.snapshot().await?;
        let ranking = self.analytics.importance(&graph);
        let centrality = self.analytics.centrality(&graph);
        let max_rank = ranking.scores.values().copied().fold(0.0, f64::max);
        let now = Utc::now();

        let mut ranked = Vec::with_capacity(candidates.len());
        for (entity, semantic_score) in &candidates {
            if !ranked.is_empty() && Instant::now() >= rank_by {
                result.partial = true;
                break;
            }
            let record = self.confidence.qualify(&entity.id).await?;
            let breakdown = ScoreBreakdown {
                semantic: *semantic_score,
                importance: if max_rank > 0.0 {
                    ranking.score(&entity.id) / max_rank
                } else {
                    0.0
                },
                confidence: record.overall,
                centrality: centrality.get(&entity.id).copied().unwrap_or(0.0),
                recency: confidence::freshness(
                    entity.days_since_modified(now),
                    self.config.recency_half_life_days,
                ),
            };
            ranked.push(ScoredEntity {
                entity_id: entity.id.clone(),
                path: entity.path.clone(),
                score: breakdown.weighted(&self.config.weights),
                breakdown,
            });
        }

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.breakdown
                        .confidence
                        .partial_cmp(&a.breakdown.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        result.ranked = ranked;

        for index in 0..result.ranked.len() {
            if result.packs.len() >= budget.max_files {
                result.truncated = true;
                break;
            }
            let mut pack = self
                .assemble_pack(&graph, &result.ranked[index], budget.max_depth)
                .await?;
            let tokens = pack.estimated_tokens();
            if result.tokens_used + tokens > budget.max_tokens {
                result.truncated = true;
                if result.packs.is_empty() {
                    // Never answer a non-empty ranking with nothing
                    let fits = trim_to_budget(&mut pack, budget.max_tokens);
                    result.caveats.push(if fits {
                        format!(
                            "Top pack '{}' trimmed to fit {} tokens",
                            pack.id, budget.max_tokens
                        )
                    } else {
                        format!(
                            "Top pack '{}' needs {} tokens, over the {} token budget",
                            pack.id,
                            pack.estimated_tokens(),
                            budget.max_tokens
                        )
                    });
                    result.tokens_used += pack.estimated_tokens();
                    result.packs.push(pack);
                }
                break;
            }
            result.tokens_used += tokens;
            result.packs.push(pack);
        }
        Ok(())
    }

    async fn assemble_pack(
        &self,
        graph: &CodeGraph,
        scored: &ScoredEntity,
        max_depth: usize,
    ) -> Result<ContextPack> {
        let entity = self
            .store
            .get_entity(&scored.entity_id)
            .await?
            .ok_or_else(|| Error::EntityNotFound(scored.entity_id.clone()))?;
        let record = self.confidence.qualify(&entity.id).await?;

        let related: Vec<String> = expand_scope(graph, &[entity.id.clone()], max_depth)
            .into_iter()
            .map(|a| a.id)
            .chain(graph.dependents(&entity.id).into_iter().map(str::to_string))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter(|id| *id != entity.id)
            .take(MAX_RELATED_FILES)
            .collect();

        let mut facts = Vec::new();
        if let Some(signature) = &entity.signature {
            facts.push(format!("signature: {}", signature));
        }
        let dependencies = graph.dependencies(&entity.id);
        if !dependencies.is_empty() {
            facts.push(format!("depends on: {}", neighbours(&dependencies)));
        }
        let dependents = graph.dependents(&entity.id);
        if !dependents.is_empty() {
            facts.push(format!("used by: {}", neighbours(&dependents)));
        }
        facts.push(format!(
            "confidence {:.2} (freshness {:.2}, coverage {:.2}, reliability {:.2})",
            record.overall, record.freshness, record.coverage, record.reliability
        ));
        facts.extend(record.caveats.iter().take(2).cloned());

        let mut pack = ContextPack::new(&entity.id)
            .with_summary(format!("{} {} in {}", entity.kind, entity.name, entity.path))
            .with_key_facts(facts)
            .with_related_files(related)
            .with_score(scored.score as f32);

        if let Some(existing) = self.store.get_pack(&pack.id).await? {
            pack.success_count = existing.success_count;
            pack.failure_count = existing.failure_count;
            pack.created_at = existing.created_at;
            if let Some(rate) = existing.success_rate() {
                pack.key_facts.push(format!(
                    "past outcomes: {} succeeded, {} failed ({:.0}% success)",
                    existing.success_count,
                    existing.failure_count,
                    rate * 100.0
                ));
            }
        }

        self.store.save_pack(&pack).await?;
        Ok(pack)
    }

    // ========== Similarity Search ==========

    /// Entities whose embedding is close to the target entity's
    pub async fn find_patterns(&self, target_id: &str) -> Result<SimilarityResult> {
        let Some(target) = self.store.get_embedding(target_id).await? else {
            return Ok(SimilarityResult {
                matches: Vec::new(),
                caveats: vec![format!("'{}' has no embedding", target_id)],
            });
        };
        self.nearest(&target, Some(target_id)).await
    }

    /// Entities close to a free-text pattern
    pub async fn find_examples(&self, pattern: &str) -> Result<SimilarityResult> {
        let query = self.embed_one(pattern).await?;
        self.nearest(&query, None).await
    }

    /// Entities close to a given vector
    pub async fn find_examples_by_embedding(&self, query: &Embedding) -> Result<SimilarityResult> {
        self.nearest(query, None).await
    }

    async fn nearest(&self, query: &Embedding, exclude: Option<&str>) -> Result<SimilarityResult> {
        let (scores, skipped) = self.similarities(query, exclude).await?;
        let threshold = self.config.similarity_threshold;

        let mut matches: Vec<SimilarMatch> = scores
            .into_iter()
            .filter(|(_, similarity)| *similarity >= threshold)
            .map(|(entity_id, similarity)| SimilarMatch {
                entity_id,
                similarity,
            })
            .collect();
        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });

        let mut caveats = Vec::new();
        if skipped > 0 {
            caveats.push(format!(
                "{} embeddings skipped: incompatible with model '{}'",
                skipped, query.model
            ));
        }
        if matches.is_empty() {
            caveats.push(format!("No match reached similarity {:.2}", threshold));
        }
        Ok(SimilarityResult { matches, caveats })
    }

    /// Cosine similarity to every compatible stored embedding
    async fn similarities(
        &self,
        query: &Embedding,
        exclude: Option<&str>,
    ) -> Result<(HashMap<String, f32>, usize)> {
        let mut scores = HashMap::new();
        let mut skipped = 0;
        for (entity_id, embedding) in self.store.list_embeddings().await? {
            if exclude == Some(entity_id.as_str()) {
                continue;
            }
            match query.cosine_similarity(&embedding) {
                Ok(similarity) => {
                    scores.insert(entity_id, similarity);
                }
                Err(Error::DimensionMismatch { .. }) => skipped += 1,
                Err(e) => return Err(e),
            }
        }
        Ok((scores, skipped))
    }

    async fn embed_one(&self, text: &str) -> Result<Embedding> {
        let embedder = self.embedder.as_ref().ok_or_else(|| {
            Error::EmbeddingUnavailable("no embedding provider configured".to_string())
        })?;
        let vectors = embedder.embed(&[text.to_string()]).await?;
        vectors
            .into_iter()
            .next()
            .map(|values| Embedding::new(embedder.model(), values))
            .ok_or_else(|| Error::EmbeddingUnavailable("provider returned no vector".to_string()))
    }

    // ========== Structural Queries ==========

    /// Entities transitively depending on `files`, up to `max_depth` hops
    pub async fn get_blast_radius(&self, files: &[String], max_depth: usize) -> Result<BlastRadius> {
        let graph = self.analytics.snapshot().await?;
        let radius = self.analytics.blast_radius(&graph, files, max_depth);
        if !radius.unknown.is_empty() {
            warn!(unknown = ?radius.unknown, "Blast radius seeds not in graph");
        }
        Ok(radius)
    }

    /// Tests mapped to each file or to the entities it contains
    pub async fn get_test_coverage(&self, files: &[String]) -> Result<TestCoverage> {
        let mut coverage = TestCoverage::default();
        for file in files {
            let mut targets = vec![file.clone()];
            targets.extend(
                self.store
                    .entities_for_path(file)
                    .await?
                    .into_iter()
                    .map(|e| e.id),
            );
            targets.sort();
            targets.dedup();

            let mut tests = BTreeSet::new();
            for target in &targets {
                for rel in self
                    .store
                    .get_relationships(target, Some(RelationshipKind::Tests))
                    .await?
                {
                    if rel.target_id == *target {
                        tests.insert(rel.source_id);
                    }
                }
            }

            if tests.is_empty() {
                coverage.untested.push(file.clone());
            } else {
                coverage.tests.insert(file.clone(), tests.into_iter().collect());
            }
        }
        Ok(coverage)
    }

    /// Transitive dependencies of `files`, bounded by `depth`
    pub async fn expand_scope(&self, files: &[String], depth: usize) -> Result<Vec<AffectedEntity>> {
        let graph = self.analytics.snapshot().await?;
        Ok(expand_scope(&graph, files, depth))
    }

    // ========== Learning Loop ==========

    /// Append an outcome and update the counters of every pack it used
    ///
    /// Outcomes touching the same pack are applied in submission order. An
    /// identical resubmission is acknowledged with `recorded = false` and
    /// changes nothing.
    pub async fn record_outcome(&self, outcome: &OutcomeRecord) -> Result<OutcomeReceipt> {
        if outcome.pack_ids.is_empty() {
            return Err(Error::InvalidInput(
                "an outcome must reference at least one context pack".to_string(),
            ));
        }

        let _guards = self.lock_packs(&outcome.pack_ids).await;

        let mut packs = Vec::with_capacity(outcome.pack_ids.len());
        for pack_id in &outcome.pack_ids {
            let pack = self
                .store
                .get_pack(pack_id)
                .await?
                .ok_or_else(|| Error::PackNotFound(pack_id.clone()))?;
            packs.push(pack);
        }

        let recorded = self.store.record_outcome(outcome).await?;
        let mut receipt = OutcomeReceipt {
            outcome_id: outcome.id.clone(),
            recorded,
            affected_entities: Vec::new(),
        };
        if !recorded {
            return Ok(receipt);
        }

        let affected: BTreeSet<String> = packs.iter().flat_map(|p| p.entity_ids()).collect();
        let (delta, reason) = if outcome.success {
            (1.0, "outcome succeeded".to_string())
        } else {
            (
                -1.0,
                format!(
                    "outcome failed: {}",
                    outcome.failure_reason.as_deref().unwrap_or("unspecified")
                ),
            )
        };
        for entity_id in &affected {
            self.store
                .log_confidence_event(
                    &ConfidenceEvent::new(entity_id.as_str(), delta, reason.as_str())
                        .at(outcome.recorded_at),
                )
                .await?;
        }

        receipt.affected_entities = affected.into_iter().collect();
        self.confidence.invalidate(&receipt.affected_entities);

        info!(
            outcome_id = %outcome.id,
            success = outcome.success,
            packs = outcome.pack_ids.len(),
            entities = receipt.affected_entities.len(),
            "Outcome applied"
        );
        Ok(receipt)
    }

    /// Record a single-pack outcome
    ///
    /// `task_id` identifies the consuming task. Separate tasks must pass
    /// distinct ids to be counted separately; a repeat with the same id (or
    /// with none) is treated as a resubmission.
    pub async fn record_pack_outcome(
        &self,
        pack_id: &str,
        success: bool,
        task_id: Option<&str>,
    ) -> Result<OutcomeReceipt> {
        let mut outcome = OutcomeRecord::new(vec![pack_id.to_string()], success);
        if let Some(task_id) = task_id {
            outcome = outcome.with_task_id(task_id);
        }
        self.record_outcome(&outcome).await
    }

    /// Record that a pack misled its consumer
    pub async fn learn_negative(
        &self,
        pack_id: &str,
        reason: &str,
        task_id: Option<&str>,
    ) -> Result<OutcomeReceipt> {
        let mut outcome = OutcomeRecord::failure(vec![pack_id.to_string()], reason)
            .with_category("negative_feedback");
        if let Some(task_id) = task_id {
            outcome = outcome.with_task_id(task_id);
        }
        self.record_outcome(&outcome).await
    }

    /// Per-pack locks, taken in sorted order
    async fn lock_packs(&self, pack_ids: &[String]) -> Vec<OwnedMutexGuard<()>> {
        let mut ids: Vec<&String> = pack_ids.iter().collect();
        ids.sort();
        ids.dedup();

        let locks: Vec<Arc<tokio::sync::Mutex<()>>> = {
            let mut map = self
                .pack_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            ids.iter()
                .map(|id| map.entry((*id).clone()).or_default().clone())
                .collect()
        };

        let mut guards = Vec::with_capacity(locks.len());
        for lock in locks {
            guards.push(lock.lock_owned().await);
        }
        guards
    }
}

/// Drop related files, then key facts, from the end until the pack fits.
/// Returns whether it fits.
fn trim_to_budget(pack: &mut ContextPack, max_tokens: usize) -> bool {
    while pack.estimated_tokens() > max_tokens {
        if pack.related_files.pop().is_none() && pack.key_facts.pop().is_none() {
            return false;
        }
    }
    true
}

/// Lowercased alphanumeric terms of at least two characters
fn terms(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2)
        .map(str::to_lowercase)
        .collect()
}

/// Share of intent terms found in the entity's id, name or signature
fn lexical_overlap(intent: &BTreeSet<String>, entity: &CodeEntity) -> f64 {
    if intent.is_empty() {
        return 0.0;
    }
    let mut text = format!("{} {}", entity.id, entity.name);
    if let Some(signature) = &entity.signature {
        text.push(' ');
        text.push_str(signature);
    }
    let entity_terms = terms(&text);
    let hits = intent.iter().filter(|t| entity_terms.contains(*t)).count();
    hits as f64 / intent.len() as f64
}

fn neighbours(ids: &[&str]) -> String {
    let mut listed = ids
        .iter()
        .take(MAX_FACT_NEIGHBOURS)
        .copied()
        .collect::<Vec<_>>()
        .join(", ");
    if ids.len() > MAX_FACT_NEIGHBOURS {
        listed.push_str(&format!(" (+{} more)", ids.len() - MAX_FACT_NEIGHBOURS));
    }
    listed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confidence::ConfidenceConfig;
    use crate::domain::knowledge::Relationship;
    use crate::infrastructure::knowledge::SqliteKnowledgeStore;
    use crate::storage::Database;
    use async_trait::async_trait;

    struct FixedProvider(Vec<f32>);

    #[async_trait]
    impl EmbeddingProvider for FixedProvider {
        fn model(&self) -> &str {
            "fixed"
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| self.0.clone()).collect())
        }
    }

    async fn engine() -> (Arc<dyn KnowledgeStore>, RelevanceEngine) {
        let db = Database::in_memory().await.expect("db");
        let store: Arc<dyn KnowledgeStore> = Arc::new(SqliteKnowledgeStore::new(db.pool().clone()));
        let analytics = Arc::new(GraphAnalytics::new(store.clone()));
        let confidence = Arc::new(ConfidenceModel::new(store.clone(), ConfidenceConfig::default()));
        let engine = RelevanceEngine::new(
            store.clone(),
            analytics,
            confidence,
            RelevanceConfig::default(),
        );
        (store, engine)
    }

    async fn seed_auth(store: &Arc<dyn KnowledgeStore>) {
        for (id, content) in [
            ("src/auth/login.rs", "login"),
            ("src/auth/session.rs", "session"),
            ("src/auth/token.rs", "token"),
            ("src/billing.rs", "billing"),
        ] {
            store
                .upsert_entity(&CodeEntity::module(id).with_content(content))
                .await
                .unwrap();
        }
        store
            .upsert_relationship(&Relationship::imports("src/auth/login.rs", "src/auth/session.rs"))
            .await
            .unwrap();
        store
            .upsert_relationship(&Relationship::imports("src/auth/session.rs", "src/auth/token.rs"))
            .await
            .unwrap();
    }

    #[test]
    fn test_terms_and_overlap() {
        let intent = terms("Fix the auth login");
        assert!(intent.contains("auth"));
        assert!(!intent.contains("a"));
        let entity = CodeEntity::module("src/auth/login.rs");
        assert_eq!(lexical_overlap(&intent, &entity), 0.5);
    }

    #[tokio::test]
    async fn test_empty_store_has_caveat() {
        let (_, engine) = engine().await;
        let result = engine
            .query("anything", QueryDepth::L0, &Budget::default())
            .await
            .unwrap();
        assert!(result.is_empty());
        assert!(!result.caveats.is_empty());
    }

    #[tokio::test]
    async fn test_l0_ranks_lexical_matches() {
        let (store, engine) = engine().await;
        seed_auth(&store).await;

        let result = engine
            .query("auth session", QueryDepth::L0, &Budget::default())
            .await
            .unwrap();

        assert_eq!(result.packs[0].target_entity_id, "src/auth/session.rs");
        assert!(result.packs.iter().all(|p| p.target_entity_id != "src/billing.rs"));
        assert!(!result.truncated);
        assert!(store.get_pack(&result.packs[0].id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_max_files_truncates() {
        let (store, engine) = engine().await;
        seed_auth(&store).await;

        let result = engine
            .query("auth", QueryDepth::L0, &Budget::default().with_max_files(2))
            .await
            .unwrap();
        assert_eq!(result.packs.len(), 2);
        assert!(result.truncated);
        assert_eq!(result.ranked.len(), 3);
    }

    #[tokio::test]
    async fn test_token_budget_truncates() {
        let (store, engine) = engine().await;
        seed_auth(&store).await;

        let full = engine
            .query("auth", QueryDepth::L0, &Budget::default())
            .await
            .unwrap();
        let first = full.packs[0].estimated_tokens();

        let result = engine
            .query("auth", QueryDepth::L0, &Budget::default().with_max_tokens(first))
            .await
            .unwrap();
        assert_eq!(result.packs.len(), 1);
        assert!(result.truncated);
        assert_eq!(result.tokens_used, first);
    }

    #[tokio::test]
    async fn test_oversized_top_pack_is_trimmed_not_dropped() {
        let (store, engine) = engine().await;
        seed_auth(&store).await;

        let result = engine
            .query("auth", QueryDepth::L0, &Budget::default().with_max_tokens(1))
            .await
            .unwrap();
        assert_eq!(result.packs.len(), 1);
        assert!(result.truncated);
        assert!(result.packs[0].related_files.is_empty());
        assert!(result.packs[0].key_facts.is_empty());
        assert!(result.caveats.iter().any(|c| c.contains("over the 1 token budget")));

        let top = &result.packs[0];
        let mut roomy = top.clone();
        roomy.key_facts.push("fact".to_string());
        let budget = roomy.estimated_tokens();
        let mut trimmed = roomy.clone();
        trimmed.related_files.push("src/x.rs".to_string());
        assert!(trim_to_budget(&mut trimmed, budget));
        assert!(trimmed.related_files.is_empty());
        assert_eq!(trimmed.key_facts, vec!["fact".to_string()]);
    }

    #[tokio::test]
    async fn test_no_match_is_explicit() {
        let (store, engine) = engine().await;
        seed_auth(&store).await;

        let result = engine
            .query("kubernetes", QueryDepth::L0, &Budget::default())
            .await
            .unwrap();
        assert!(result.is_empty());
        assert!(result.caveats.iter().any(|c| c.contains("kubernetes")));
    }

    #[tokio::test]
    async fn test_l1_without_provider_fails() {
        let (store, engine) = engine().await;
        seed_auth(&store).await;

        let err = engine
            .query("auth", QueryDepth::L1, &Budget::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmbeddingUnavailable(_)));
    }

    #[tokio::test]
    async fn test_find_patterns_excludes_target_and_mismatched_models() {
        let (store, engine) = engine().await;
        seed_auth(&store).await;
        store
            .save_embedding("src/auth/login.rs", &Embedding::new("fixed", vec![1.0, 0.0]))
            .await
            .unwrap();
        store
            .save_embedding("src/auth/session.rs", &Embedding::new("fixed", vec![0.9, 0.1]))
            .await
            .unwrap();
        store
            .save_embedding("src/auth/token.rs", &Embedding::new("other", vec![1.0, 0.0]))
            .await
            .unwrap();

        let result = engine.find_patterns("src/auth/login.rs").await.unwrap();
        assert_eq!(result.matches.len(), 1);
        assert_eq!(result.matches[0].entity_id, "src/auth/session.rs");
        assert!(result.caveats.iter().any(|c| c.contains("incompatible")));
    }

    #[tokio::test]
    async fn test_l1_uses_embeddings() {
        let (store, engine) = engine().await;
        seed_auth(&store).await;
        let engine = engine.with_embedder(Arc::new(FixedProvider(vec![0.0, 1.0])));
        store
            .save_embedding("src/billing.rs", &Embedding::new("fixed", vec![0.0, 1.0]))
            .await
            .unwrap();

        let result = engine
            .query("invoices", QueryDepth::L1, &Budget::default())
            .await
            .unwrap();
        assert_eq!(result.packs.len(), 1);
        assert_eq!(result.packs[0].target_entity_id, "src/billing.rs");
    }

    #[tokio::test]
    async fn test_test_coverage() {
        let (store, engine) = engine().await;
        seed_auth(&store).await;
        store
            .upsert_relationship(&Relationship::tests("tests/login.rs", "src/auth/login.rs"))
            .await
            .unwrap();

        let coverage = engine
            .get_test_coverage(&["src/auth/login.rs".to_string(), "src/billing.rs".to_string()])
            .await
            .unwrap();
        assert_eq!(
            coverage.tests.get("src/auth/login.rs"),
            Some(&vec!["tests/login.rs".to_string()])
        );
        assert_eq!(coverage.untested, vec!["src/billing.rs".to_string()]);
        assert_eq!(coverage.ratio(), 0.5);
    }

    #[tokio::test]
    async fn test_outcome_updates_counters_once() {
        let (store, engine) = engine().await;
        seed_auth(&store).await;
        let result = engine
            .query("login", QueryDepth::L0, &Budget::default())
            .await
            .unwrap();
        let pack_id = result.packs[0].id.clone();

        let outcome = OutcomeRecord::success(vec![pack_id.clone()]).with_task_id("task-1");
        let first = engine.record_outcome(&outcome).await.unwrap();
        assert!(first.recorded);
        assert!(first.affected_entities.contains(&"src/auth/login.rs".to_string()));

        let duplicate = OutcomeRecord::success(vec![pack_id.clone()]).with_task_id("task-1");
        let second = engine.record_outcome(&duplicate).await.unwrap();
        assert!(!second.recorded);

        let pack = store.get_pack(&pack_id).await.unwrap().unwrap();
        assert_eq!(pack.success_count, 1);
        assert_eq!(pack.failure_count, 0);

        let history = store.confidence_history("src/auth/login.rs", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].delta, 1.0);
    }

    #[tokio::test]
    async fn test_separate_tasks_on_one_pack_all_count() {
        let (store, engine) = engine().await;
        seed_auth(&store).await;
        let result = engine
            .query("login", QueryDepth::L0, &Budget::default())
            .await
            .unwrap();
        let pack_id = result.packs[0].id.clone();
        let target = result.packs[0].target_entity_id.clone();

        let before = engine.confidence.qualify(&target).await.unwrap().reliability;
        assert!(engine.record_pack_outcome(&pack_id, true, Some("task-1")).await.unwrap().recorded);
        let once = engine.confidence.qualify(&target).await.unwrap().reliability;
        assert!(engine.record_pack_outcome(&pack_id, true, Some("task-2")).await.unwrap().recorded);
        let twice = engine.confidence.qualify(&target).await.unwrap().reliability;
        assert!(!engine.record_pack_outcome(&pack_id, true, Some("task-2")).await.unwrap().recorded);

        let pack = store.get_pack(&pack_id).await.unwrap().unwrap();
        assert_eq!(pack.success_count, 2);
        assert!(before < once && once < twice);

        let by_files = OutcomeRecord::success(vec![pack_id.clone()])
            .with_files_modified(vec!["src/auth/login.rs".into()]);
        assert!(engine.record_outcome(&by_files).await.unwrap().recorded);
        assert_eq!(store.get_pack(&pack_id).await.unwrap().unwrap().success_count, 3);
    }

    #[tokio::test]
    async fn test_learn_negative() {
        let (store, engine) = engine().await;
        seed_auth(&store).await;
        let result = engine
            .query("token", QueryDepth::L0, &Budget::default())
            .await
            .unwrap();
        let pack_id = result.packs[0].id.clone();

        engine
            .learn_negative(&pack_id, "pointed at the wrong module", None)
            .await
            .unwrap();
        let pack = store.get_pack(&pack_id).await.unwrap().unwrap();
        assert_eq!(pack.failure_count, 1);

        let err = engine.learn_negative("pack-missing", "nope", None).await.unwrap_err();
        assert!(matches!(err, Error::PackNotFound(_)));
    }
}
