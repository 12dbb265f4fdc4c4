//! Query pipeline
//!
//! Routes a [`QueryRequest`] through the cache, the relevance engine and
//! (optionally) the constraint and meta engines, then splits the ranked packs
//! into response tiers. Every stage runs under a timeout; a stage that runs
//! out of time leaves a caveat and marks the response partial instead of
//! failing the request. Partial responses are never cached.
//!
//! File-change and outcome notifications arrive either through direct calls
//! or as [`KnowledgeEvent`]s on a channel drained by [`QueryPipeline::spawn_event_loop`].

pub mod request;
pub mod tiering;

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, QueryCache};
use crate::confidence::{ConfidenceModel, ConfidenceRecord};
use crate::domain::knowledge::{CacheEntry, ContextPack, KnowledgeEvent, KnowledgeStore, OutcomeRecord};
use crate::embedding::{EmbedReport, EmbeddingCoordinator};
use crate::engines::constraint::{ApplicableConstraint, ConstraintExplanation, ValidationReport};
use crate::engines::meta::{BlindSpot, Expert, RiskAssessment};
use crate::engines::relevance::{OutcomeReceipt, RelevanceResult, ScoredEntity, SimilarityResult, TestCoverage};
use crate::engines::{Budget, ConstraintEngine, MetaEngine, QueryDepth, RelevanceEngine};
use crate::error::{Error, Result};
use crate::graph::{ArchitectureSummary, BlastRadius, GraphAnalytics};

pub use request::{KnowledgeQuery, QueryRequest};
pub use tiering::{TierSplit, Tiers};

/// Per-depth pack limit and cache lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthProfile {
    pub max_files: usize,
    pub ttl_secs: u64,
}

/// Pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Used when a request carries no budget
    pub default_timeout_ms: u64,
    /// Per-engine limit when engine reports are requested
    pub engine_timeout_ms: u64,
    pub max_tokens: usize,
    pub max_depth: usize,
    pub l0: DepthProfile,
    pub l1: DepthProfile,
    pub l2: DepthProfile,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            engine_timeout_ms: 2_000,
            max_tokens: 12_000,
            max_depth: 2,
            l0: DepthProfile {
                max_files: 3,
                ttl_secs: 60,
            },
            l1: DepthProfile {
                max_files: 8,
                ttl_secs: 300,
            },
            l2: DepthProfile {
                max_files: 15,
                ttl_secs: 900,
            },
        }
    }
}

impl PipelineConfig {
    pub fn profile(&self, depth: QueryDepth) -> DepthProfile {
        match depth {
            QueryDepth::L0 => self.l0,
            QueryDepth::L1 => self.l1,
            QueryDepth::L2 => self.l2,
        }
    }

    /// Budget for a request: its own, or one derived from the depth profile.
    /// Either way `max_files` never exceeds the profile.
    pub fn budget_for(&self, request: &QueryRequest) -> Budget {
        let profile = self.profile(request.depth);
        let budget = request.budget.unwrap_or(Budget {
            max_files: profile.max_files,
            max_tokens: self.max_tokens,
            max_depth: self.max_depth,
            timeout_ms: self.default_timeout_ms,
        });
        budget.with_max_files(budget.max_files.min(profile.max_files))
    }
}

/// Engine reports attached on request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineReport {
    /// Full ranking behind the returned packs
    pub relevance: Vec<ScoredEntity>,
    pub constraints: Option<Vec<ApplicableConstraint>>,
    pub meta: Option<RiskAssessment>,
    pub blast_radius: Option<BlastRadius>,
}

/// Tiered answer to a context query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub fingerprint: String,
    pub depth: QueryDepth,
    pub essential: Vec<ContextPack>,
    pub contextual: Vec<ContextPack>,
    pub reference: Vec<ContextPack>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engines: Option<EngineReport>,
    pub caveats: Vec<String>,
    /// A stage ran out of time
    pub partial: bool,
    /// The budget dropped ranked packs
    pub truncated: bool,
    pub tokens_used: usize,
    /// Served from the cache
    #[serde(default)]
    pub cached: bool,
}

impl QueryResponse {
    pub fn pack_count(&self) -> usize {
        self.essential.len() + self.contextual.len() + self.reference.len()
    }

    /// All packs, essential first
    pub fn packs(&self) -> impl Iterator<Item = &ContextPack> {
        self.essential
            .iter()
            .chain(&self.contextual)
            .chain(&self.reference)
    }
}

/// Answer to a [`KnowledgeQuery`], one variant per query kind
#[derive(Debug, Clone)]
pub enum KnowledgeAnswer {
    Context(QueryResponse),
    BlastRadius(BlastRadius),
    TestCoverage(TestCoverage),
    Similar(SimilarityResult),
    Applicable(Vec<ApplicableConstraint>),
    Validation(ValidationReport),
    Explanation(ConstraintExplanation),
    Confidence(ConfidenceRecord),
    Risk(RiskAssessment),
    BlindSpots(Vec<BlindSpot>),
    Experts(Vec<Expert>),
    Architecture(ArchitectureSummary),
}

/// Components the pipeline is assembled from
pub struct PipelineComponents {
    pub store: Arc<dyn KnowledgeStore>,
    pub cache: Arc<dyn QueryCache>,
    pub analytics: Arc<GraphAnalytics>,
    pub confidence: Arc<ConfidenceModel>,
    pub relevance: Arc<RelevanceEngine>,
    pub constraints: Arc<ConstraintEngine>,
    pub meta: Arc<MetaEngine>,
    /// Absent when no embedding provider is configured
    pub embeddings: Option<Arc<EmbeddingCoordinator>>,
}

pub struct QueryPipeline {
    store: Arc<dyn KnowledgeStore>,
    cache: Arc<dyn QueryCache>,
    analytics: Arc<GraphAnalytics>,
    confidence: Arc<ConfidenceModel>,
    relevance: Arc<RelevanceEngine>,
    constraints: Arc<ConstraintEngine>,
    meta: Arc<MetaEngine>,
    embeddings: Option<Arc<EmbeddingCoordinator>>,
    config: PipelineConfig,
}

/// Headroom past the budget before the relevance stage is abandoned. The
/// engine honours the budget itself and keeps finished packs; this only
/// catches a stage stuck in a single store call.
const RELEVANCE_GRACE: Duration = Duration::from_millis(250);

/// Outcome of one stage under a timeout
enum Stage<T> {
    Done(T),
    Failed(Error),
    TimedOut,
}

async fn staged<T>(limit: Duration, fut: impl Future<Output = Result<T>>) -> Stage<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Stage::Done(value),
        Ok(Err(e)) => Stage::Failed(e),
        Err(_) => Stage::TimedOut,
    }
}

impl QueryPipeline {
    pub fn new(components: PipelineComponents, config: PipelineConfig) -> Self {
        Self {
            store: components.store,
            cache: components.cache,
            analytics: components.analytics,
            confidence: components.confidence,
            relevance: components.relevance,
            constraints: components.constraints,
            meta: components.meta,
            embeddings: components.embeddings,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // ========== Queries ==========

    /// Answer a context query, from the cache when a live entry exists
    pub async fn query(&self, request: &QueryRequest) -> Result<QueryResponse> {
        if request.intent.trim().is_empty() {
            return Err(Error::InvalidInput("Query intent must not be empty".to_string()));
        }

        let fingerprint = request.fingerprint();
        if let Some(entry) = self.cache.get(&fingerprint).await {
            match serde_json::from_value::<QueryResponse>(entry.response) {
                Ok(mut response) => {
                    response.cached = true;
                    debug!(fingerprint = %fingerprint, "Query served from cache");
                    return Ok(response);
                }
                Err(e) => {
                    warn!(fingerprint = %fingerprint, error = %e, "Cached response unreadable, recomputing");
                    if let Err(e) = self.cache.invalidate(&fingerprint).await {
                        warn!(fingerprint = %fingerprint, error = %e, "Failed to drop unreadable cache entry");
                    }
                }
            }
        }

        let budget = self.config.budget_for(request);
        let relevance = match staged(
            budget.timeout() + RELEVANCE_GRACE,
            self.relevance.query(&request.intent, request.depth, &budget),
        )
        .await
        {
            Stage::Done(result) => result,
            Stage::Failed(e) => return Err(e),
            Stage::TimedOut => {
                let mut result = RelevanceResult {
                    partial: true,
                    ..RelevanceResult::default()
                };
                result.caveats.push(format!(
                    "Relevance timed out after {} ms; no packs assembled",
                    budget.timeout_ms
                ));
                result
            }
        };

        let mut caveats = relevance.caveats.clone();
        let mut partial = relevance.partial;
        let engines = if request.include_engines {
            let (report, engine_caveats, timed_out) =
                self.run_engines(request, &relevance, &budget).await?;
            caveats.extend(engine_caveats);
            partial |= timed_out;
            Some(report)
        } else {
            None
        };

        let dependencies = dependencies_of(request, &relevance);
        let tiers = tiering::tier(relevance.packs);
        let response = QueryResponse {
            fingerprint: fingerprint.clone(),
            depth: request.depth,
            essential: tiers.essential,
            contextual: tiers.contextual,
            reference: tiers.reference,
            engines,
            caveats,
            partial,
            truncated: relevance.truncated,
            tokens_used: relevance.tokens_used,
            cached: false,
        };

        if response.partial {
            debug!(fingerprint = %fingerprint, "Partial response not cached");
        } else {
            self.store_response(request, &response, dependencies).await;
        }

        info!(
            fingerprint = %fingerprint,
            depth = request.depth.as_str(),
            packs = response.pack_count(),
            partial = response.partial,
            truncated = response.truncated,
            "Query answered"
        );
        Ok(response)
    }

    async fn store_response(&self, request: &QueryRequest, response: &QueryResponse, dependencies: Vec<String>) {
        let ttl = Duration::from_secs(self.config.profile(request.depth).ttl_secs);
        let value = match serde_json::to_value(response) {
            Ok(value) => value,
            Err(e) => {
                warn!(fingerprint = %response.fingerprint, error = %e, "Response not cacheable");
                return;
            }
        };
        let entry = CacheEntry::new(&response.fingerprint, request.normalized_params(), value, ttl)
            .with_dependencies(dependencies);
        if let Err(e) = self.cache.set(entry).await {
            warn!(fingerprint = %response.fingerprint, error = %e, "Failed to cache response");
        }
    }

    /// Constraint, risk and blast-radius reports, fanned out concurrently.
    /// Returns the report, caveats for failed stages and whether any timed out.
    async fn run_engines(
        &self,
        request: &QueryRequest,
        relevance: &RelevanceResult,
        budget: &Budget,
    ) -> Result<(EngineReport, Vec<String>, bool)> {
        let scope: Vec<String> = if request.affected_files.is_empty() {
            ranked_paths(relevance)
        } else {
            request.affected_files.clone()
        };
        let limit = Duration::from_millis(self.config.engine_timeout_ms);

        let (constraints, meta, blast) = tokio::join!(
            staged(limit, self.constraints.get_applicable(&scope)),
            staged(limit, self.meta.assess_risk(&scope)),
            staged(limit, self.relevance.get_blast_radius(&scope, budget.max_depth)),
        );

        let mut caveats = Vec::new();
        let mut timed_out = false;
        let mut report = EngineReport {
            relevance: relevance.ranked.clone(),
            ..EngineReport::default()
        };
        report.constraints = settle("constraint", constraints, &mut caveats, &mut timed_out)?;
        report.meta = settle("meta", meta, &mut caveats, &mut timed_out)?;
        report.blast_radius = settle("blast radius", blast, &mut caveats, &mut timed_out)?;
        Ok((report, caveats, timed_out))
    }

    /// Dispatch any knowledge query
    pub async fn execute(&self, query: KnowledgeQuery) -> Result<KnowledgeAnswer> {
        debug!(kind = query.kind(), "Dispatching knowledge query");
        let answer = match query {
            KnowledgeQuery::Context(request) => KnowledgeAnswer::Context(self.query(&request).await?),
            KnowledgeQuery::BlastRadius { files, max_depth } => {
                KnowledgeAnswer::BlastRadius(self.relevance.get_blast_radius(&files, max_depth).await?)
            }
            KnowledgeQuery::TestCoverage { files } => {
                KnowledgeAnswer::TestCoverage(self.relevance.get_test_coverage(&files).await?)
            }
            KnowledgeQuery::SimilarPatterns { target_id } => {
                KnowledgeAnswer::Similar(self.relevance.find_patterns(&target_id).await?)
            }
            KnowledgeQuery::FindExamples { pattern } => {
                KnowledgeAnswer::Similar(self.relevance.find_examples(&pattern).await?)
            }
            KnowledgeQuery::ApplicableConstraints { files } => {
                KnowledgeAnswer::Applicable(self.constraints.get_applicable(&files).await?)
            }
            KnowledgeQuery::ValidateChanges { changes } => {
                KnowledgeAnswer::Validation(self.constraints.validate_batch(&changes).await?)
            }
            KnowledgeQuery::ExplainConstraint { id } => {
                KnowledgeAnswer::Explanation(self.constraints.explain(&id).await?)
            }
            KnowledgeQuery::Qualify { id, target } => {
                KnowledgeAnswer::Confidence(self.meta.qualify(&id, target).await?)
            }
            KnowledgeQuery::AssessRisk { files } => KnowledgeAnswer::Risk(self.meta.assess_risk(&files).await?),
            KnowledgeQuery::BlindSpots => KnowledgeAnswer::BlindSpots(self.meta.get_blind_spots().await?),
            KnowledgeQuery::Experts { file } => KnowledgeAnswer::Experts(self.meta.get_experts(&file).await?),
            KnowledgeQuery::Architecture { top } => {
                let graph = self.analytics.snapshot().await?;
                KnowledgeAnswer::Architecture(self.analytics.architecture_summary(&graph, top))
            }
        };
        Ok(answer)
    }

    // ========== Learning Loop ==========

    /// Record an outcome and drop cached answers built on the packs it covers
    pub async fn record_outcome(&self, outcome: &OutcomeRecord) -> Result<OutcomeReceipt> {
        let receipt = self.relevance.record_outcome(outcome).await?;
        if receipt.recorded {
            let mut evicted = 0;
            for entity_id in &receipt.affected_entities {
                evicted += self.cache.invalidate_dependents(entity_id).await?.len();
            }
            debug!(
                outcome_id = %receipt.outcome_id,
                evicted,
                "Cache invalidated after outcome"
            );
        }
        Ok(receipt)
    }

    // ========== Notifications ==========

    /// A file changed: evict dependent answers, forget derived scores and
    /// queue its entities for re-embedding
    pub async fn file_changed(&self, path: &str) -> Result<Vec<String>> {
        let evicted = self.cache.invalidate_dependents(path).await?;
        self.analytics.invalidate();

        let mut ids: Vec<String> = self
            .store
            .entities_for_path(path)
            .await?
            .into_iter()
            .map(|e| e.id)
            .collect();
        if ids.is_empty() {
            ids.push(path.to_string());
        }
        self.confidence.invalidate(&ids);

        let scheduled = match &self.embeddings {
            Some(coordinator) => coordinator.schedule(ids),
            None => 0,
        };
        debug!(path = %path, evicted = evicted.len(), scheduled, "File change processed");
        Ok(evicted)
    }

    pub async fn files_changed(&self, paths: &[String]) -> Result<Vec<String>> {
        let mut evicted = BTreeSet::new();
        for path in paths {
            evicted.extend(self.file_changed(path).await?);
        }
        Ok(evicted.into_iter().collect())
    }

    /// Apply one event; `false` once the event asks the loop to stop
    pub async fn handle_event(&self, event: KnowledgeEvent) -> Result<bool> {
        debug!(event_type = event.event_type_name(), "Knowledge event received");
        match event {
            KnowledgeEvent::FileChanged { path, .. } => {
                self.file_changed(&path).await?;
            }
            KnowledgeEvent::FilesChanged { paths, .. } => {
                self.files_changed(&paths).await?;
            }
            KnowledgeEvent::OutcomeSubmitted { outcome, .. } => {
                self.record_outcome(&outcome).await?;
            }
            KnowledgeEvent::Shutdown { .. } => return Ok(false),
        }
        Ok(true)
    }

    /// Drain events until the channel closes or a shutdown event arrives
    pub fn spawn_event_loop(self: Arc<Self>, mut events: mpsc::Receiver<KnowledgeEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Knowledge event loop started");
            while let Some(event) = events.recv().await {
                let event_type = event.event_type_name();
                match self.handle_event(event).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => warn!(event_type, error = %e, "Knowledge event failed"),
                }
            }
            info!("Knowledge event loop stopped");
        })
    }

    /// Embed entities queued by file changes
    pub async fn process_pending_embeddings(&self) -> Result<EmbedReport> {
        match &self.embeddings {
            Some(coordinator) => coordinator.process_pending().await,
            None => Ok(EmbedReport::default()),
        }
    }

    // ========== Maintenance ==========

    /// Drop every cached answer and derived score
    pub async fn invalidate_all(&self) -> Result<u64> {
        let cleared = self.cache.clear().await?;
        self.analytics.invalidate();
        self.confidence.invalidate_all();
        info!(cleared, "All cached knowledge invalidated");
        Ok(cleared)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

fn settle<T>(
    stage: &str,
    outcome: Stage<T>,
    caveats: &mut Vec<String>,
    timed_out: &mut bool,
) -> Result<Option<T>> {
    match outcome {
        Stage::Done(value) => Ok(Some(value)),
        Stage::Failed(e) if e.is_fatal() => Err(e),
        Stage::Failed(e) => {
            caveats.push(format!("{} report unavailable: {}", stage, e));
            Ok(None)
        }
        Stage::TimedOut => {
            *timed_out = true;
            caveats.push(format!("{} report timed out", stage));
            Ok(None)
        }
    }
}

/// Paths of the entities behind the returned packs
fn ranked_paths(relevance: &RelevanceResult) -> Vec<String> {
    let targets: BTreeSet<&str> = relevance
        .packs
        .iter()
        .map(|p| p.target_entity_id.as_str())
        .collect();
    relevance
        .ranked
        .iter()
        .filter(|s| targets.contains(s.entity_id.as_str()))
        .map(|s| s.path.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Files whose change makes a cached answer stale
fn dependencies_of(request: &QueryRequest, relevance: &RelevanceResult) -> Vec<String> {
    let mut deps: BTreeSet<String> = request.affected_files.iter().cloned().collect();
    deps.extend(ranked_paths(relevance));
    for pack in &relevance.packs {
        deps.insert(pack.target_entity_id.clone());
        deps.extend(pack.related_files.iter().cloned());
    }
    deps.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, TieredCache};
    use crate::confidence::ConfidenceConfig;
    use crate::domain::knowledge::{
        CodeEntity, ConfidenceEvent, Constraint, Embedding, ObservedPattern, Relationship,
        RelationshipKind, StoreStats, UpsertOutcome,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use crate::engines::{ConstraintConfig, MetaConfig, RelevanceConfig};
    use crate::infrastructure::knowledge::SqliteKnowledgeStore;
    use crate::storage::Database;

    async fn pipeline() -> (Arc<dyn KnowledgeStore>, QueryPipeline) {
        let db = Database::in_memory().await.expect("db");
        let store: Arc<dyn KnowledgeStore> = Arc::new(SqliteKnowledgeStore::new(db.pool().clone()));
        (store.clone(), pipeline_over(store))
    }

    fn pipeline_over(store: Arc<dyn KnowledgeStore>) -> QueryPipeline {
        let analytics = Arc::new(GraphAnalytics::new(store.clone()));
        let confidence = Arc::new(ConfidenceModel::new(store.clone(), ConfidenceConfig::default()));
        let components = PipelineComponents {
            store: store.clone(),
            cache: Arc::new(TieredCache::new(store.clone(), &CacheConfig::default())),
            analytics: analytics.clone(),
            confidence: confidence.clone(),
            relevance: Arc::new(RelevanceEngine::new(
                store.clone(),
                analytics,
                confidence.clone(),
                RelevanceConfig::default(),
            )),
            constraints: Arc::new(ConstraintEngine::new(store.clone(), ConstraintConfig::default())),
            meta: Arc::new(MetaEngine::new(store.clone(), confidence, MetaConfig::default())),
            embeddings: None,
        };
        QueryPipeline::new(components, PipelineConfig::default())
    }

    /// SQLite store whose pack writes take `delay`
    struct SlowPackStore {
        inner: SqliteKnowledgeStore,
        delay: Duration,
    }

    #[async_trait]
    impl KnowledgeStore for SlowPackStore {
        async fn upsert_entity(&self, entity: &CodeEntity) -> Result<UpsertOutcome> {
            self.inner.upsert_entity(entity).await
        }
        async fn get_entity(&self, id: &str) -> Result<Option<CodeEntity>> {
            self.inner.get_entity(id).await
        }
        async fn list_entities(&self, include_tombstoned: bool) -> Result<Vec<CodeEntity>> {
            self.inner.list_entities(include_tombstoned).await
        }
        async fn entities_for_path(&self, path: &str) -> Result<Vec<CodeEntity>> {
            self.inner.entities_for_path(path).await
        }
        async fn tombstone_entity(&self, id: &str) -> Result<bool> {
            self.inner.tombstone_entity(id).await
        }
        async fn upsert_relationship(&self, relationship: &Relationship) -> Result<()> {
            self.inner.upsert_relationship(relationship).await
        }
        async fn get_relationships(
            &self,
            entity_id: &str,
            kind: Option<RelationshipKind>,
        ) -> Result<Vec<Relationship>> {
            self.inner.get_relationships(entity_id, kind).await
        }
        async fn list_relationships(&self, kind: Option<RelationshipKind>) -> Result<Vec<Relationship>> {
            self.inner.list_relationships(kind).await
        }
        async fn save_embedding(&self, entity_id: &str, embedding: &Embedding) -> Result<()> {
            self.inner.save_embedding(entity_id, embedding).await
        }
        async fn get_embedding(&self, entity_id: &str) -> Result<Option<Embedding>> {
            self.inner.get_embedding(entity_id).await
        }
        async fn list_embeddings(&self) -> Result<Vec<(String, Embedding)>> {
            self.inner.list_embeddings().await
        }
        async fn get_cached(&self, fingerprint: &str) -> Result<Option<CacheEntry>> {
            self.inner.get_cached(fingerprint).await
        }
        async fn set_cached(&self, entry: &CacheEntry) -> Result<()> {
            self.inner.set_cached(entry).await
        }
        async fn delete_cached(&self, fingerprint: &str) -> Result<bool> {
            self.inner.delete_cached(fingerprint).await
        }
        async fn invalidate_dependents(&self, path: &str) -> Result<Vec<String>> {
            self.inner.invalidate_dependents(path).await
        }
        async fn clear_cache(&self) -> Result<u64> {
            self.inner.clear_cache().await
        }
        async fn prune_expired(&self, now: DateTime<Utc>) -> Result<u64> {
            self.inner.prune_expired(now).await
        }
        async fn save_pack(&self, pack: &ContextPack) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.save_pack(pack).await
        }
        async fn get_pack(&self, id: &str) -> Result<Option<ContextPack>> {
            self.inner.get_pack(id).await
        }
        async fn list_packs(&self) -> Result<Vec<ContextPack>> {
            self.inner.list_packs().await
        }
        async fn record_outcome(&self, outcome: &OutcomeRecord) -> Result<bool> {
            self.inner.record_outcome(outcome).await
        }
        async fn list_outcomes(&self) -> Result<Vec<OutcomeRecord>> {
            self.inner.list_outcomes().await
        }
        async fn outcomes_for_entity(&self, entity_id: &str) -> Result<Vec<OutcomeRecord>> {
            self.inner.outcomes_for_entity(entity_id).await
        }
        async fn outcomes_for_pack(&self, pack_id: &str) -> Result<Vec<OutcomeRecord>> {
            self.inner.outcomes_for_pack(pack_id).await
        }
        async fn log_confidence_event(&self, event: &ConfidenceEvent) -> Result<()> {
            self.inner.log_confidence_event(event).await
        }
        async fn confidence_history(
            &self,
            entity_id: &str,
            limit: usize,
        ) -> Result<Vec<ConfidenceEvent>> {
            self.inner.confidence_history(entity_id, limit).await
        }
        async fn save_constraint(&self, constraint: &Constraint) -> Result<()> {
            self.inner.save_constraint(constraint).await
        }
        async fn get_constraint(&self, id: &str) -> Result<Option<Constraint>> {
            self.inner.get_constraint(id).await
        }
        async fn list_constraints(&self) -> Result<Vec<Constraint>> {
            self.inner.list_constraints().await
        }
        async fn clear_expired_exceptions(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
            self.inner.clear_expired_exceptions(now).await
        }
        async fn record_pattern(&self, pattern: &ObservedPattern) -> Result<u32> {
            self.inner.record_pattern(pattern).await
        }
        async fn get_pattern(&self, pattern_key: &str) -> Result<Option<ObservedPattern>> {
            self.inner.get_pattern(pattern_key).await
        }
        async fn stats(&self) -> Result<StoreStats> {
            self.inner.stats().await
        }
        async fn health_check(&self) -> Result<()> {
            self.inner.health_check().await
        }
    }

    async fn seed(store: &Arc<dyn KnowledgeStore>) {
        for name in ["retry", "retry_policy", "retry_budget", "retry_metrics", "http_client"] {
            let path = format!("src/{name}.rs");
            store
                .upsert_entity(&CodeEntity::module(&path).with_content(&format!("retry logic for {name}")))
                .await
                .unwrap();
        }
        store
            .upsert_relationship(&Relationship::imports("src/http_client.rs", "src/retry.rs"))
            .await
            .unwrap();
    }

    #[test]
    fn test_budget_capped_by_profile() {
        let config = PipelineConfig::default();
        let request = QueryRequest::new("x", QueryDepth::L0).with_budget(Budget::default().with_max_files(50));
        assert_eq!(config.budget_for(&request).max_files, 3);

        let request = QueryRequest::new("x", QueryDepth::L2);
        let budget = config.budget_for(&request);
        assert_eq!(budget.max_files, 15);
        assert_eq!(budget.timeout_ms, 5_000);
    }

    #[tokio::test]
    async fn test_query_tiers_and_caches() {
        let (store, pipeline) = pipeline().await;
        seed(&store).await;

        let request = QueryRequest::new("retry", QueryDepth::L0);
        let first = pipeline.query(&request).await.unwrap();
        assert_eq!(first.pack_count(), 3);
        assert_eq!(first.essential.len(), 1);
        assert!(!first.cached);

        let second = pipeline.query(&request).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.essential, first.essential);
        assert_eq!(pipeline.cache_stats().hot_hits, 1);
    }

    #[tokio::test]
    async fn test_slow_assembly_keeps_finished_packs() {
        let db = Database::in_memory().await.expect("db");
        let store: Arc<dyn KnowledgeStore> = Arc::new(SlowPackStore {
            inner: SqliteKnowledgeStore::new(db.pool().clone()),
            delay: Duration::from_millis(100),
        });
        seed(&store).await;
        let pipeline = pipeline_over(store);

        // Three packs need 300 ms of writes; the budget allows 250
        let request = QueryRequest::new("retry", QueryDepth::L0)
            .with_budget(Budget::default().with_timeout_ms(250));
        let started = std::time::Instant::now();
        let response = pipeline.query(&request).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(250) + RELEVANCE_GRACE);

        assert!(response.partial);
        assert!(!response.essential.is_empty());
        assert!(response.pack_count() < 3);
        assert!(response.caveats.iter().any(|c| c.contains("Timed out after 250 ms")));

        let again = pipeline.query(&request).await.unwrap();
        assert!(!again.cached);
    }

    #[tokio::test]
    async fn test_max_files_across_tiers() {
        let (store, pipeline) = pipeline().await;
        seed(&store).await;

        let request = QueryRequest::new("retry logic", QueryDepth::L0)
            .with_budget(Budget::default().with_max_files(2));
        let response = pipeline.query(&request).await.unwrap();
        assert_eq!(response.pack_count(), 2);
        assert!(response.truncated);
    }

    #[tokio::test]
    async fn test_file_change_evicts_dependent_answers() {
        let (store, pipeline) = pipeline().await;
        seed(&store).await;

        let request = QueryRequest::new("retry", QueryDepth::L0);
        let response = pipeline.query(&request).await.unwrap();
        let path = response.essential[0].target_entity_id.clone();

        let evicted = pipeline.file_changed(&path).await.unwrap();
        assert_eq!(evicted, vec![response.fingerprint.clone()]);
        assert!(!pipeline.query(&request).await.unwrap().cached);
    }

    #[tokio::test]
    async fn test_engine_reports() {
        let (store, pipeline) = pipeline().await;
        seed(&store).await;

        let request = QueryRequest::new("retry", QueryDepth::L0)
            .with_affected_files(vec!["src/retry.rs".into()])
            .with_engines();
        let response = pipeline.query(&request).await.unwrap();
        let engines = response.engines.unwrap();

        assert!(engines.constraints.unwrap().is_empty());
        assert!(engines.meta.unwrap().risk > 0.0);
        let blast = engines.blast_radius.unwrap();
        assert!(blast.affected.iter().any(|a| a.id == "src/http_client.rs"));
        assert!(!engines.relevance.is_empty());
    }

    #[tokio::test]
    async fn test_l1_without_provider_surfaces_error() {
        let (store, pipeline) = pipeline().await;
        seed(&store).await;

        let err = pipeline
            .query(&QueryRequest::new("retry", QueryDepth::L1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmbeddingUnavailable(_)));
    }

    #[tokio::test]
    async fn test_empty_intent_rejected() {
        let (_, pipeline) = pipeline().await;
        let err = pipeline.query(&QueryRequest::new("  ", QueryDepth::L0)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_event_loop_applies_events_until_shutdown() {
        let (store, pipeline) = pipeline().await;
        seed(&store).await;
        let pipeline = Arc::new(pipeline);

        let request = QueryRequest::new("retry", QueryDepth::L0);
        let response = pipeline.query(&request).await.unwrap();
        let path = response.essential[0].target_entity_id.clone();

        let (tx, rx) = mpsc::channel(8);
        let handle = pipeline.clone().spawn_event_loop(rx);
        tx.send(KnowledgeEvent::files_changed(vec![path])).await.unwrap();
        tx.send(KnowledgeEvent::shutdown()).await.unwrap();
        handle.await.unwrap();

        assert!(!pipeline.query(&request).await.unwrap().cached);
    }

    #[tokio::test]
    async fn test_invalidate_all() {
        let (store, pipeline) = pipeline().await;
        seed(&store).await;
        let request = QueryRequest::new("retry", QueryDepth::L0);
        pipeline.query(&request).await.unwrap();

        assert_eq!(pipeline.invalidate_all().await.unwrap(), 1);
        assert!(!pipeline.query(&request).await.unwrap().cached);
    }

    #[tokio::test]
    async fn test_execute_dispatch() {
        let (store, pipeline) = pipeline().await;
        seed(&store).await;

        match pipeline
            .execute(KnowledgeQuery::BlastRadius {
                files: vec!["src/retry.rs".into()],
                max_depth: 1,
            })
            .await
            .unwrap()
        {
            KnowledgeAnswer::BlastRadius(radius) => assert_eq!(radius.affected.len(), 1),
            other => panic!("unexpected answer: {:?}", other),
        }

        match pipeline.execute(KnowledgeQuery::Architecture { top: 3 }).await.unwrap() {
            KnowledgeAnswer::Architecture(summary) => assert_eq!(summary.entities, 5),
            other => panic!("unexpected answer: {:?}", other),
        }
    }
}
