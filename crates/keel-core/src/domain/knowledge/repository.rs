//! Knowledge store contract
//!
//! The store is the single source of truth for every engine. Implementations
//! must allow concurrent readers and serialize writers per entity.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::cache::CacheEntry;
use super::constraint::{Constraint, ObservedPattern};
use super::embedding::Embedding;
use super::entity::{CodeEntity, UpsertOutcome};
use super::event::ConfidenceEvent;
use super::pack::{ContextPack, OutcomeRecord};
use super::relationship::{Relationship, RelationshipKind};

/// Persistence for entities, relationships, embeddings, cache and the learning loop
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    // ========== Entity Operations ==========

    /// Insert or update an entity, versioned by checksum
    ///
    /// Re-ingesting an entity whose checksum matches the stored one is a no-op
    /// and reports [`UpsertOutcome::Unchanged`].
    async fn upsert_entity(&self, entity: &CodeEntity) -> Result<UpsertOutcome>;

    /// Get an entity by id, tombstoned or not
    async fn get_entity(&self, id: &str) -> Result<Option<CodeEntity>>;

    /// List entities ordered by id
    async fn list_entities(&self, include_tombstoned: bool) -> Result<Vec<CodeEntity>>;

    /// Live entities located in the given file
    async fn entities_for_path(&self, path: &str) -> Result<Vec<CodeEntity>>;

    /// Mark an entity as removed; returns false if it does not exist
    async fn tombstone_entity(&self, id: &str) -> Result<bool>;

    // ========== Relationship Operations ==========

    /// Insert a relationship or update the weight of an existing triple
    async fn upsert_relationship(&self, relationship: &Relationship) -> Result<()>;

    /// Relationships touching an entity in either direction
    async fn get_relationships(
        &self,
        entity_id: &str,
        kind: Option<RelationshipKind>,
    ) -> Result<Vec<Relationship>>;

    /// All relationships, optionally filtered by kind
    async fn list_relationships(&self, kind: Option<RelationshipKind>) -> Result<Vec<Relationship>>;

    // ========== Embedding Operations ==========

    async fn save_embedding(&self, entity_id: &str, embedding: &Embedding) -> Result<()>;

    async fn get_embedding(&self, entity_id: &str) -> Result<Option<Embedding>>;

    /// Embeddings of all live entities
    async fn list_embeddings(&self) -> Result<Vec<(String, Embedding)>>;

    // ========== Query Cache Operations ==========

    /// Get an unexpired cache entry and bump its access count
    async fn get_cached(&self, fingerprint: &str) -> Result<Option<CacheEntry>>;

    /// Store a cache entry (last writer wins)
    async fn set_cached(&self, entry: &CacheEntry) -> Result<()>;

    async fn delete_cached(&self, fingerprint: &str) -> Result<bool>;

    /// Delete entries depending on `path`; returns their fingerprints
    async fn invalidate_dependents(&self, path: &str) -> Result<Vec<String>>;

    async fn clear_cache(&self) -> Result<u64>;

    /// Delete entries expired at `now`
    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    // ========== Learning Loop Operations ==========

    /// Save a pack's content; existing counters are preserved
    async fn save_pack(&self, pack: &ContextPack) -> Result<()>;

    async fn get_pack(&self, id: &str) -> Result<Option<ContextPack>>;

    async fn list_packs(&self) -> Result<Vec<ContextPack>>;

    /// Append an outcome and bump its packs' counters atomically
    ///
    /// Returns false when an outcome with the same submission key already
    /// exists; nothing is written in that case.
    async fn record_outcome(&self, outcome: &OutcomeRecord) -> Result<bool>;

    /// All outcomes, oldest first
    async fn list_outcomes(&self) -> Result<Vec<OutcomeRecord>>;

    /// Outcomes of tasks that consumed a pack covering the entity, oldest first
    async fn outcomes_for_entity(&self, entity_id: &str) -> Result<Vec<OutcomeRecord>>;

    /// Outcomes of tasks that consumed the pack, oldest first
    async fn outcomes_for_pack(&self, pack_id: &str) -> Result<Vec<OutcomeRecord>>;

    async fn log_confidence_event(&self, event: &ConfidenceEvent) -> Result<()>;

    /// Most recent confidence events for an entity, newest first
    async fn confidence_history(&self, entity_id: &str, limit: usize)
    -> Result<Vec<ConfidenceEvent>>;

    // ========== Constraint Operations ==========

    async fn save_constraint(&self, constraint: &Constraint) -> Result<()>;

    async fn get_constraint(&self, id: &str) -> Result<Option<Constraint>>;

    async fn list_constraints(&self) -> Result<Vec<Constraint>>;

    /// Clear exceptions whose window closed at `now`; returns affected ids
    async fn clear_expired_exceptions(&self, now: DateTime<Utc>) -> Result<Vec<String>>;

    /// Record where a pattern was seen; returns the distinct file count
    async fn record_pattern(&self, pattern: &ObservedPattern) -> Result<u32>;

    async fn get_pattern(&self, pattern_key: &str) -> Result<Option<ObservedPattern>>;

    // ========== Maintenance ==========

    async fn stats(&self) -> Result<StoreStats>;

    /// Cheap round-trip proving the store is reachable
    async fn health_check(&self) -> Result<()>;
}

/// Row counts across the store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub entities: u64,
    pub tombstoned_entities: u64,
    pub relationships_by_kind: HashMap<String, u64>,
    pub embeddings: u64,
    pub cached_entries: u64,
    pub packs: u64,
    pub outcomes: u64,
    pub constraints: u64,
}

impl StoreStats {
    pub fn total_relationships(&self) -> u64 {
        self.relationships_by_kind.values().sum()
    }
}
