//! SQLite implementation of the KnowledgeStore
//!
//! Entity writes use optimistic concurrency: the stored `version` is read with
//! the checksum and the update only applies if the version is unchanged. A lost
//! race re-reads and retries, bounded by [`MAX_WRITE_ATTEMPTS`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, info, warn};

use crate::domain::knowledge::{
    CacheEntry, CodeEntity, ConfidenceEvent, Constraint, ConstraintException, ConstraintRule,
    ConstraintSource, ContextPack, Embedding, EntityKind, KnowledgeStore, ObservedPattern,
    OutcomeRecord, Relationship, RelationshipKind, StoreStats, UpsertOutcome,
};
use crate::error::{Error, Result};
use crate::storage::{from_db_timestamp, to_db_timestamp};

/// Attempts made before an entity write gives up with `WriteConflict`
pub const MAX_WRITE_ATTEMPTS: u32 = 5;

/// SQLite implementation of the knowledge store
#[derive(Clone)]
pub struct SqliteKnowledgeStore {
    pool: SqlitePool,
}

impl SqliteKnowledgeStore {
    /// Create a new SQLite knowledge store
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn cache_dependencies(&self, fingerprint: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT path FROM cache_dependencies WHERE fingerprint = ? ORDER BY path",
        )
        .bind(fingerprint)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(p,)| p).collect())
    }

    async fn count(&self, sql: &str) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(sql).fetch_one(&self.pool).await?;
        Ok(count as u64)
    }
}

#[async_trait]
impl KnowledgeStore for SqliteKnowledgeStore {
    // ========== Entity Operations ==========

    async fn upsert_entity(&self, entity: &CodeEntity) -> Result<UpsertOutcome> {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let current: Option<(String, i64, bool)> = sqlx::query_as(
                "SELECT checksum, version, tombstoned FROM entities WHERE id = ?",
            )
            .bind(&entity.id)
            .fetch_optional(&self.pool)
            .await?;

            match current {
                None => {
                    let result = sqlx::query(
                        r#"
                        INSERT INTO entities (
                            id, kind, name, path, signature, size, checksum, complexity,
                            last_modified, indexed_at, tombstoned, version
                        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 1)
                        ON CONFLICT(id) DO NOTHING
                        "#,
                    )
                    .bind(&entity.id)
                    .bind(entity.kind.as_str())
                    .bind(&entity.name)
                    .bind(&entity.path)
                    .bind(&entity.signature)
                    .bind(entity.size as i64)
                    .bind(&entity.checksum)
                    .bind(entity.complexity)
                    .bind(to_db_timestamp(&entity.last_modified))
                    .bind(to_db_timestamp(&entity.indexed_at))
                    .execute(&self.pool)
                    .await?;

                    if result.rows_affected() == 1 {
                        debug!(entity_id = %entity.id, "Entity inserted");
                        return Ok(UpsertOutcome::Inserted);
                    }
                }
                Some((checksum, _, false)) if checksum == entity.checksum => {
                    return Ok(UpsertOutcome::Unchanged);
                }
                Some((_, version, _)) => {
                    let result = sqlx::query(
                        r#"
                        UPDATE entities SET
                            kind = ?, name = ?, path = ?, signature = ?, size = ?,
                            checksum = ?, complexity = ?, last_modified = ?, indexed_at = ?,
                            tombstoned = 0, version = version + 1
                        WHERE id = ? AND version = ?
                        "#,
                    )
                    .bind(entity.kind.as_str())
                    .bind(&entity.name)
                    .bind(&entity.path)
                    .bind(&entity.signature)
                    .bind(entity.size as i64)
                    .bind(&entity.checksum)
                    .bind(entity.complexity)
                    .bind(to_db_timestamp(&entity.last_modified))
                    .bind(to_db_timestamp(&entity.indexed_at))
                    .bind(&entity.id)
                    .bind(version)
                    .execute(&self.pool)
                    .await?;

                    if result.rows_affected() == 1 {
                        debug!(entity_id = %entity.id, version = version + 1, "Entity updated");
                        return Ok(UpsertOutcome::Updated);
                    }
                }
            }

            debug!(entity_id = %entity.id, attempt, "Entity write lost a race, retrying");
        }

        warn!(entity_id = %entity.id, "Entity write conflict not resolved");
        Err(Error::WriteConflict(entity.id.clone(), MAX_WRITE_ATTEMPTS))
    }

    async fn get_entity(&self, id: &str) -> Result<Option<CodeEntity>> {
        let row: Option<EntityRow> = sqlx::query_as("SELECT * FROM entities WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.into_entity()).transpose()
    }

    async fn list_entities(&self, include_tombstoned: bool) -> Result<Vec<CodeEntity>> {
        let rows: Vec<EntityRow> = sqlx::query_as(
            "SELECT * FROM entities WHERE (? OR tombstoned = 0) ORDER BY id",
        )
        .bind(include_tombstoned)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_entity()).collect()
    }

    async fn entities_for_path(&self, path: &str) -> Result<Vec<CodeEntity>> {
        let rows: Vec<EntityRow> = sqlx::query_as(
            "SELECT * FROM entities WHERE (path = ? OR id = ?) AND tombstoned = 0 ORDER BY id",
        )
        .bind(path)
        .bind(path)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_entity()).collect()
    }

    async fn tombstone_entity(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE entities SET tombstoned = 1, indexed_at = ?, version = version + 1 WHERE id = ?",
        )
        .bind(to_db_timestamp(&Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        let tombstoned = result.rows_affected() > 0;
        if tombstoned {
            info!(entity_id = %id, "Entity tombstoned");
        }
        Ok(tombstoned)
    }

    // ========== Relationship Operations ==========

    async fn upsert_relationship(&self, relationship: &Relationship) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO relationships (source_id, target_id, kind, weight, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(source_id, target_id, kind) DO UPDATE SET
                weight = excluded.weight
            "#,
        )
        .bind(&relationship.source_id)
        .bind(&relationship.target_id)
        .bind(relationship.kind.as_str())
        .bind(relationship.weight)
        .bind(to_db_timestamp(&relationship.created_at))
        .execute(&self.pool)
        .await?;

        debug!(
            source = %relationship.source_id,
            target = %relationship.target_id,
            kind = %relationship.kind,
            "Relationship saved"
        );
        Ok(())
    }

    async fn get_relationships(
        &self,
        entity_id: &str,
        kind: Option<RelationshipKind>,
    ) -> Result<Vec<Relationship>> {
        let rows: Vec<RelationshipRow> = sqlx::query_as(
            r#"
            SELECT * FROM relationships
            WHERE (source_id = ? OR target_id = ?)
              AND (? IS NULL OR kind = ?)
            ORDER BY source_id, target_id, kind
            "#,
        )
        .bind(entity_id)
        .bind(entity_id)
        .bind(kind.map(|k| k.as_str()))
        .bind(kind.map(|k| k.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_relationship()).collect()
    }

    async fn list_relationships(&self, kind: Option<RelationshipKind>) -> Result<Vec<Relationship>> {
        let rows: Vec<RelationshipRow> = sqlx::query_as(
            "SELECT * FROM relationships WHERE (? IS NULL OR kind = ?) ORDER BY source_id, target_id, kind",
        )
        .bind(kind.map(|k| k.as_str()))
        .bind(kind.map(|k| k.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_relationship()).collect()
    }

    // ========== Embedding Operations ==========

    async fn save_embedding(&self, entity_id: &str, embedding: &Embedding) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO embeddings (entity_id, model, dimensions, vector, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(entity_id) DO UPDATE SET
                model = excluded.model,
                dimensions = excluded.dimensions,
                vector = excluded.vector,
                created_at = excluded.created_at
            "#,
        )
        .bind(entity_id)
        .bind(&embedding.model)
        .bind(embedding.dimensions() as i64)
        .bind(embedding.to_bytes())
        .bind(to_db_timestamp(&Utc::now()))
        .execute(&self.pool)
        .await?;

        debug!(entity_id = %entity_id, model = %embedding.model, "Embedding saved");
        Ok(())
    }

    async fn get_embedding(&self, entity_id: &str) -> Result<Option<Embedding>> {
        let row: Option<(String, Vec<u8>)> =
            sqlx::query_as("SELECT model, vector FROM embeddings WHERE entity_id = ?")
                .bind(entity_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(model, bytes)| Embedding::from_bytes(model, &bytes))
            .transpose()
    }

    async fn list_embeddings(&self) -> Result<Vec<(String, Embedding)>> {
        let rows: Vec<(String, String, Vec<u8>)> = sqlx::query_as(
            r#"
            SELECT e.entity_id, e.model, e.vector
            FROM embeddings e
            JOIN entities n ON n.id = e.entity_id
            WHERE n.tombstoned = 0
            ORDER BY e.entity_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, model, bytes)| Ok((id, Embedding::from_bytes(model, &bytes)?)))
            .collect()
    }

    // ========== Query Cache Operations ==========

    async fn get_cached(&self, fingerprint: &str) -> Result<Option<CacheEntry>> {
        let now = Utc::now();
        let row: Option<CacheRow> = sqlx::query_as(
            "SELECT * FROM query_cache WHERE fingerprint = ? AND expires_at > ?",
        )
        .bind(fingerprint)
        .bind(to_db_timestamp(&now))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        sqlx::query("UPDATE query_cache SET access_count = access_count + 1 WHERE fingerprint = ?")
            .bind(fingerprint)
            .execute(&self.pool)
            .await?;

        let dependencies = self.cache_dependencies(fingerprint).await?;
        let mut entry = row.into_entry(dependencies)?;
        entry.access_count += 1;
        Ok(Some(entry))
    }

    async fn set_cached(&self, entry: &CacheEntry) -> Result<()> {
        let params = serde_json::to_string(&entry.params)?;
        let response = serde_json::to_string(&entry.response)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO query_cache (fingerprint, params, response, created_at, expires_at, access_count)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(fingerprint) DO UPDATE SET
                params = excluded.params,
                response = excluded.response,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at,
                access_count = excluded.access_count
            "#,
        )
        .bind(&entry.fingerprint)
        .bind(&params)
        .bind(&response)
        .bind(to_db_timestamp(&entry.created_at))
        .bind(to_db_timestamp(&entry.expires_at))
        .bind(entry.access_count as i64)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM cache_dependencies WHERE fingerprint = ?")
            .bind(&entry.fingerprint)
            .execute(&mut *tx)
            .await?;

        for path in &entry.dependencies {
            sqlx::query("INSERT OR IGNORE INTO cache_dependencies (fingerprint, path) VALUES (?, ?)")
                .bind(&entry.fingerprint)
                .bind(path)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        debug!(fingerprint = %entry.fingerprint, expires_at = %entry.expires_at, "Cache entry stored");
        Ok(())
    }

    async fn delete_cached(&self, fingerprint: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM cache_dependencies WHERE fingerprint = ?")
            .bind(fingerprint)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM query_cache WHERE fingerprint = ?")
            .bind(fingerprint)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn invalidate_dependents(&self, path: &str) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;

        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT fingerprint FROM cache_dependencies WHERE path = ? ORDER BY fingerprint",
        )
        .bind(path)
        .fetch_all(&mut *tx)
        .await?;
        let fingerprints: Vec<String> = rows.into_iter().map(|(f,)| f).collect();

        for fingerprint in &fingerprints {
            sqlx::query("DELETE FROM cache_dependencies WHERE fingerprint = ?")
                .bind(fingerprint)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM query_cache WHERE fingerprint = ?")
                .bind(fingerprint)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        if !fingerprints.is_empty() {
            debug!(path = %path, evicted = fingerprints.len(), "Cold cache entries invalidated");
        }
        Ok(fingerprints)
    }

    async fn clear_cache(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM cache_dependencies")
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM query_cache").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = to_db_timestamp(&now);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM cache_dependencies WHERE fingerprint IN (
                SELECT fingerprint FROM query_cache WHERE expires_at <= ?
            )
            "#,
        )
        .bind(&cutoff)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query("DELETE FROM query_cache WHERE expires_at <= ?")
            .bind(&cutoff)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let pruned = result.rows_affected();
        if pruned > 0 {
            info!(pruned, "Expired cache entries pruned");
        }
        Ok(pruned)
    }

    // ========== Learning Loop Operations ==========

    async fn save_pack(&self, pack: &ContextPack) -> Result<()> {
        let key_facts = serde_json::to_string(&pack.key_facts)?;
        let related_files = serde_json::to_string(&pack.related_files)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO context_packs (
                id, target_entity_id, summary, key_facts, related_files, score,
                success_count, failure_count, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                target_entity_id = excluded.target_entity_id,
                summary = excluded.summary,
                key_facts = excluded.key_facts,
                related_files = excluded.related_files,
                score = excluded.score,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&pack.id)
        .bind(&pack.target_entity_id)
        .bind(&pack.summary)
        .bind(&key_facts)
        .bind(&related_files)
        .bind(pack.score)
        .bind(pack.success_count as i64)
        .bind(pack.failure_count as i64)
        .bind(to_db_timestamp(&pack.created_at))
        .bind(to_db_timestamp(&pack.updated_at))
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM pack_entities WHERE pack_id = ?")
            .bind(&pack.id)
            .execute(&mut *tx)
            .await?;

        for entity_id in pack.entity_ids() {
            sqlx::query("INSERT OR IGNORE INTO pack_entities (pack_id, entity_id) VALUES (?, ?)")
                .bind(&pack.id)
                .bind(&entity_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_pack(&self, id: &str) -> Result<Option<ContextPack>> {
        let row: Option<PackRow> = sqlx::query_as("SELECT * FROM context_packs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.into_pack()).transpose()
    }

    async fn list_packs(&self) -> Result<Vec<ContextPack>> {
        let rows: Vec<PackRow> = sqlx::query_as("SELECT * FROM context_packs ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(|r| r.into_pack()).collect()
    }

    async fn record_outcome(&self, outcome: &OutcomeRecord) -> Result<bool> {
        let pack_ids = serde_json::to_string(&outcome.pack_ids)?;
        let files_modified = serde_json::to_string(&outcome.files_modified)?;
        let recorded_at = to_db_timestamp(&outcome.recorded_at);
        let submission_key = outcome.submission_key();

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO outcomes (
                id, submission_key, task_id, pack_ids, success, failure_reason,
                failure_category, files_modified, recorded_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(submission_key) DO NOTHING
            "#,
        )
        .bind(&outcome.id)
        .bind(&submission_key)
        .bind(&outcome.task_id)
        .bind(&pack_ids)
        .bind(outcome.success)
        .bind(&outcome.failure_reason)
        .bind(&outcome.failure_category)
        .bind(&files_modified)
        .bind(&recorded_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            debug!(submission_key = %submission_key, "Duplicate outcome ignored");
            return Ok(false);
        }

        let (successes, failures): (i64, i64) = if outcome.success { (1, 0) } else { (0, 1) };
        for pack_id in &outcome.pack_ids {
            sqlx::query(
                r#"
                UPDATE context_packs SET
                    success_count = success_count + ?,
                    failure_count = failure_count + ?,
                    updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(successes)
            .bind(failures)
            .bind(&recorded_at)
            .bind(pack_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO outcome_packs (outcome_id, pack_id, success, recorded_at) VALUES (?, ?, ?, ?)",
            )
            .bind(&outcome.id)
            .bind(pack_id)
            .bind(outcome.success)
            .bind(&recorded_at)
            .execute(&mut *tx)
            .await?;

            // Membership as of now; later pack rewrites must not move this outcome
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO outcome_entities (outcome_id, entity_id)
                SELECT ?, entity_id FROM pack_entities WHERE pack_id = ?
                "#,
            )
            .bind(&outcome.id)
            .bind(pack_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        info!(
            outcome_id = %outcome.id,
            packs = outcome.pack_ids.len(),
            success = outcome.success,
            "Outcome recorded"
        );
        Ok(true)
    }

    async fn list_outcomes(&self) -> Result<Vec<OutcomeRecord>> {
        let rows: Vec<OutcomeRow> =
            sqlx::query_as("SELECT * FROM outcomes ORDER BY recorded_at, rowid")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(|r| r.into_outcome()).collect()
    }

    async fn outcomes_for_entity(&self, entity_id: &str) -> Result<Vec<OutcomeRecord>> {
        let rows: Vec<OutcomeRow> = sqlx::query_as(
            r#"
            SELECT * FROM outcomes WHERE id IN (
                SELECT outcome_id FROM outcome_entities WHERE entity_id = ?
            )
            ORDER BY recorded_at, rowid
            "#,
        )
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_outcome()).collect()
    }

    async fn outcomes_for_pack(&self, pack_id: &str) -> Result<Vec<OutcomeRecord>> {
        let rows: Vec<OutcomeRow> = sqlx::query_as(
            r#"
            SELECT * FROM outcomes WHERE id IN (
                SELECT outcome_id FROM outcome_packs WHERE pack_id = ?
            )
            ORDER BY recorded_at, rowid
            "#,
        )
        .bind(pack_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_outcome()).collect()
    }

    async fn log_confidence_event(&self, event: &ConfidenceEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO confidence_events (entity_id, delta, reason, recorded_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&event.entity_id)
        .bind(event.delta)
        .bind(&event.reason)
        .bind(to_db_timestamp(&event.recorded_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn confidence_history(
        &self,
        entity_id: &str,
        limit: usize,
    ) -> Result<Vec<ConfidenceEvent>> {
        let rows: Vec<(String, f32, String, String)> = sqlx::query_as(
            r#"
            SELECT entity_id, delta, reason, recorded_at FROM confidence_events
            WHERE entity_id = ?
            ORDER BY recorded_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(entity_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(entity_id, delta, reason, recorded_at)| {
                Ok(ConfidenceEvent {
                    entity_id,
                    delta,
                    reason,
                    recorded_at: from_db_timestamp(&recorded_at)?,
                })
            })
            .collect()
    }

    // ========== Constraint Operations ==========

    async fn save_constraint(&self, constraint: &Constraint) -> Result<()> {
        let rule = serde_json::to_string(&constraint.rule)?;
        let (exception_reason, exception_expires_at) = match &constraint.exception {
            Some(exception) => (
                Some(exception.reason.clone()),
                Some(to_db_timestamp(&exception.expires_at)),
            ),
            None => (None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO constraints (
                id, scope, rule, source, rationale, expires_at, exception_reason,
                exception_expires_at, origin_pattern, observation_count, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                scope = excluded.scope,
                rule = excluded.rule,
                source = excluded.source,
                rationale = excluded.rationale,
                expires_at = excluded.expires_at,
                exception_reason = excluded.exception_reason,
                exception_expires_at = excluded.exception_expires_at,
                origin_pattern = excluded.origin_pattern,
                observation_count = excluded.observation_count,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&constraint.id)
        .bind(&constraint.scope)
        .bind(&rule)
        .bind(constraint.source.as_str())
        .bind(&constraint.rationale)
        .bind(constraint.expires_at.as_ref().map(to_db_timestamp))
        .bind(&exception_reason)
        .bind(&exception_expires_at)
        .bind(&constraint.origin_pattern)
        .bind(constraint.observation_count as i64)
        .bind(to_db_timestamp(&constraint.created_at))
        .bind(to_db_timestamp(&constraint.updated_at))
        .execute(&self.pool)
        .await?;

        debug!(constraint_id = %constraint.id, source = constraint.source.as_str(), "Constraint saved");
        Ok(())
    }

    async fn get_constraint(&self, id: &str) -> Result<Option<Constraint>> {
        let row: Option<ConstraintRow> = sqlx::query_as("SELECT * FROM constraints WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.into_constraint()).transpose()
    }

    async fn list_constraints(&self) -> Result<Vec<Constraint>> {
        let rows: Vec<ConstraintRow> = sqlx::query_as("SELECT * FROM constraints ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(|r| r.into_constraint()).collect()
    }

    async fn clear_expired_exceptions(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let cutoff = to_db_timestamp(&now);
        let mut tx = self.pool.begin().await?;

        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT id FROM constraints
            WHERE exception_expires_at IS NOT NULL AND exception_expires_at <= ?
            ORDER BY id
            "#,
        )
        .bind(&cutoff)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE constraints SET
                exception_reason = NULL,
                exception_expires_at = NULL,
                updated_at = ?
            WHERE exception_expires_at IS NOT NULL AND exception_expires_at <= ?
            "#,
        )
        .bind(&cutoff)
        .bind(&cutoff)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn record_pattern(&self, pattern: &ObservedPattern) -> Result<u32> {
        let key = pattern.key();
        let rule = serde_json::to_string(&pattern.rule)?;
        let observed_at = to_db_timestamp(&Utc::now());

        let mut tx = self.pool.begin().await?;
        for file in &pattern.example_files {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO pattern_observations
                    (pattern_key, scope, rule, rationale, file, observed_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&key)
            .bind(&pattern.scope)
            .bind(&rule)
            .bind(&pattern.rationale)
            .bind(file)
            .bind(&observed_at)
            .execute(&mut *tx)
            .await?;
        }

        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM pattern_observations WHERE pattern_key = ?")
                .bind(&key)
                .fetch_one(&mut *tx)
                .await?;
        tx.commit().await?;

        debug!(pattern_key = %key, observations = count, "Pattern observed");
        Ok(count as u32)
    }

    async fn get_pattern(&self, pattern_key: &str) -> Result<Option<ObservedPattern>> {
        let rows: Vec<(String, String, String, String)> = sqlx::query_as(
            r#"
            SELECT scope, rule, rationale, file FROM pattern_observations
            WHERE pattern_key = ?
            ORDER BY file
            "#,
        )
        .bind(pattern_key)
        .fetch_all(&self.pool)
        .await?;

        let Some((scope, rule, rationale, _)) = rows.first().cloned() else {
            return Ok(None);
        };
        let rule: ConstraintRule = serde_json::from_str(&rule)?;
        let files = rows.into_iter().map(|(_, _, _, file)| file).collect();

        Ok(Some(
            ObservedPattern::new(scope, rule)
                .with_rationale(rationale)
                .with_examples(files),
        ))
    }

    // ========== Maintenance ==========

    async fn stats(&self) -> Result<StoreStats> {
        let kind_rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT kind, COUNT(*) FROM relationships GROUP BY kind")
                .fetch_all(&self.pool)
                .await?;
        let relationships_by_kind: HashMap<String, u64> = kind_rows
            .into_iter()
            .map(|(kind, count)| (kind, count as u64))
            .collect();

        Ok(StoreStats {
            entities: self
                .count("SELECT COUNT(*) FROM entities WHERE tombstoned = 0")
                .await?,
            tombstoned_entities: self
                .count("SELECT COUNT(*) FROM entities WHERE tombstoned = 1")
                .await?,
            relationships_by_kind,
            embeddings: self.count("SELECT COUNT(*) FROM embeddings").await?,
            cached_entries: self.count("SELECT COUNT(*) FROM query_cache").await?,
            packs: self.count("SELECT COUNT(*) FROM context_packs").await?,
            outcomes: self.count("SELECT COUNT(*) FROM outcomes").await?,
            constraints: self.count("SELECT COUNT(*) FROM constraints").await?,
        })
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?;
        Ok(())
    }
}

// ========== Row Types ==========

#[derive(Debug, FromRow)]
struct EntityRow {
    id: String,
    kind: String,
    name: String,
    path: String,
    signature: Option<String>,
    size: i64,
    checksum: String,
    complexity: f32,
    last_modified: String,
    indexed_at: String,
    tombstoned: bool,
    version: i64,
}

impl EntityRow {
    fn into_entity(self) -> Result<CodeEntity> {
        let kind = EntityKind::parse(&self.kind)
            .ok_or_else(|| Error::Other(format!("Invalid entity kind: {}", self.kind)))?;

        Ok(CodeEntity {
            id: self.id,
            kind,
            name: self.name,
            path: self.path,
            signature: self.signature,
            size: self.size.max(0) as u64,
            checksum: self.checksum,
            complexity: self.complexity,
            last_modified: from_db_timestamp(&self.last_modified)?,
            indexed_at: from_db_timestamp(&self.indexed_at)?,
            tombstoned: self.tombstoned,
            version: self.version,
        })
    }
}

#[derive(Debug, FromRow)]
struct RelationshipRow {
    source_id: String,
    target_id: String,
    kind: String,
    weight: f32,
    created_at: String,
}

impl RelationshipRow {
    fn into_relationship(self) -> Result<Relationship> {
        let kind = RelationshipKind::parse(&self.kind)
            .ok_or_else(|| Error::Other(format!("Invalid relationship kind: {}", self.kind)))?;

        Ok(Relationship {
            source_id: self.source_id,
            target_id: self.target_id,
            kind,
            weight: self.weight,
            created_at: from_db_timestamp(&self.created_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct CacheRow {
    fingerprint: String,
    params: String,
    response: String,
    created_at: String,
    expires_at: String,
    access_count: i64,
}

impl CacheRow {
    /// Any decoding failure marks the entry corrupt
    fn into_entry(self, dependencies: Vec<String>) -> Result<CacheEntry> {
        let corrupt = |_| Error::CacheCorrupt(self.fingerprint.clone());

        let params = serde_json::from_str(&self.params).map_err(corrupt)?;
        let response = serde_json::from_str(&self.response).map_err(corrupt)?;
        let created_at = from_db_timestamp(&self.created_at)
            .map_err(|_| Error::CacheCorrupt(self.fingerprint.clone()))?;
        let expires_at = from_db_timestamp(&self.expires_at)
            .map_err(|_| Error::CacheCorrupt(self.fingerprint.clone()))?;

        Ok(CacheEntry {
            fingerprint: self.fingerprint,
            params,
            response,
            dependencies,
            created_at,
            expires_at,
            access_count: self.access_count.max(0) as u64,
        })
    }
}

#[derive(Debug, FromRow)]
struct PackRow {
    id: String,
    target_entity_id: String,
    summary: String,
    key_facts: String,
    related_files: String,
    score: f32,
    success_count: i64,
    failure_count: i64,
    created_at: String,
    updated_at: String,
}

impl PackRow {
    fn into_pack(self) -> Result<ContextPack> {
        Ok(ContextPack {
            id: self.id,
            target_entity_id: self.target_entity_id,
            summary: self.summary,
            key_facts: serde_json::from_str(&self.key_facts)?,
            related_files: serde_json::from_str(&self.related_files)?,
            score: self.score,
            success_count: self.success_count.max(0) as u32,
            failure_count: self.failure_count.max(0) as u32,
            created_at: from_db_timestamp(&self.created_at)?,
            updated_at: from_db_timestamp(&self.updated_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct OutcomeRow {
    id: String,
    task_id: Option<String>,
    pack_ids: String,
    success: bool,
    failure_reason: Option<String>,
    failure_category: Option<String>,
    files_modified: String,
    recorded_at: String,
}

impl OutcomeRow {
    fn into_outcome(self) -> Result<OutcomeRecord> {
        Ok(OutcomeRecord {
            id: self.id,
            pack_ids: serde_json::from_str(&self.pack_ids)?,
            success: self.success,
            failure_reason: self.failure_reason,
            failure_category: self.failure_category,
            files_modified: serde_json::from_str(&self.files_modified)?,
            task_id: self.task_id,
            recorded_at: from_db_timestamp(&self.recorded_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct ConstraintRow {
    id: String,
    scope: String,
    rule: String,
    source: String,
    rationale: String,
    expires_at: Option<String>,
    exception_reason: Option<String>,
    exception_expires_at: Option<String>,
    origin_pattern: Option<String>,
    observation_count: i64,
    created_at: String,
    updated_at: String,
}

impl ConstraintRow {
    fn into_constraint(self) -> Result<Constraint> {
        let source = ConstraintSource::parse(&self.source)
            .ok_or_else(|| Error::Other(format!("Invalid constraint source: {}", self.source)))?;
        let rule: ConstraintRule = serde_json::from_str(&self.rule)?;

        let exception = match (self.exception_reason, self.exception_expires_at) {
            (Some(reason), Some(expires_at)) => Some(ConstraintException {
                reason,
                expires_at: from_db_timestamp(&expires_at)?,
            }),
            _ => None,
        };

        Ok(Constraint {
            id: self.id,
            scope: self.scope,
            rule,
            source,
            rationale: self.rationale,
            expires_at: self.expires_at.as_deref().map(from_db_timestamp).transpose()?,
            exception,
            origin_pattern: self.origin_pattern,
            observation_count: self.observation_count.max(0) as u32,
            created_at: from_db_timestamp(&self.created_at)?,
            updated_at: from_db_timestamp(&self.updated_at)?,
        })
    }
}
