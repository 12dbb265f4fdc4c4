//! Embedding batch coordinator
//!
//! Splits texts into fixed-size batches, runs a bounded number of batches
//! concurrently against an [`EmbeddingProvider`], and retries failed batches
//! with linear backoff. Output order always matches input order, and a failed
//! batch surfaces its error instead of a substitute vector.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::knowledge::{Embedding, KnowledgeStore};
use crate::error::{Error, Result};

/// Capability to turn texts into vectors
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier stamped on every produced embedding
    fn model(&self) -> &str;

    /// One vector per input text, in input order
    ///
    /// Fails with [`Error::EmbeddingUnavailable`] when no provider is reachable.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// What happens when a batch keeps failing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Give up after `max_retries` retries
    #[default]
    Bounded,
    /// Keep retrying until the provider answers
    Unbounded,
}

impl RetryPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bounded => "bounded",
            Self::Unbounded => "unbounded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bounded" => Some(Self::Bounded),
            "unbounded" => Some(Self::Unbounded),
            _ => None,
        }
    }
}

/// Batch coordinator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub batch_size: usize,
    /// Batches in flight at once
    pub concurrency: usize,
    /// Retries after the first attempt of a batch
    pub max_retries: u32,
    /// Delay before retry `n` is `n * base_delay_ms`
    pub base_delay_ms: u64,
    pub retry_policy: RetryPolicy,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            concurrency: 3,
            max_retries: 3,
            base_delay_ms: 500,
            retry_policy: RetryPolicy::Bounded,
        }
    }
}

/// Result of embedding a set of entities
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedReport {
    pub embedded: Vec<String>,
    /// Ids that are unknown or tombstoned
    pub skipped: Vec<String>,
}

/// Concurrency-controlled batch embedding feeding the knowledge store
pub struct EmbeddingCoordinator {
    provider: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn KnowledgeStore>,
    config: EmbeddingConfig,
    pending: Mutex<BTreeSet<String>>,
}

impl EmbeddingCoordinator {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn KnowledgeStore>,
        config: EmbeddingConfig,
    ) -> Self {
        Self {
            provider,
            store,
            config,
            pending: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    pub fn config(&self) -> &EmbeddingConfig {
        &self.config
    }

    /// Embed texts in batches, preserving input order
    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let batch_size = self.config.batch_size.max(1);
        let concurrency = self.config.concurrency.max(1);
        let batches: Vec<(usize, &[String])> = texts.chunks(batch_size).enumerate().collect();
        debug!(
            texts = texts.len(),
            batches = batches.len(),
            concurrency,
            "Embedding texts"
        );

        let results: Vec<Vec<Embedding>> = stream::iter(batches)
            .map(|(index, batch)| self.embed_batch(index, batch))
            .buffered(concurrency)
            .try_collect()
            .await?;

        let embeddings: Vec<Embedding> = results.into_iter().flatten().collect();
        ensure_uniform(&embeddings)?;
        Ok(embeddings)
    }

    /// Embed and persist the given entities
    pub async fn embed_entities(&self, entity_ids: &[String]) -> Result<EmbedReport> {
        let mut report = EmbedReport::default();
        let mut ids = Vec::new();
        let mut texts = Vec::new();

        for id in entity_ids {
            match self.store.get_entity(id).await? {
                Some(entity) if !entity.tombstoned => {
                    texts.push(entity.embedding_text());
                    ids.push(entity.id);
                }
                _ => report.skipped.push(id.clone()),
            }
        }

        let embeddings = self.embed_texts(&texts).await?;
        for (id, embedding) in ids.into_iter().zip(embeddings) {
            self.store.save_embedding(&id, &embedding).await?;
            report.embedded.push(id);
        }

        info!(
            embedded = report.embedded.len(),
            skipped = report.skipped.len(),
            "Entities embedded"
        );
        Ok(report)
    }

    /// Queue entities for re-embedding
    pub fn schedule(&self, entity_ids: impl IntoIterator<Item = String>) -> usize {
        let mut pending = self.lock();
        pending.extend(entity_ids);
        pending.len()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    /// Embed everything queued; on failure the queue is restored
    pub async fn process_pending(&self) -> Result<EmbedReport> {
        let ids: Vec<String> = std::mem::take(&mut *self.lock()).into_iter().collect();
        if ids.is_empty() {
            return Ok(EmbedReport::default());
        }

        match self.embed_entities(&ids).await {
            Ok(report) => Ok(report),
            Err(e) => {
                warn!(pending = ids.len(), error = %e, "Re-embedding failed, keeping queue");
                self.schedule(ids);
                Err(e)
            }
        }
    }

    async fn embed_batch(&self, index: usize, batch: &[String]) -> Result<Vec<Embedding>> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.try_batch(batch).await {
                Ok(embeddings) => return Ok(embeddings),
                Err(e @ Error::DimensionMismatch { .. }) => return Err(e),
                Err(e) => {
                    let exhausted = self.config.retry_policy == RetryPolicy::Bounded
                        && attempt > self.config.max_retries;
                    if exhausted {
                        warn!(batch = index, attempts = attempt, error = %e, "Embedding batch failed");
                        return Err(e);
                    }
                    let delay = Duration::from_millis(self.config.base_delay_ms * attempt as u64);
                    debug!(
                        batch = index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying embedding batch"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn try_batch(&self, batch: &[String]) -> Result<Vec<Embedding>> {
        let vectors = self.provider.embed(batch).await?;
        if vectors.len() != batch.len() {
            return Err(Error::EmbeddingUnavailable(format!(
                "provider returned {} vectors for {} texts",
                vectors.len(),
                batch.len()
            )));
        }

        let model = self.provider.model();
        let embeddings: Vec<Embedding> = vectors
            .into_iter()
            .map(|values| Embedding::new(model, values))
            .collect();
        ensure_uniform(&embeddings)?;
        Ok(embeddings)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn ensure_uniform(embeddings: &[Embedding]) -> Result<()> {
    if let Some(first) = embeddings.first() {
        for embedding in &embeddings[1..] {
            first.ensure_compatible(embedding)?;
        }
    }
    Ok(())
}
