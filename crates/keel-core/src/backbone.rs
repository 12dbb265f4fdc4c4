//! Assembly of the knowledge backbone
//!
//! Opens the store and builds every component exactly once, passing shared
//! pieces down explicitly. A store that cannot be opened is fatal.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::{QueryCache, TieredCache};
use crate::confidence::ConfidenceModel;
use crate::config::KeelConfig;
use crate::domain::knowledge::{KnowledgeEvent, KnowledgeStore, StoreStats};
use crate::embedding::{EmbeddingCoordinator, EmbeddingProvider};
use crate::engines::{ConstraintEngine, MetaEngine, RelevanceEngine};
use crate::error::{Error, Result};
use crate::graph::GraphAnalytics;
use crate::infrastructure::knowledge::SqliteKnowledgeStore;
use crate::pipeline::{PipelineComponents, QueryPipeline};
use crate::storage::{Database, DatabaseConfig};

/// Every component of a running backbone
pub struct Backbone {
    database: Database,
    store: Arc<dyn KnowledgeStore>,
    analytics: Arc<GraphAnalytics>,
    confidence: Arc<ConfidenceModel>,
    relevance: Arc<RelevanceEngine>,
    constraints: Arc<ConstraintEngine>,
    meta: Arc<MetaEngine>,
    embeddings: Option<Arc<EmbeddingCoordinator>>,
    pipeline: Arc<QueryPipeline>,
}

impl Backbone {
    /// Open the configured store and build every component
    pub async fn assemble(config: &KeelConfig, provider: Option<Arc<dyn EmbeddingProvider>>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::ConfigError(e.to_string()))?;
        Self::with_database(config, config.store.database_config(), provider).await
    }

    /// Backbone over a fresh in-memory store
    pub async fn in_memory(config: &KeelConfig, provider: Option<Arc<dyn EmbeddingProvider>>) -> Result<Self> {
        Self::with_database(config, DatabaseConfig::in_memory(), provider).await
    }

    async fn with_database(
        config: &KeelConfig,
        db_config: DatabaseConfig,
        provider: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Result<Self> {
        let database = Database::new(db_config)
            .await
            .map_err(|e| Error::StoreUnavailable(format!("{:#}", e)))?;
        let store: Arc<dyn KnowledgeStore> = Arc::new(SqliteKnowledgeStore::new(database.pool().clone()));
        store
            .health_check()
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?;

        let analytics = Arc::new(GraphAnalytics::new(store.clone()));
        let confidence = Arc::new(ConfidenceModel::new(store.clone(), config.confidence.clone()));

        let mut relevance = RelevanceEngine::new(
            store.clone(),
            analytics.clone(),
            confidence.clone(),
            config.relevance.clone(),
        );
        if let Some(provider) = &provider {
            relevance = relevance.with_embedder(provider.clone());
        }
        let relevance = Arc::new(relevance);

        let constraints = Arc::new(ConstraintEngine::new(store.clone(), config.constraints.clone()));
        let meta = Arc::new(MetaEngine::new(store.clone(), confidence.clone(), config.meta.clone()));
        let embeddings = provider.map(|provider| {
            Arc::new(EmbeddingCoordinator::new(provider, store.clone(), config.embedding.clone()))
        });
        let cache: Arc<dyn QueryCache> = Arc::new(TieredCache::new(store.clone(), &config.cache));

        let pipeline = Arc::new(QueryPipeline::new(
            PipelineComponents {
                store: store.clone(),
                cache,
                analytics: analytics.clone(),
                confidence: confidence.clone(),
                relevance: relevance.clone(),
                constraints: constraints.clone(),
                meta: meta.clone(),
                embeddings: embeddings.clone(),
            },
            config.pipeline.clone(),
        ));

        info!(
            path = %database.path().display(),
            embeddings = embeddings.is_some(),
            "Knowledge backbone assembled"
        );

        Ok(Self {
            database,
            store,
            analytics,
            confidence,
            relevance,
            constraints,
            meta,
            embeddings,
            pipeline,
        })
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn store(&self) -> &Arc<dyn KnowledgeStore> {
        &self.store
    }

    pub fn analytics(&self) -> &Arc<GraphAnalytics> {
        &self.analytics
    }

    pub fn confidence(&self) -> &Arc<ConfidenceModel> {
        &self.confidence
    }

    pub fn relevance(&self) -> &Arc<RelevanceEngine> {
        &self.relevance
    }

    pub fn constraints(&self) -> &Arc<ConstraintEngine> {
        &self.constraints
    }

    pub fn meta(&self) -> &Arc<MetaEngine> {
        &self.meta
    }

    pub fn embeddings(&self) -> Option<&Arc<EmbeddingCoordinator>> {
        self.embeddings.as_ref()
    }

    pub fn pipeline(&self) -> &Arc<QueryPipeline> {
        &self.pipeline
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.store.stats().await
    }

    /// Start the event loop and the exception sweeper; send `true` on the
    /// returned watch channel to stop the sweeper
    pub fn start(
        &self,
        events: mpsc::Receiver<KnowledgeEvent>,
    ) -> (watch::Sender<bool>, Vec<JoinHandle<()>>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = vec![
            self.pipeline.clone().spawn_event_loop(events),
            self.constraints.clone().spawn_exception_sweeper(shutdown_rx),
        ];
        (shutdown_tx, handles)
    }

    /// Close the store
    pub async fn shutdown(self) {
        self.database.close().await;
        info!("Knowledge backbone shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::domain::knowledge::CodeEntity;

    #[tokio::test]
    async fn test_in_memory_backbone() {
        let backbone = Backbone::in_memory(&KeelConfig::default(), None).await.unwrap();
        backbone
            .store()
            .upsert_entity(&CodeEntity::module("src/lib.rs").with_content("x"))
            .await
            .unwrap();

        assert_eq!(backbone.stats().await.unwrap().entities, 1);
        assert!(backbone.embeddings().is_none());
        backbone.shutdown().await;
    }

    #[tokio::test]
    async fn test_unopenable_store_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "not a directory").unwrap();

        let config = KeelConfig {
            store: StoreConfig {
                path: Some(blocker.join("knowledge.db")),
                max_connections: 1,
            },
            ..KeelConfig::default()
        };
        let err = Backbone::assemble(&config, None).await.err().unwrap();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_start_and_stop_background_tasks() {
        let backbone = Backbone::in_memory(&KeelConfig::default(), None).await.unwrap();
        let (tx, rx) = mpsc::channel(4);
        let (shutdown, handles) = backbone.start(rx);

        tx.send(KnowledgeEvent::shutdown()).await.unwrap();
        shutdown.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
