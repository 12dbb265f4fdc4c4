//! Graph analytics over the module/call graph
//!
//! - `snapshot`: the immutable [`CodeGraph`] arena built from the store
//! - `analytics`: pure algorithms (Tarjan, PageRank, Brandes, Louvain, coupling)
//!
//! [`GraphAnalytics`] memoizes each metric by the snapshot checksum, so a
//! metric is recomputed only after a relationship changes.

pub mod analytics;
pub mod snapshot;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::knowledge::KnowledgeStore;
use crate::error::Result;

pub use analytics::{
    AffectedEntity, BlastRadius, Communities, CouplingMetrics, Cycle, ImportanceRanking,
    RankConfig, betweenness, blast_radius, communities, coupling, detect_cycles, expand_scope,
    importance_rank, sorted_scores,
};
pub use snapshot::{CodeGraph, GraphNode};

/// Memoized metrics for one graph checksum
#[derive(Default)]
struct Memo {
    checksum: String,
    cycles: Option<Arc<Vec<Cycle>>>,
    ranking: Option<Arc<ImportanceRanking>>,
    betweenness: Option<Arc<HashMap<String, f64>>>,
    communities: Option<Arc<Communities>>,
    coupling: Option<Arc<HashMap<String, CouplingMetrics>>>,
}

/// Store-backed analytics with checksum-keyed memoization
pub struct GraphAnalytics {
    store: Arc<dyn KnowledgeStore>,
    rank_config: RankConfig,
    memo: Mutex<Memo>,
}

impl GraphAnalytics {
    pub fn new(store: Arc<dyn KnowledgeStore>) -> Self {
        Self {
            store,
            rank_config: RankConfig::default(),
            memo: Mutex::new(Memo::default()),
        }
    }

    pub fn with_rank_config(mut self, config: RankConfig) -> Self {
        self.rank_config = config;
        self
    }

    /// Current structural graph from the store
    pub async fn snapshot(&self) -> Result<Arc<CodeGraph>> {
        let graph = CodeGraph::load(self.store.as_ref()).await?;
        debug!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            checksum = %&graph.checksum()[..12],
            "Graph snapshot loaded"
        );
        Ok(Arc::new(graph))
    }

    pub fn cycles(&self, graph: &CodeGraph) -> Arc<Vec<Cycle>> {
        let mut memo = self.memo_for(graph);
        memo.cycles
            .get_or_insert_with(|| Arc::new(detect_cycles(graph)))
            .clone()
    }

    pub fn importance(&self, graph: &CodeGraph) -> Arc<ImportanceRanking> {
        let config = self.rank_config;
        let mut memo = self.memo_for(graph);
        memo.ranking
            .get_or_insert_with(|| {
                let ranking = importance_rank(graph, &config);
                if !ranking.converged {
                    debug!(
                        iterations = ranking.iterations,
                        "PageRank hit the iteration cap, using best-effort scores"
                    );
                }
                Arc::new(ranking)
            })
            .clone()
    }

    pub fn centrality(&self, graph: &CodeGraph) -> Arc<HashMap<String, f64>> {
        let mut memo = self.memo_for(graph);
        memo.betweenness
            .get_or_insert_with(|| Arc::new(betweenness(graph)))
            .clone()
    }

    pub fn communities(&self, graph: &CodeGraph) -> Arc<Communities> {
        let mut memo = self.memo_for(graph);
        memo.communities
            .get_or_insert_with(|| Arc::new(communities(graph)))
            .clone()
    }

    pub fn coupling(&self, graph: &CodeGraph) -> Arc<HashMap<String, CouplingMetrics>> {
        let mut memo = self.memo_for(graph);
        memo.coupling
            .get_or_insert_with(|| Arc::new(coupling(graph)))
            .clone()
    }

    /// Blast radius with each affected entity annotated by its centrality
    pub fn blast_radius(&self, graph: &CodeGraph, files: &[String], max_depth: usize) -> BlastRadius {
        let centrality = self.centrality(graph);
        let mut radius = blast_radius(graph, files, max_depth);
        for affected in &mut radius.affected {
            affected.centrality = centrality.get(&affected.id).copied().unwrap_or(0.0);
        }
        radius
    }

    /// Structure summary: cycles, most important, bridges, most unstable
    pub fn architecture_summary(&self, graph: &CodeGraph, top: usize) -> ArchitectureSummary {
        let cycles = self.cycles(graph);
        let ranking = self.importance(graph);
        let centrality = self.centrality(graph);
        let communities = self.communities(graph);
        let coupling = self.coupling(graph);

        let bridges = sorted_scores(&centrality)
            .into_iter()
            .filter(|(_, score)| *score > 0.0)
            .take(top)
            .collect();

        let mut unstable: Vec<(String, f64)> = coupling
            .iter()
            .filter(|(_, m)| m.afferent > 0 && m.efferent > 0)
            .map(|(id, m)| (id.clone(), m.instability))
            .collect();
        unstable.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        unstable.truncate(top);

        ArchitectureSummary {
            entities: graph.node_count(),
            edges: graph.edge_count(),
            cycles: (*cycles).clone(),
            most_important: ranking.top(top),
            bridges,
            unstable,
            community_count: communities.count,
            modularity: communities.modularity,
        }
    }

    /// Drop every memoized metric
    pub fn invalidate(&self) {
        *self.lock() = Memo::default();
    }

    fn memo_for(&self, graph: &CodeGraph) -> MutexGuard<'_, Memo> {
        let mut memo = self.lock();
        if memo.checksum != graph.checksum() {
            *memo = Memo {
                checksum: graph.checksum().to_string(),
                ..Memo::default()
            };
        }
        memo
    }

    fn lock(&self) -> MutexGuard<'_, Memo> {
        self.memo.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Structure summary for reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureSummary {
    pub entities: usize,
    pub edges: usize,
    pub cycles: Vec<Cycle>,
    pub most_important: Vec<(String, f64)>,
    pub bridges: Vec<(String, f64)>,
    pub unstable: Vec<(String, f64)>,
    pub community_count: usize,
    pub modularity: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::knowledge::{CodeEntity, Relationship};
    use crate::infrastructure::knowledge::SqliteKnowledgeStore;
    use crate::storage::Database;

    async fn store_with(nodes: &[&str], edges: &[(&str, &str)]) -> Arc<dyn KnowledgeStore> {
        let db = Database::in_memory().await.expect("db");
        let store = SqliteKnowledgeStore::new(db.pool().clone());
        for id in nodes {
            store
                .upsert_entity(&CodeEntity::module(*id).with_content(id))
                .await
                .unwrap();
        }
        for (a, b) in edges {
            store
                .upsert_relationship(&Relationship::imports(*a, *b))
                .await
                .unwrap();
        }
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_memo_reused_until_edges_change() {
        let store = store_with(&["a", "b", "c"], &[("a", "b")]).await;
        let analytics = GraphAnalytics::new(store.clone());

        let first = analytics.snapshot().await.unwrap();
        let ranking = analytics.importance(&first);
        let again = analytics.importance(&analytics.snapshot().await.unwrap());
        assert!(Arc::ptr_eq(&ranking, &again));

        store
            .upsert_relationship(&Relationship::imports("c", "b"))
            .await
            .unwrap();
        let changed = analytics.snapshot().await.unwrap();
        assert_ne!(first.checksum(), changed.checksum());
        assert!(!Arc::ptr_eq(&ranking, &analytics.importance(&changed)));
    }

    #[tokio::test]
    async fn test_blast_radius_annotates_centrality() {
        let store = store_with(&["a", "b", "c"], &[("a", "b"), ("b", "c")]).await;
        let analytics = GraphAnalytics::new(store);
        let graph = analytics.snapshot().await.unwrap();

        let radius = analytics.blast_radius(&graph, &["c".to_string()], 2);
        let bridge = radius.affected.iter().find(|a| a.id == "b").unwrap();
        assert_eq!(bridge.centrality, 1.0);
    }

    #[tokio::test]
    async fn test_architecture_summary() {
        let store = store_with(
            &["a", "b", "c", "d"],
            &[("a", "b"), ("b", "c"), ("c", "a"), ("d", "a")],
        )
        .await;
        let analytics = GraphAnalytics::new(store);
        let graph = analytics.snapshot().await.unwrap();

        let summary = analytics.architecture_summary(&graph, 3);
        assert_eq!(summary.entities, 4);
        assert_eq!(summary.edges, 4);
        assert_eq!(summary.cycles.len(), 1);
        assert_eq!(summary.most_important.len(), 3);
        assert!(summary.community_count >= 1);

        analytics.invalidate();
        assert_eq!(analytics.cycles(&graph).len(), 1);
    }
}
