//! In-memory snapshot of the structural graph
//!
//! Nodes are live entities, edges are structural relationships (imports,
//! calls) between two live entities. The snapshot is an arena with integer
//! indices, so it can be shared across threads and analysed without touching
//! the store again.

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use sha2::{Digest, Sha256};

use crate::domain::knowledge::{CodeEntity, KnowledgeStore, Relationship, RelationshipKind};
use crate::error::Result;

/// Node payload
#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub id: String,
    /// File containing the entity
    pub path: String,
}

/// Immutable structural graph
#[derive(Debug, Clone)]
pub struct CodeGraph {
    graph: DiGraph<GraphNode, RelationshipKind>,
    index: HashMap<String, NodeIndex>,
    checksum: String,
}

impl CodeGraph {
    /// Build a snapshot from entities and relationships
    ///
    /// Tombstoned entities, non-structural kinds, self-loops and edges with an
    /// unknown endpoint are dropped. Parallel imports/calls edges collapse.
    pub fn build(entities: &[CodeEntity], relationships: &[Relationship]) -> Self {
        let mut live: Vec<&CodeEntity> = entities.iter().filter(|e| !e.tombstoned).collect();
        live.sort_by(|a, b| a.id.cmp(&b.id));

        let mut graph = DiGraph::new();
        let mut index = HashMap::with_capacity(live.len());
        for entity in live {
            let idx = graph.add_node(GraphNode {
                id: entity.id.clone(),
                path: entity.path.clone(),
            });
            index.insert(entity.id.clone(), idx);
        }

        let mut edge_keys: Vec<String> = Vec::new();
        let mut structural: Vec<&Relationship> =
            relationships.iter().filter(|r| r.is_structural()).collect();
        structural.sort_by(|a, b| a.edge_key().cmp(&b.edge_key()));

        for rel in structural {
            if rel.source_id == rel.target_id {
                continue;
            }
            let (Some(&source), Some(&target)) =
                (index.get(&rel.source_id), index.get(&rel.target_id))
            else {
                continue;
            };
            graph.update_edge(source, target, rel.kind);
            edge_keys.push(rel.edge_key());
        }
        edge_keys.dedup();

        let mut node_ids: Vec<&String> = index.keys().collect();
        node_ids.sort();

        let mut hasher = Sha256::new();
        for id in node_ids {
            hasher.update(id.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update([1u8]);
        for key in &edge_keys {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
        }
        let checksum = hex::encode(hasher.finalize());

        Self {
            graph,
            index,
            checksum,
        }
    }

    /// Load the current structural graph from the store
    pub async fn load(store: &dyn KnowledgeStore) -> Result<Self> {
        let entities = store.list_entities(false).await?;
        let mut relationships = Vec::new();
        for kind in RelationshipKind::structural() {
            relationships.extend(store.list_relationships(Some(*kind)).await?);
        }
        Ok(Self::build(&entities, &relationships))
    }

    /// Hash of the node and edge sets; changes whenever a relationship does
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn index_of(&self, id: &str) -> Option<NodeIndex> {
        self.index.get(id).copied()
    }

    /// Entity id of a node index
    pub fn id_of(&self, idx: NodeIndex) -> &str {
        &self.graph[idx].id
    }

    pub fn node(&self, idx: NodeIndex) -> &GraphNode {
        &self.graph[idx]
    }

    pub fn graph(&self) -> &DiGraph<GraphNode, RelationshipKind> {
        &self.graph
    }

    /// Every node index located in a file, or the node with that id
    pub fn nodes_for_path(&self, path: &str) -> Vec<NodeIndex> {
        let mut nodes: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&idx| {
                let node = &self.graph[idx];
                node.id == path || node.path == path
            })
            .collect();
        nodes.sort();
        nodes
    }

    /// Entities the given entity depends on (outgoing edges)
    pub fn dependencies(&self, id: &str) -> Vec<&str> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Entities depending on the given entity (incoming edges)
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.neighbors(id, Direction::Incoming)
    }

    fn neighbors(&self, id: &str, direction: Direction) -> Vec<&str> {
        let Some(idx) = self.index_of(id) else {
            return Vec::new();
        };
        let mut ids: Vec<&str> = self
            .graph
            .neighbors_directed(idx, direction)
            .map(|n| self.id_of(n))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modules(ids: &[&str]) -> Vec<CodeEntity> {
        ids.iter()
            .map(|id| CodeEntity::module(*id).with_content(id))
            .collect()
    }

    #[test]
    fn test_build_filters_edges() {
        let mut entities = modules(&["a", "b", "c"]);
        entities[2].tombstoned = true;

        let relationships = vec![
            Relationship::imports("a", "b"),
            Relationship::imports("a", "b"),
            Relationship::calls("a", "b"),
            Relationship::imports("a", "a"),
            Relationship::imports("a", "c"),
            Relationship::owns("alice", "a"),
            Relationship::tests("b", "a"),
        ];

        let graph = CodeGraph::build(&entities, &relationships);
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 1);
        assert!(!graph.contains("c"));
        assert_eq!(graph.dependencies("a"), vec!["b"]);
        assert_eq!(graph.dependents("b"), vec!["a"]);
    }

    #[test]
    fn test_checksum_tracks_edges() {
        let entities = modules(&["a", "b"]);
        let empty = CodeGraph::build(&entities, &[]);
        let linked = CodeGraph::build(&entities, &[Relationship::imports("a", "b")]);
        let again = CodeGraph::build(&entities, &[Relationship::imports("a", "b")]);

        assert_ne!(empty.checksum(), linked.checksum());
        assert_eq!(linked.checksum(), again.checksum());
    }

    #[test]
    fn test_checksum_independent_of_input_order() {
        let entities = modules(&["a", "b", "c"]);
        let mut reversed = entities.clone();
        reversed.reverse();

        let edges = vec![Relationship::imports("a", "b"), Relationship::calls("b", "c")];
        let mut reversed_edges = edges.clone();
        reversed_edges.reverse();

        assert_eq!(
            CodeGraph::build(&entities, &edges).checksum(),
            CodeGraph::build(&reversed, &reversed_edges).checksum()
        );
    }

    #[test]
    fn test_nodes_for_path_includes_functions() {
        let mut entities = modules(&["src/a.rs"]);
        entities.push(CodeEntity::function("src/a.rs::run").with_content("run"));
        let graph = CodeGraph::build(&entities, &[]);
        assert_eq!(graph.nodes_for_path("src/a.rs").len(), 2);
        assert!(graph.nodes_for_path("src/b.rs").is_empty());
    }
}
