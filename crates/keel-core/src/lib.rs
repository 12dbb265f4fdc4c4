//! Keel Core Library
//!
//! The reasoning core of Keel, a learned code-knowledge backbone:
//! - Knowledge store (entities, relationships, embeddings, query cache) on SQLite
//! - Graph analytics (cycles, PageRank, betweenness, communities, blast radius)
//! - Confidence model and Ochiai fault attribution
//! - Relevance, constraint and meta-knowledge engines
//! - Tiered, budgeted, cached query pipeline
//! - Embedding batch coordinator

pub mod attribution;
pub mod backbone;
pub mod cache;
pub mod confidence;
pub mod config;
pub mod domain;
pub mod embedding;
pub mod engines;
pub mod error;
pub mod graph;
pub mod infrastructure;
pub mod pipeline;
pub mod storage;

#[cfg(test)]
mod config_tests;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::backbone::Backbone;
    pub use crate::config::KeelConfig;
    pub use crate::domain::knowledge::{
        CodeEntity, ContextPack, KnowledgeEvent, KnowledgeStore, OutcomeRecord, Relationship,
    };
    pub use crate::engines::{Budget, QueryDepth};
    pub use crate::error::{Error, Result};
    pub use crate::pipeline::{QueryRequest, QueryResponse};
}
