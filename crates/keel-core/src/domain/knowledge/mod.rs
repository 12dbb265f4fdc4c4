//! Code knowledge domain
//!
//! The data model shared by every component of the reasoning core:
//!
//! - **CodeEntity**: a module or function, versioned by content checksum
//! - **Relationship**: a directed, typed, weighted edge between entities
//! - **Embedding**: a model-tagged vector, comparable only within one model
//! - **ContextPack / OutcomeRecord**: the learning loop
//! - **CacheEntry**: a cached query response with an expiry
//! - **Constraint / Violation**: rules over changes
//!
//! The [`KnowledgeStore`] trait is the persistence contract; the SQLite
//! implementation lives in `infrastructure::knowledge`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use keel_core::domain::knowledge::{CodeEntity, KnowledgeStore, Relationship};
//!
//! let entity = CodeEntity::module("src/auth.rs").with_content(&source);
//! store.upsert_entity(&entity).await?;
//! store.upsert_relationship(&Relationship::imports("src/api.rs", "src/auth.rs")).await?;
//! ```

mod cache;
mod constraint;
mod embedding;
mod entity;
mod event;
mod pack;
mod relationship;
mod repository;

pub use cache::CacheEntry;
pub use constraint::{
    Constraint, ConstraintException, ConstraintRule, ConstraintSource, ConstraintState,
    ObservedPattern, Violation,
};
pub use embedding::Embedding;
pub use entity::{CodeEntity, EntityKind, UpsertOutcome};
pub use event::{ConfidenceEvent, KnowledgeEvent};
pub use pack::{ContextPack, OutcomeRecord, estimate_tokens};
pub use relationship::{Relationship, RelationshipKind};
pub use repository::{KnowledgeStore, StoreStats};
