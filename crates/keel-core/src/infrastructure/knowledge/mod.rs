//! Knowledge store infrastructure
//!
//! SQLite implementation of the [`KnowledgeStore`](crate::domain::knowledge::KnowledgeStore) trait.

mod repository;

pub use repository::{MAX_WRITE_ATTEMPTS, SqliteKnowledgeStore};
