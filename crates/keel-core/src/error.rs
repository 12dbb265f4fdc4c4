//! Error types for Keel

use thiserror::Error;

/// Result type alias using Keel's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Keel error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Store errors (E001-E099)
    #[error("Knowledge store unavailable: {0}. Check `store.path` with `keel config get store.path`.")]
    StoreUnavailable(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Entity '{0}' not found in the knowledge store.")]
    EntityNotFound(String),

    #[error("Write conflict on entity '{0}' after {1} attempts")]
    WriteConflict(String, u32),

    // Embedding errors (E100-E199)
    #[error("Embedding provider unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error(
        "Embedding mismatch: expected {expected_model} ({expected} dims), got {actual_model} ({actual} dims)"
    )]
    DimensionMismatch {
        expected: usize,
        actual: usize,
        expected_model: String,
        actual_model: String,
    },

    // Constraint errors (E200-E299)
    #[error("Constraint '{0}' not found. List constraints with `keel constraints list`.")]
    ConstraintNotFound(String),

    #[error("Constraint '{id}' could not be evaluated: {reason}")]
    ConstraintEvaluation { id: String, reason: String },

    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    // Cache errors (E300-E399)
    #[error("Cache entry '{0}' is corrupt")]
    CacheCorrupt(String),

    // Budget errors (E400-E499)
    #[error("Query budget exceeded: {0}")]
    BudgetExceeded(String),

    // Learning loop errors (E500-E599)
    #[error("Context pack '{0}' not found.")]
    PackNotFound(String),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::StoreUnavailable(_) => "E001",
            Self::DatabaseError(_) => "E002",
            Self::EntityNotFound(_) => "E003",
            Self::WriteConflict(..) => "E004",
            Self::EmbeddingUnavailable(_) => "E100",
            Self::DimensionMismatch { .. } => "E101",
            Self::ConstraintNotFound(_) => "E200",
            Self::ConstraintEvaluation { .. } => "E201",
            Self::InvalidPattern { .. } => "E202",
            Self::CacheCorrupt(_) => "E300",
            Self::BudgetExceeded(_) => "E400",
            Self::PackNotFound(_) => "E500",
            Self::ConfigError(_) => "E600",
            Self::InvalidInput(_) => "E800",
            Self::Serialization(_) => "E801",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::StoreUnavailable(_) => Some("keel config get store.path".to_string()),
            Self::EmbeddingUnavailable(_) => {
                Some("Retry with depth L0, which does not require embeddings".to_string())
            }
            Self::DimensionMismatch { expected_model, .. } => Some(format!(
                "Re-embed the knowledge store with model '{}'",
                expected_model
            )),
            Self::ConstraintNotFound(_) => Some("keel constraints list".to_string()),
            Self::WriteConflict(..) => Some("Retry the write".to_string()),
            _ => None,
        }
    }

    /// Whether the error leaves the reasoning core unable to answer anything
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}
