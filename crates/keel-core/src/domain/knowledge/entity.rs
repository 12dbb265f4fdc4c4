//! Code entities for the knowledge store
//!
//! Entities are the modules and functions of the indexed codebase. Identity is
//! the path (modules) or the qualified name (functions). Every write is
//! versioned by a content checksum so re-ingesting unchanged content is a no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A module or function known to the knowledge store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeEntity {
    /// Path for modules, qualified name for functions
    pub id: String,
    /// Kind of entity
    pub kind: EntityKind,
    /// Short display name
    pub name: String,
    /// File that contains the entity (equal to `id` for modules)
    pub path: String,
    /// Signature for functions, export summary for modules
    pub signature: Option<String>,
    /// Size in bytes of the source span
    pub size: u64,
    /// Content checksum (hex SHA-256)
    pub checksum: String,
    /// Complexity score assigned by ingestion
    pub complexity: f32,
    /// Last modification time of the underlying source
    pub last_modified: DateTime<Utc>,
    /// When the entity was last (re)indexed
    pub indexed_at: DateTime<Utc>,
    /// Set when the underlying file has been removed
    pub tombstoned: bool,
    /// Optimistic concurrency version, bumped by every committed write
    pub version: i64,
}

impl CodeEntity {
    /// Create a new entity with an empty checksum
    pub fn new(id: impl Into<String>, kind: EntityKind) -> Self {
        let id = id.into();
        let now = Utc::now();
        let name = Self::display_name(&id, kind);
        let path = match kind {
            EntityKind::Module => id.clone(),
            EntityKind::Function => id
                .rsplit_once("::")
                .map(|(p, _)| p.to_string())
                .unwrap_or_else(|| id.clone()),
        };

        Self {
            id,
            kind,
            name,
            path,
            signature: None,
            size: 0,
            checksum: String::new(),
            complexity: 0.0,
            last_modified: now,
            indexed_at: now,
            tombstoned: false,
            version: 0,
        }
    }

    /// Convenience constructor for a module identified by its path
    pub fn module(path: impl Into<String>) -> Self {
        Self::new(path, EntityKind::Module)
    }

    /// Convenience constructor for a function identified by `path::name`
    pub fn function(qualified_name: impl Into<String>) -> Self {
        Self::new(qualified_name, EntityKind::Function)
    }

    /// Set the containing file path
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Set the signature
    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    /// Set the source content; updates size and checksum
    pub fn with_content(mut self, content: &str) -> Self {
        self.size = content.len() as u64;
        self.checksum = Self::compute_checksum(content);
        self
    }

    /// Set the checksum directly
    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = checksum.into();
        self
    }

    /// Set the complexity score
    pub fn with_complexity(mut self, complexity: f32) -> Self {
        self.complexity = complexity.max(0.0);
        self
    }

    /// Set the last-modified timestamp
    pub fn with_last_modified(mut self, last_modified: DateTime<Utc>) -> Self {
        self.last_modified = last_modified;
        self
    }

    /// Set the indexed-at timestamp
    pub fn with_indexed_at(mut self, indexed_at: DateTime<Utc>) -> Self {
        self.indexed_at = indexed_at;
        self
    }

    /// Mark the entity as removed from the working tree
    pub fn tombstone(&mut self) {
        self.tombstoned = true;
        self.indexed_at = Utc::now();
    }

    /// Hex SHA-256 of the given content
    pub fn compute_checksum(content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Text used to embed this entity
    pub fn embedding_text(&self) -> String {
        let mut text = format!("{} {} {}", self.kind, self.name, self.path);
        if let Some(signature) = &self.signature {
            text.push(' ');
            text.push_str(signature);
        }
        text
    }

    /// Days elapsed since the entity was indexed
    pub fn days_since_index(&self, now: DateTime<Utc>) -> f64 {
        let seconds = (now - self.indexed_at).num_seconds().max(0) as f64;
        seconds / 86_400.0
    }

    /// Days elapsed since the source was last modified
    pub fn days_since_modified(&self, now: DateTime<Utc>) -> f64 {
        let seconds = (now - self.last_modified).num_seconds().max(0) as f64;
        seconds / 86_400.0
    }

    fn display_name(id: &str, kind: EntityKind) -> String {
        match kind {
            EntityKind::Module => id.rsplit('/').next().unwrap_or(id).to_string(),
            EntityKind::Function => id.rsplit("::").next().unwrap_or(id).to_string(),
        }
    }
}

/// Kinds of code entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A source file or module
    Module,
    /// A function or method
    Function,
}

impl EntityKind {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Module => "module",
            Self::Function => "function",
        }
    }

    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "module" | "file" => Some(Self::Module),
            "function" | "fn" | "method" => Some(Self::Function),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of an entity upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The entity did not exist and was created
    Inserted,
    /// The checksum changed and the entity was rewritten
    Updated,
    /// The stored checksum already matched; nothing was written
    Unchanged,
}
