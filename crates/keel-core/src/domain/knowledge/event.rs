//! Knowledge events
//!
//! `KnowledgeEvent` is the typed message passed from the environment into the
//! query pipeline (file changes, outcomes). `ConfidenceEvent` is the persisted
//! audit trail of confidence movements per entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::pack::OutcomeRecord;

/// Notifications consumed by the query pipeline's event loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum KnowledgeEvent {
    /// A single file changed on disk
    FileChanged {
        path: String,
        timestamp: DateTime<Utc>,
    },
    /// Several files changed together
    FilesChanged {
        paths: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    /// A consuming task finished
    OutcomeSubmitted {
        outcome: OutcomeRecord,
        timestamp: DateTime<Utc>,
    },
    /// Stop the event loop
    Shutdown { timestamp: DateTime<Utc> },
}

impl KnowledgeEvent {
    pub fn file_changed(path: impl Into<String>) -> Self {
        Self::FileChanged {
            path: path.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn files_changed(paths: Vec<String>) -> Self {
        Self::FilesChanged {
            paths,
            timestamp: Utc::now(),
        }
    }

    pub fn outcome_submitted(outcome: OutcomeRecord) -> Self {
        Self::OutcomeSubmitted {
            outcome,
            timestamp: Utc::now(),
        }
    }

    pub fn shutdown() -> Self {
        Self::Shutdown {
            timestamp: Utc::now(),
        }
    }

    /// Get the timestamp of the event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::FileChanged { timestamp, .. }
            | Self::FilesChanged { timestamp, .. }
            | Self::OutcomeSubmitted { timestamp, .. }
            | Self::Shutdown { timestamp } => *timestamp,
        }
    }

    /// Get the event type name
    pub fn event_type_name(&self) -> &'static str {
        match self {
            Self::FileChanged { .. } => "file_changed",
            Self::FilesChanged { .. } => "files_changed",
            Self::OutcomeSubmitted { .. } => "outcome_submitted",
            Self::Shutdown { .. } => "shutdown",
        }
    }
}

/// A recorded movement of an entity's confidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceEvent {
    pub entity_id: String,
    /// Signed change; positive after a success, negative after a failure
    pub delta: f32,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

impl ConfidenceEvent {
    pub fn new(entity_id: impl Into<String>, delta: f32, reason: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            delta,
            reason: reason.into(),
            recorded_at: Utc::now(),
        }
    }

    pub fn at(mut self, recorded_at: DateTime<Utc>) -> Self {
        self.recorded_at = recorded_at;
        self
    }
}
