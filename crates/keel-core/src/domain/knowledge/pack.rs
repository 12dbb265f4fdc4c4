//! Context packs and recorded task outcomes
//!
//! A context pack bundles what the relevance engine assembled about one target
//! entity. Packs are never deleted; their running success/failure counters are
//! the raw material of the learning loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A reusable unit of assembled knowledge about a target entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPack {
    /// Stable id derived from the target entity
    pub id: String,
    /// Entity the pack is about
    pub target_entity_id: String,
    /// One-line summary
    pub summary: String,
    /// Facts worth injecting into a prompt
    pub key_facts: Vec<String>,
    /// Files a consumer should also look at
    pub related_files: Vec<String>,
    /// Relevance score from the query that produced the pack
    pub score: f32,
    /// Consuming tasks that succeeded with this pack
    pub success_count: u32,
    /// Consuming tasks that failed with this pack
    pub failure_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContextPack {
    pub fn new(target_entity_id: impl Into<String>) -> Self {
        let target_entity_id = target_entity_id.into();
        let now = Utc::now();
        Self {
            id: Self::id_for(&target_entity_id),
            target_entity_id,
            summary: String::new(),
            key_facts: Vec::new(),
            related_files: Vec::new(),
            score: 0.0,
            success_count: 0,
            failure_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Deterministic pack id for a target entity
    pub fn id_for(target_entity_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(target_entity_id.as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("pack-{}", &digest[..16])
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_key_facts(mut self, facts: Vec<String>) -> Self {
        self.key_facts = facts;
        self
    }

    pub fn with_related_files(mut self, files: Vec<String>) -> Self {
        self.related_files = files;
        self
    }

    pub fn with_score(mut self, score: f32) -> Self {
        self.score = score;
        self
    }

    /// Target plus related files, without duplicates
    pub fn entity_ids(&self) -> Vec<String> {
        let mut ids = vec![self.target_entity_id.clone()];
        for file in &self.related_files {
            if !ids.contains(file) {
                ids.push(file.clone());
            }
        }
        ids
    }

    /// Total outcomes recorded against this pack
    pub fn usage_count(&self) -> u32 {
        self.success_count + self.failure_count
    }

    /// Observed success rate, `None` before the first outcome
    pub fn success_rate(&self) -> Option<f32> {
        let total = self.usage_count();
        if total == 0 {
            None
        } else {
            Some(self.success_count as f32 / total as f32)
        }
    }

    /// Rough token cost of injecting this pack into a prompt
    pub fn estimated_tokens(&self) -> usize {
        let mut text = self.summary.len();
        text += self.key_facts.iter().map(|f| f.len() + 1).sum::<usize>();
        text += self.related_files.iter().map(|f| f.len() + 1).sum::<usize>();
        estimate_tokens_for_len(text + self.target_entity_id.len())
    }
}

/// Approximate token count for a piece of text (4 characters per token)
pub fn estimate_tokens(text: &str) -> usize {
    estimate_tokens_for_len(text.len())
}

fn estimate_tokens_for_len(len: usize) -> usize {
    len.div_ceil(4)
}

/// Append-only record of a consuming task's result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub id: String,
    /// Packs the task consumed, sorted
    pub pack_ids: Vec<String>,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub failure_category: Option<String>,
    pub files_modified: Vec<String>,
    /// Caller-supplied task identifier, part of duplicate detection when set
    pub task_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl OutcomeRecord {
    pub fn new(pack_ids: Vec<String>, success: bool) -> Self {
        let mut pack_ids = pack_ids;
        pack_ids.sort();
        pack_ids.dedup();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pack_ids,
            success,
            failure_reason: None,
            failure_category: None,
            files_modified: Vec::new(),
            task_id: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn success(pack_ids: Vec<String>) -> Self {
        Self::new(pack_ids, true)
    }

    pub fn failure(pack_ids: Vec<String>, reason: impl Into<String>) -> Self {
        let mut record = Self::new(pack_ids, false);
        record.failure_reason = Some(reason.into());
        record
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.failure_category = Some(category.into());
        self
    }

    pub fn with_files_modified(mut self, files: Vec<String>) -> Self {
        self.files_modified = files;
        self
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Key used to detect duplicate submissions
    ///
    /// Identical `(task id, packs, result, reason, files modified)` submissions
    /// share a key. Without a task id, two separate tasks that used the same
    /// packs with the same result and file set are indistinguishable.
    pub fn submission_key(&self) -> String {
        let mut hasher = Sha256::new();
        if let Some(task_id) = &self.task_id {
            hasher.update(b"task:");
            hasher.update(task_id.as_bytes());
            hasher.update([0u8]);
        }
        for pack_id in &self.pack_ids {
            hasher.update(pack_id.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(if self.success { b"ok" } else { b"ko" });
        if let Some(reason) = &self.failure_reason {
            hasher.update([0u8]);
            hasher.update(reason.as_bytes());
        }
        let mut files: Vec<&str> = self.files_modified.iter().map(String::as_str).collect();
        files.sort_unstable();
        files.dedup();
        for file in files {
            hasher.update(b"\0file:");
            hasher.update(file.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_id_is_deterministic() {
        let a = ContextPack::new("src/auth.rs");
        let b = ContextPack::new("src/auth.rs");
        assert_eq!(a.id, b.id);
        assert!(a.id.starts_with("pack-"));
        assert_eq!(a.id.len(), "pack-".len() + 16);
        assert_ne!(a.id, ContextPack::new("src/db.rs").id);
    }

    #[test]
    fn test_entity_ids_dedup() {
        let pack = ContextPack::new("src/a.rs")
            .with_related_files(vec!["src/b.rs".into(), "src/a.rs".into()]);
        assert_eq!(pack.entity_ids(), vec!["src/a.rs", "src/b.rs"]);
    }

    #[test]
    fn test_success_rate() {
        let mut pack = ContextPack::new("src/a.rs");
        assert_eq!(pack.success_rate(), None);
        pack.success_count = 3;
        pack.failure_count = 1;
        assert_eq!(pack.success_rate(), Some(0.75));
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_outcome_pack_ids_sorted() {
        let outcome = OutcomeRecord::success(vec!["b".into(), "a".into(), "b".into()]);
        assert_eq!(outcome.pack_ids, vec!["a", "b"]);
    }

    #[test]
    fn test_submission_key_ignores_pack_order() {
        let a = OutcomeRecord::success(vec!["p1".into(), "p2".into()]);
        let b = OutcomeRecord::success(vec!["p2".into(), "p1".into()]);
        assert_eq!(a.submission_key(), b.submission_key());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_submission_key_distinguishes_result_and_task() {
        let ok = OutcomeRecord::success(vec!["p1".into()]);
        let ko = OutcomeRecord::failure(vec!["p1".into()], "tests failed");
        assert_ne!(ok.submission_key(), ko.submission_key());

        let task = OutcomeRecord::success(vec!["p1".into()]).with_task_id("task-7");
        assert_ne!(ok.submission_key(), task.submission_key());
    }

    #[test]
    fn test_submission_key_covers_files_modified() {
        let plain = OutcomeRecord::success(vec!["p1".into()]);
        let edited = OutcomeRecord::success(vec!["p1".into()])
            .with_files_modified(vec!["src/b.rs".into(), "src/a.rs".into()]);
        let same_files = OutcomeRecord::success(vec!["p1".into()])
            .with_files_modified(vec!["src/a.rs".into(), "src/b.rs".into()]);
        assert_ne!(plain.submission_key(), edited.submission_key());
        assert_eq!(edited.submission_key(), same_files.submission_key());
    }
}
