//! Keel Core Integration Tests

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use keel_core::{
    Error,
    attribution::{self, ochiai},
    backbone::Backbone,
    cache::{CacheConfig, QueryCache, TieredCache},
    confidence::{ConfidenceRecord, geometric_mean},
    config::KeelConfig,
    domain::knowledge::{CacheEntry, CodeEntity, ContextPack, Embedding, OutcomeRecord, Relationship},
    engines::{Budget, QueryDepth},
    graph::detect_cycles,
    pipeline::QueryRequest,
};

async fn backbone() -> Backbone {
    Backbone::in_memory(&KeelConfig::default(), None)
        .await
        .expect("in-memory backbone")
}

async fn module(backbone: &Backbone, path: &str) {
    backbone
        .store()
        .upsert_entity(&CodeEntity::module(path).with_content(path))
        .await
        .unwrap();
}

#[test]
fn test_overall_is_geometric_mean() {
    for (f, c, r) in [(0.9, 0.5, 0.7), (1.0, 1.0, 1.0), (0.2, 0.8, 0.4)] {
        let record = ConfidenceRecord::from_scores("e", f, c, r);
        assert!((record.overall - geometric_mean(f, c, r)).abs() < 1e-12);
        assert!((record.overall - (f * c * r).powf(1.0 / 3.0)).abs() < 1e-12);
    }
    assert_eq!(ConfidenceRecord::from_scores("e", 0.0, 0.9, 0.9).overall, 0.0);
    assert_eq!(ConfidenceRecord::from_scores("e", 0.9, 0.9, 0.0).overall, 0.0);
}

#[tokio::test]
async fn test_expired_cache_entry_never_served() {
    let backbone = backbone().await;
    let cache = TieredCache::new(backbone.store().clone(), &CacheConfig::default());

    let live = CacheEntry::new("live", json!({}), json!({"v": 1}), Duration::from_secs(60));
    let expired = CacheEntry::new("expired", json!({}), json!({"v": 2}), Duration::from_secs(60))
        .expiring_at(Utc::now() - chrono::Duration::milliseconds(1));
    cache.set(live).await.unwrap();
    cache.set(expired).await.unwrap();

    assert!(cache.get("live").await.is_some());
    assert!(cache.get("expired").await.is_none());
    // Not resurrected from the durable tier either
    assert!(backbone.store().get_cached("expired").await.unwrap().is_none());
}

#[tokio::test]
async fn test_reliability_follows_outcomes() {
    let backbone = backbone().await;
    for path in ["src/good.rs", "src/bad.rs"] {
        module(&backbone, path).await;
        backbone.store().save_pack(&ContextPack::new(path)).await.unwrap();
    }
    let confidence = backbone.confidence();
    let pipeline = backbone.pipeline();

    let good_before = confidence.qualify("src/good.rs").await.unwrap().reliability;
    pipeline
        .record_outcome(&OutcomeRecord::success(vec![ContextPack::id_for("src/good.rs")]))
        .await
        .unwrap();
    let good_after = confidence.qualify("src/good.rs").await.unwrap().reliability;
    assert!(good_after > good_before);

    let bad_before = confidence.qualify("src/bad.rs").await.unwrap().reliability;
    pipeline
        .record_outcome(&OutcomeRecord::failure(
            vec![ContextPack::id_for("src/bad.rs")],
            "wrong signature",
        ))
        .await
        .unwrap();
    let bad_after = confidence.qualify("src/bad.rs").await.unwrap().reliability;
    assert!(bad_after <= bad_before);
}

#[tokio::test]
async fn test_duplicate_outcome_not_double_counted() {
    let backbone = backbone().await;
    module(&backbone, "src/a.rs").await;
    let pack_id = ContextPack::id_for("src/a.rs");
    backbone.store().save_pack(&ContextPack::new("src/a.rs")).await.unwrap();

    let first = backbone
        .pipeline()
        .record_outcome(&OutcomeRecord::success(vec![pack_id.clone()]))
        .await
        .unwrap();
    let second = backbone
        .pipeline()
        .record_outcome(&OutcomeRecord::success(vec![pack_id.clone()]))
        .await
        .unwrap();

    assert!(first.recorded);
    assert!(!second.recorded);
    let pack = backbone.store().get_pack(&pack_id).await.unwrap().unwrap();
    assert_eq!(pack.success_count, 1);
    assert_eq!(pack.failure_count, 0);
}

#[tokio::test]
async fn test_cycle_detection() {
    let backbone = backbone().await;
    for id in ["A", "B", "C"] {
        module(&backbone, id).await;
    }
    for (from, to) in [("A", "B"), ("B", "C")] {
        backbone
            .store()
            .upsert_relationship(&Relationship::imports(from, to))
            .await
            .unwrap();
    }

    let graph = backbone.analytics().snapshot().await.unwrap();
    assert!(detect_cycles(&graph).is_empty());

    backbone
        .store()
        .upsert_relationship(&Relationship::imports("C", "A"))
        .await
        .unwrap();
    let graph = backbone.analytics().snapshot().await.unwrap();
    let cycles = backbone.analytics().cycles(&graph);
    assert_eq!(cycles.len(), 1);
    assert_eq!(cycles[0].members, vec!["A", "B", "C"]);
}

#[tokio::test]
async fn test_similarity_threshold() {
    let backbone = backbone().await;
    module(&backbone, "src/far.rs").await;
    module(&backbone, "src/near.rs").await;
    let store = backbone.store();
    store
        .save_embedding("src/far.rs", &Embedding::new("test-model", vec![0.30, 0.953_939_2]))
        .await
        .unwrap();
    store
        .save_embedding("src/near.rs", &Embedding::new("test-model", vec![0.50, 0.866_025_4]))
        .await
        .unwrap();

    let query = Embedding::new("test-model", vec![1.0, 0.0]);
    let result = backbone
        .relevance()
        .find_examples_by_embedding(&query)
        .await
        .unwrap();

    let ids: Vec<&str> = result.matches.iter().map(|m| m.entity_id.as_str()).collect();
    assert_eq!(ids, vec!["src/near.rs"]);
}

#[tokio::test]
async fn test_blast_radius_end_to_end() {
    let backbone = backbone().await;
    module(&backbone, "moduleA").await;
    module(&backbone, "moduleB").await;
    backbone
        .store()
        .upsert_relationship(&Relationship::imports("moduleA", "moduleB"))
        .await
        .unwrap();

    let radius = backbone
        .relevance()
        .get_blast_radius(&["moduleB".to_string()], 1)
        .await
        .unwrap();

    let affected: Vec<&str> = radius.affected.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(affected, vec!["moduleA"]);
    assert!((radius.percentage - 50.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_max_files_budget_across_tiers() {
    let backbone = backbone().await;
    for i in 0..12 {
        module(&backbone, &format!("src/parser_{i}.rs")).await;
    }

    let request = QueryRequest::new("parser", QueryDepth::L0)
        .with_budget(Budget::default().with_max_files(2));
    let response = backbone.pipeline().query(&request).await.unwrap();
    assert_eq!(response.pack_count(), 2);
    assert!(response.truncated);

    // Without an explicit budget the depth profile still caps the answer
    let response = backbone
        .pipeline()
        .query(&QueryRequest::new("parser", QueryDepth::L0))
        .await
        .unwrap();
    assert_eq!(response.pack_count(), 3);
}

#[tokio::test]
async fn test_embedding_required_above_l0() {
    let backbone = backbone().await;
    module(&backbone, "src/parser.rs").await;

    let err = backbone
        .pipeline()
        .query(&QueryRequest::new("parser", QueryDepth::L2))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EmbeddingUnavailable(_)));

    let response = backbone
        .pipeline()
        .query(&QueryRequest::new("parser", QueryDepth::L0))
        .await
        .unwrap();
    assert_eq!(response.pack_count(), 1);
}

#[test]
fn test_ochiai_ranks_more_failing_pack_higher() {
    let mut history = Vec::new();
    for i in 0..10 {
        let success = i >= 3;
        history.push(OutcomeRecord::new(vec!["pack-p".to_string()], success).with_task_id(format!("p{i}")));
    }
    for i in 0..10 {
        let success = i >= 1;
        history.push(OutcomeRecord::new(vec!["pack-q".to_string()], success).with_task_id(format!("q{i}")));
    }

    let (spectra, total_failed) = attribution::spectra(&history);
    let p = &spectra["pack-p"];
    let q = &spectra["pack-q"];
    assert_eq!((p.failed, p.passed), (3, 7));
    assert_eq!((q.failed, q.passed), (1, 9));
    assert!(ochiai(p.failed, p.passed, total_failed) > ochiai(q.failed, q.passed, total_failed));

    let failing = history[0].clone();
    let attribution = attribution::attribute(&failing, &history, 0.3);
    assert_eq!(attribution.suspects[0].pack_id, "pack-p");
}

#[tokio::test]
async fn test_event_channel_invalidates_cached_answers() {
    let backbone = backbone().await;
    module(&backbone, "src/parser.rs").await;
    let pipeline = Arc::clone(backbone.pipeline());

    let request = QueryRequest::new("parser", QueryDepth::L0);
    pipeline.query(&request).await.unwrap();
    assert!(pipeline.query(&request).await.unwrap().cached);

    let (tx, rx) = tokio::sync::mpsc::channel(4);
    let (shutdown, handles) = backbone.start(rx);
    tx.send(keel_core::domain::knowledge::KnowledgeEvent::file_changed("src/parser.rs"))
        .await
        .unwrap();
    tx.send(keel_core::domain::knowledge::KnowledgeEvent::shutdown())
        .await
        .unwrap();
    shutdown.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(!pipeline.query(&request).await.unwrap().cached);
}
