//! Config module tests

use crate::config::{KeelConfig, StoreConfig};
use crate::embedding::RetryPolicy;

#[test]
fn test_config_default() {
    let config = KeelConfig::default();

    assert_eq!(config.confidence.half_life_days, 7.0);
    assert_eq!(config.meta.proceed_threshold, 0.4);
    assert_eq!(config.relevance.similarity_threshold, 0.35);
    assert_eq!(config.constraints.exception_days, 7);
    assert_eq!(config.constraints.min_observations, 3);
    assert_eq!(config.embedding.batch_size, 50);
    assert_eq!(config.embedding.concurrency, 3);
    assert_eq!(config.embedding.max_retries, 3);
    assert_eq!(config.embedding.base_delay_ms, 500);
    assert_eq!(config.embedding.retry_policy, RetryPolicy::Bounded);
    assert_eq!(config.pipeline.l0.ttl_secs, 60);
    assert_eq!(config.pipeline.l1.ttl_secs, 300);
    assert_eq!(config.pipeline.l2.ttl_secs, 900);
    assert!(config.validate().is_ok());
}

#[test]
fn test_save_and_load_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("keel").join("config.toml");

    let mut config = KeelConfig::default();
    config.set("meta.proceed_threshold", "0.6").unwrap();
    config.set("embedding.retry_policy", "unbounded").unwrap();
    config.set("pipeline.l1.max_files", "10").unwrap();
    config.set("store.path", "/tmp/keel/knowledge.db").unwrap();
    config.save_to(&path).unwrap();

    let loaded = KeelConfig::load_from(&path).unwrap();
    assert_eq!(loaded.meta.proceed_threshold, 0.6);
    assert_eq!(loaded.embedding.retry_policy, RetryPolicy::Unbounded);
    assert_eq!(loaded.pipeline.l1.max_files, 10);
    assert_eq!(loaded.get("store.path").unwrap(), "/tmp/keel/knowledge.db");
}

#[test]
fn test_missing_file_loads_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = KeelConfig::load_from(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.cache.hot_capacity, 64);
}

#[test]
fn test_partial_file_fills_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[confidence]\nhalf_life_days = 14.0\n").unwrap();

    let config = KeelConfig::load_from(&path).unwrap();
    assert_eq!(config.confidence.half_life_days, 14.0);
    assert_eq!(config.confidence.reliability_window, 10);
    assert_eq!(config.embedding.batch_size, 50);
}

#[test]
fn test_invalid_file_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[embedding]\nbatch_size = 0\n").unwrap();
    assert!(KeelConfig::load_from(&path).is_err());

    std::fs::write(&path, "not = [valid").unwrap();
    assert!(KeelConfig::load_from(&path).is_err());
}

#[test]
fn test_set_rejects_out_of_range() {
    let mut config = KeelConfig::default();
    assert!(config.set("meta.proceed_threshold", "1.5").is_err());
    assert!(config.set("relevance.similarity_threshold", "-0.1").is_err());
    assert!(config.set("embedding.batch_size", "0").is_err());
    assert!(config.set("embedding.retry_policy", "forever").is_err());
    assert!(config.set("confidence.half_life_days", "abc").is_err());
    assert_eq!(config.meta.proceed_threshold, 0.4);
}

#[test]
fn test_unknown_keys() {
    let mut config = KeelConfig::default();
    assert!(config.get("llm.model").is_err());
    assert!(config.get("pipeline.l3.max_files").is_err());
    assert!(config.set("pipeline.l1.colour", "red").is_err());
    assert!(config.set("nonsense", "1").is_err());
}

#[test]
fn test_list_covers_every_key() {
    let config = KeelConfig::default();
    let listed = config.list().unwrap();

    assert_eq!(listed.len(), 37);
    for (key, value) in &listed {
        assert_eq!(&config.get(key).unwrap(), value);
    }
    assert!(listed.iter().any(|(k, v)| k == "pipeline.l2.max_files" && v == "15"));
}

#[test]
fn test_validate_rejects_shrinking_profiles() {
    let mut config = KeelConfig::default();
    config.pipeline.l0.max_files = 20;
    assert!(config.validate().is_err());
}

#[test]
fn test_store_database_config() {
    let store = StoreConfig {
        path: Some("/data/knowledge.db".into()),
        max_connections: 2,
    };
    let db = store.database_config();
    assert_eq!(db.path.to_string_lossy(), "/data/knowledge.db");
    assert_eq!(db.max_connections, 2);
}
