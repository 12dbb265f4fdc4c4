//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::cache::CacheConfig;
use crate::confidence::ConfidenceConfig;
use crate::embedding::{EmbeddingConfig, RetryPolicy};
use crate::engines::{ConstraintConfig, MetaConfig, RelevanceConfig};
use crate::pipeline::{DepthProfile, PipelineConfig};
use crate::storage::DatabaseConfig;

/// Keel configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeelConfig {
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub relevance: RelevanceConfig,
    pub confidence: ConfidenceConfig,
    pub constraints: ConstraintConfig,
    pub meta: MetaConfig,
    pub embedding: EmbeddingConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file; the platform data directory when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: 5,
        }
    }
}

impl StoreConfig {
    pub fn database_config(&self) -> DatabaseConfig {
        let config = match &self.path {
            Some(path) => DatabaseConfig::with_path(path),
            None => DatabaseConfig::default(),
        };
        config.max_connections(self.max_connections)
    }
}

const KEYS: &[&str] = &[
    "store.path",
    "store.max_connections",
    "cache.hot_capacity",
    "cache.warm_capacity",
    "cache.cold_read_timeout_ms",
    "relevance.similarity_threshold",
    "relevance.recency_half_life_days",
    "relevance.weights.semantic",
    "relevance.weights.importance",
    "relevance.weights.confidence",
    "relevance.weights.centrality",
    "relevance.weights.recency",
    "confidence.half_life_days",
    "confidence.reliability_window",
    "confidence.trend_penalty",
    "confidence.cache_ttl_secs",
    "constraints.exception_days",
    "constraints.min_observations",
    "constraints.sweep_interval_secs",
    "meta.proceed_threshold",
    "meta.coverage_floor",
    "meta.suspicion_threshold",
    "embedding.batch_size",
    "embedding.concurrency",
    "embedding.max_retries",
    "embedding.base_delay_ms",
    "embedding.retry_policy",
    "pipeline.default_timeout_ms",
    "pipeline.engine_timeout_ms",
    "pipeline.max_tokens",
    "pipeline.max_depth",
    "pipeline.l0.max_files",
    "pipeline.l0.ttl_secs",
    "pipeline.l1.max_files",
    "pipeline.l1.ttl_secs",
    "pipeline.l2.max_files",
    "pipeline.l2.ttl_secs",
];

fn parse<T: FromStr>(key: &str, value: &str) -> anyhow::Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("Invalid {} value: {}", key, value))
}

/// A value in `[0, 1]`
fn parse_unit<T: FromStr + Into<f64> + Copy>(key: &str, value: &str) -> anyhow::Result<T> {
    let parsed: T = parse(key, value)?;
    let unit: f64 = parsed.into();
    if !(0.0..=1.0).contains(&unit) {
        return Err(anyhow!("{} must be between 0.0 and 1.0", key));
    }
    Ok(parsed)
}

/// A value strictly above zero
fn parse_positive<T: FromStr + PartialOrd + Default>(key: &str, value: &str) -> anyhow::Result<T> {
    let parsed: T = parse(key, value)?;
    if parsed <= T::default() {
        return Err(anyhow!("{} must be greater than zero", key));
    }
    Ok(parsed)
}

impl KeelConfig {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("KEEL_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("keel")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the config directory, defaults when absent
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: KeelConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the config directory
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate cross-field invariants
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.relevance.weights.total() <= 0.0 {
            return Err(anyhow!("At least one relevance weight must be positive"));
        }
        if self.embedding.batch_size == 0 || self.embedding.concurrency == 0 {
            return Err(anyhow!("embedding.batch_size and embedding.concurrency must be at least 1"));
        }
        if self.store.max_connections == 0 {
            return Err(anyhow!("store.max_connections must be at least 1"));
        }
        let p = &self.pipeline;
        if p.l0.max_files > p.l1.max_files || p.l1.max_files > p.l2.max_files {
            return Err(anyhow!(
                "Depth profiles must not shrink: l0.max_files <= l1.max_files <= l2.max_files"
            ));
        }
        if p.l0.ttl_secs == 0 || p.l1.ttl_secs == 0 || p.l2.ttl_secs == 0 {
            return Err(anyhow!("Cache TTLs must be greater than zero"));
        }
        Ok(())
    }

    fn profile(&self, depth: &str) -> Option<&DepthProfile> {
        match depth {
            "l0" => Some(&self.pipeline.l0),
            "l1" => Some(&self.pipeline.l1),
            "l2" => Some(&self.pipeline.l2),
            _ => None,
        }
    }

    fn profile_mut(&mut self, depth: &str) -> Option<&mut DepthProfile> {
        match depth {
            "l0" => Some(&mut self.pipeline.l0),
            "l1" => Some(&mut self.pipeline.l1),
            "l2" => Some(&mut self.pipeline.l2),
            _ => None,
        }
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        let w = &self.relevance.weights;
        let value = match key {
            // Store
            "store.path" => match &self.store.path {
                Some(path) => path.display().to_string(),
                None => format!("{} (default)", self.store.database_config().path.display()),
            },
            "store.max_connections" => self.store.max_connections.to_string(),

            // Cache
            "cache.hot_capacity" => self.cache.hot_capacity.to_string(),
            "cache.warm_capacity" => self.cache.warm_capacity.to_string(),
            "cache.cold_read_timeout_ms" => self.cache.cold_read_timeout_ms.to_string(),

            // Relevance
            "relevance.similarity_threshold" => self.relevance.similarity_threshold.to_string(),
            "relevance.recency_half_life_days" => self.relevance.recency_half_life_days.to_string(),
            "relevance.weights.semantic" => w.semantic.to_string(),
            "relevance.weights.importance" => w.importance.to_string(),
            "relevance.weights.confidence" => w.confidence.to_string(),
            "relevance.weights.centrality" => w.centrality.to_string(),
            "relevance.weights.recency" => w.recency.to_string(),

            // Confidence
            "confidence.half_life_days" => self.confidence.half_life_days.to_string(),
            "confidence.reliability_window" => self.confidence.reliability_window.to_string(),
            "confidence.trend_penalty" => self.confidence.trend_penalty.to_string(),
            "confidence.cache_ttl_secs" => self.confidence.cache_ttl_secs.to_string(),

            // Constraints
            "constraints.exception_days" => self.constraints.exception_days.to_string(),
            "constraints.min_observations" => self.constraints.min_observations.to_string(),
            "constraints.sweep_interval_secs" => self.constraints.sweep_interval_secs.to_string(),

            // Meta
            "meta.proceed_threshold" => self.meta.proceed_threshold.to_string(),
            "meta.coverage_floor" => self.meta.coverage_floor.to_string(),
            "meta.suspicion_threshold" => self.meta.suspicion_threshold.to_string(),

            // Embedding
            "embedding.batch_size" => self.embedding.batch_size.to_string(),
            "embedding.concurrency" => self.embedding.concurrency.to_string(),
            "embedding.max_retries" => self.embedding.max_retries.to_string(),
            "embedding.base_delay_ms" => self.embedding.base_delay_ms.to_string(),
            "embedding.retry_policy" => self.embedding.retry_policy.as_str().to_string(),

            // Pipeline
            "pipeline.default_timeout_ms" => self.pipeline.default_timeout_ms.to_string(),
            "pipeline.engine_timeout_ms" => self.pipeline.engine_timeout_ms.to_string(),
            "pipeline.max_tokens" => self.pipeline.max_tokens.to_string(),
            "pipeline.max_depth" => self.pipeline.max_depth.to_string(),
            _ => {
                let profile = key
                    .strip_prefix("pipeline.")
                    .and_then(|rest| rest.split_once('.'))
                    .and_then(|(depth, field)| self.profile(depth).map(|p| (p, field)));
                match profile {
                    Some((p, "max_files")) => p.max_files.to_string(),
                    Some((p, "ttl_secs")) => p.ttl_secs.to_string(),
                    _ => return Err(unknown_key(key)),
                }
            }
        };
        Ok(value)
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            // Store
            "store.path" => {
                let trimmed = value.trim();
                self.store.path = if trimmed.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(trimmed))
                };
            }
            "store.max_connections" => self.store.max_connections = parse_positive(key, value)?,

            // Cache
            "cache.hot_capacity" => self.cache.hot_capacity = parse_positive(key, value)?,
            "cache.warm_capacity" => self.cache.warm_capacity = parse_positive(key, value)?,
            "cache.cold_read_timeout_ms" => self.cache.cold_read_timeout_ms = parse_positive(key, value)?,

            // Relevance
            "relevance.similarity_threshold" => {
                self.relevance.similarity_threshold = parse_unit(key, value)?;
            }
            "relevance.recency_half_life_days" => {
                self.relevance.recency_half_life_days = parse_positive(key, value)?;
            }
            "relevance.weights.semantic" => self.relevance.weights.semantic = parse_unit(key, value)?,
            "relevance.weights.importance" => self.relevance.weights.importance = parse_unit(key, value)?,
            "relevance.weights.confidence" => self.relevance.weights.confidence = parse_unit(key, value)?,
            "relevance.weights.centrality" => self.relevance.weights.centrality = parse_unit(key, value)?,
            "relevance.weights.recency" => self.relevance.weights.recency = parse_unit(key, value)?,

            // Confidence
            "confidence.half_life_days" => self.confidence.half_life_days = parse_positive(key, value)?,
            "confidence.reliability_window" => {
                self.confidence.reliability_window = parse_positive(key, value)?;
            }
            "confidence.trend_penalty" => self.confidence.trend_penalty = parse_unit(key, value)?,
            "confidence.cache_ttl_secs" => self.confidence.cache_ttl_secs = parse(key, value)?,

            // Constraints
            "constraints.exception_days" => self.constraints.exception_days = parse_positive(key, value)?,
            "constraints.min_observations" => {
                self.constraints.min_observations = parse_positive(key, value)?;
            }
            "constraints.sweep_interval_secs" => {
                self.constraints.sweep_interval_secs = parse_positive(key, value)?;
            }

            // Meta
            "meta.proceed_threshold" => self.meta.proceed_threshold = parse_unit(key, value)?,
            "meta.coverage_floor" => self.meta.coverage_floor = parse_unit(key, value)?,
            "meta.suspicion_threshold" => self.meta.suspicion_threshold = parse_unit(key, value)?,

            // Embedding
            "embedding.batch_size" => self.embedding.batch_size = parse_positive(key, value)?,
            "embedding.concurrency" => self.embedding.concurrency = parse_positive(key, value)?,
            "embedding.max_retries" => self.embedding.max_retries = parse(key, value)?,
            "embedding.base_delay_ms" => self.embedding.base_delay_ms = parse(key, value)?,
            "embedding.retry_policy" => {
                self.embedding.retry_policy = RetryPolicy::parse(value.trim()).ok_or_else(|| {
                    anyhow!("Invalid retry policy: {}. Valid options: bounded, unbounded", value)
                })?;
            }

            // Pipeline
            "pipeline.default_timeout_ms" => {
                self.pipeline.default_timeout_ms = parse_positive(key, value)?;
            }
            "pipeline.engine_timeout_ms" => {
                self.pipeline.engine_timeout_ms = parse_positive(key, value)?;
            }
            "pipeline.max_tokens" => self.pipeline.max_tokens = parse_positive(key, value)?,
            "pipeline.max_depth" => self.pipeline.max_depth = parse(key, value)?,
            _ => {
                let (depth, field) = key
                    .strip_prefix("pipeline.")
                    .and_then(|rest| rest.split_once('.'))
                    .ok_or_else(|| unknown_key(key))?;
                let profile = self.profile_mut(depth).ok_or_else(|| unknown_key(key))?;
                match field {
                    "max_files" => profile.max_files = parse_positive(key, value)?,
                    "ttl_secs" => profile.ttl_secs = parse_positive(key, value)?,
                    _ => return Err(unknown_key(key)),
                }
            }
        }
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        KEYS.iter()
            .map(|key| Ok((key.to_string(), self.get(key)?)))
            .collect()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}

fn unknown_key(key: &str) -> anyhow::Error {
    anyhow!(
        "Unknown configuration key: {}. Use `keel config list` to see available keys.",
        key
    )
}
