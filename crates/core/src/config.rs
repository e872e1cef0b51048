use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// Maximum number of url patterns held in the in-memory tier.
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,
    /// Maximum number of source pages tracked by the in-memory navigation model.
    #[serde(default = "default_navigation_capacity")]
    pub navigation_capacity: usize,
    #[serde(default = "default_max_alternatives")]
    pub max_alternatives: usize,
    /// Minimum predicted probability for a destination to be prefetched.
    #[serde(default = "default_prefetch_confidence_threshold")]
    pub prefetch_confidence_threshold: f64,
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: i64,
    #[serde(default = "default_query_limit")]
    pub query_limit: usize,
    #[serde(default)]
    pub min_confidence: f64,
    #[serde(default = "default_write_queue_size")]
    pub write_queue_size: usize,
    /// When false the cache never opens the durable store.
    #[serde(default = "default_persistent")]
    pub persistent: bool,
}

fn default_memory_capacity() -> usize {
    1000
}

fn default_navigation_capacity() -> usize {
    1000
}

fn default_max_alternatives() -> usize {
    5
}

fn default_prefetch_confidence_threshold() -> f64 {
    0.3
}

fn default_ttl_ms() -> i64 {
    7 * 24 * 60 * 60 * 1000
}

fn default_query_limit() -> usize {
    100
}

fn default_write_queue_size() -> usize {
    1024
}

fn default_persistent() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity: default_memory_capacity(),
            navigation_capacity: default_navigation_capacity(),
            max_alternatives: default_max_alternatives(),
            prefetch_confidence_threshold: default_prefetch_confidence_threshold(),
            default_ttl_ms: default_ttl_ms(),
            query_limit: default_query_limit(),
            min_confidence: 0.0,
            write_queue_size: default_write_queue_size(),
            persistent: default_persistent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let cache = &self.cache;
        if cache.memory_capacity == 0 {
            return Err(Error::Config("cache.memoryCapacity must be at least 1".to_string()));
        }
        if cache.navigation_capacity == 0 {
            return Err(Error::Config("cache.navigationCapacity must be at least 1".to_string()));
        }
        if cache.max_alternatives == 0 {
            return Err(Error::Config("cache.maxAlternatives must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&cache.prefetch_confidence_threshold) {
            return Err(Error::Config(format!(
                "cache.prefetchConfidenceThreshold must be within [0, 1], got {}",
                cache.prefetch_confidence_threshold
            )));
        }
        if !(0.0..=1.0).contains(&cache.min_confidence) {
            return Err(Error::Config(format!(
                "cache.minConfidence must be within [0, 1], got {}",
                cache.min_confidence
            )));
        }
        if cache.default_ttl_ms <= 0 {
            return Err(Error::Config("cache.defaultTtlMs must be positive".to_string()));
        }
        if cache.write_queue_size == 0 {
            return Err(Error::Config("cache.writeQueueSize must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_config_uses_defaults() {
        let raw = r#"{ "cache": { "memoryCapacity": 16 } }"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.cache.memory_capacity, 16);
        assert_eq!(cfg.cache.max_alternatives, 5);
        assert_eq!(cfg.cache.query_limit, 100);
        assert_eq!(cfg.cache.navigation_capacity, 1000);
        assert!(cfg.cache.persistent);
        assert!(!cfg.telemetry.enabled);
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut cfg = Config::default();
        cfg.cache.prefetch_confidence_threshold = 1.5;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        cfg.cache.prefetch_confidence_threshold = 0.5;
        cfg.cache.memory_capacity = 0;
        assert!(cfg.validate().is_err());

        cfg.cache.memory_capacity = 10;
        cfg.cache.navigation_capacity = 0;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let mut cfg = Config::default();
        cfg.telemetry.enabled = true;
        cfg.cache.default_ttl_ms = 60_000;
        cfg.save(&paths.config_file()).unwrap();

        let loaded = Config::load_or_default(&paths).unwrap();
        assert!(loaded.telemetry.enabled);
        assert_eq!(loaded.cache.default_ttl_ms, 60_000);
    }
}
