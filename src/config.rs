//! Engine configuration
//!
//! Configuration can be built in code, loaded from JSON or YAML, and then
//! overlaid with environment variables:
//!
//! ```bash
//! export SYNEVAL_CACHE_TTL=60          # result cache TTL in seconds
//! export SYNEVAL_CACHE_MAX_ENTRIES=500 # result cache capacity
//! export SYNEVAL_AST_CACHE_SIZE=2000   # parse cache capacity
//! ```

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_AST_CACHE_SIZE: usize = 1000;
pub const DEFAULT_CACHE_TTL_SECONDS: u64 = 300;
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 1000;

/// Domains recognized in `domain.identifier` entity references
pub const DEFAULT_ENTITY_DOMAINS: &[&str] = &[
    "alarm_control_panel",
    "automation",
    "binary_sensor",
    "button",
    "climate",
    "counter",
    "cover",
    "device_tracker",
    "external",
    "fan",
    "humidifier",
    "input_boolean",
    "input_datetime",
    "input_number",
    "input_select",
    "input_text",
    "light",
    "lock",
    "media_player",
    "number",
    "person",
    "scene",
    "script",
    "select",
    "sensor",
    "sun",
    "switch",
    "timer",
    "vacuum",
    "water_heater",
    "weather",
    "zone",
];

/// Result cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_seconds: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: DEFAULT_CACHE_TTL_SECONDS,
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub ast_cache_size: usize,
    pub entity_domains: BTreeSet<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            ast_cache_size: DEFAULT_AST_CACHE_SIZE,
            entity_domains: DEFAULT_ENTITY_DOMAINS
                .iter()
                .map(|d| d.to_string())
                .collect(),
        }
    }
}

impl EngineConfig {
    /// Parse configuration from JSON
    pub fn from_json_str(input: &str) -> Result<Self, EngineError> {
        serde_json::from_str(input).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Parse configuration from YAML
    pub fn from_yaml_str(input: &str) -> Result<Self, EngineError> {
        serde_yaml::from_str(input).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Load configuration from a `.json`, `.yaml` or `.yml` file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&content),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            other => Err(EngineError::Config(format!(
                "unsupported configuration format: {}",
                other.unwrap_or("<none>")
            ))),
        }
    }

    /// Apply `SYNEVAL_*` environment variable overrides. Unparseable values
    /// are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(ttl) = env_parse::<u64>("SYNEVAL_CACHE_TTL") {
            self.cache.ttl_seconds = ttl;
        }
        if let Some(max) = env_parse::<usize>("SYNEVAL_CACHE_MAX_ENTRIES") {
            self.cache.max_entries = max;
        }
        if let Some(size) = env_parse::<usize>("SYNEVAL_AST_CACHE_SIZE") {
            self.ast_cache_size = size;
        }
        self
    }

    /// Builder-style helper for tests and embedding
    pub fn with_cache(mut self, ttl: Duration, max_entries: usize) -> Self {
        self.cache.ttl_seconds = ttl.as_secs();
        self.cache.max_entries = max_entries;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}
