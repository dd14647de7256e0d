use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::memory::{CacheSettings, MaintenanceConfig};

const DEFAULT_MAX_WEIGHT_KB: u64 = 4 * 1024 * 1024; // 4 GiB
const DEFAULT_EXPIRY_MINUTES: u64 = 180;

/// Top-level application configuration loaded from file + environment.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub node: NodeSection,
    pub cache: CacheSection,
    pub circuit_breaker: CircuitBreakerSection,
    pub training: TrainingSection,
    pub watcher: WatcherSection,
    pub model_store: ModelStoreSection,
    pub logging: LoggingSection,
}

impl AppConfig {
    /// Load configuration from `VECMEM_CONFIG` (default `vecmem.toml`) and the environment.
    pub fn load() -> Result<Self> {
        let config_path = env::var("VECMEM_CONFIG").unwrap_or_else(|_| "vecmem.toml".to_string());
        Self::load_from(Path::new(&config_path))
    }

    /// Load from `path` if it exists, overlaid by `VECMEM_*` variables.
    ///
    /// Nested keys use `__`, e.g. `VECMEM_CACHE__MAX_WEIGHT_KB=1048576`.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut builder = config::Config::builder();

        if path.exists() {
            builder = builder.add_source(config::File::from(PathBuf::from(path)));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("VECMEM")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder
            .build()
            .with_context(|| format!("failed to read configuration from {}", path.display()))?;
        let mut config: Self = settings.try_deserialize()?;

        if config.node.node_id.is_none() {
            if let Ok(node_id) = env::var("VECMEM_NODE_ID") {
                config.node.node_id = Some(node_id);
            }
        }

        if config.logging.level.trim().is_empty() {
            config.logging.level = "info".to_string();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.circuit_breaker.validate()?;
        self.training.validate()?;

        if self.watcher.poll_interval_ms == 0 {
            bail!("watcher.poll_interval_ms must be positive");
        }
        if self.model_store.root_path.trim().is_empty() {
            bail!("model_store.root_path must be specified");
        }
        Ok(())
    }

    /// Configured node id, else the host name
    pub fn resolve_node_id(&self) -> String {
        self.node
            .node_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .or_else(|| hostname::get().ok().and_then(|h| h.into_string().ok()))
            .unwrap_or_else(|| "vecmem-node".to_string())
    }

    pub fn maintenance_config(&self) -> MaintenanceConfig {
        MaintenanceConfig {
            cache_interval: Duration::from_secs(self.cache.maintenance_interval_secs),
            breaker_interval: Duration::from_secs(self.circuit_breaker.check_interval_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct NodeSection {
    pub node_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub weight_limit_enabled: bool,
    pub max_weight_kb: u64,
    pub expiry_enabled: bool,
    pub expiry_minutes: u64,
    pub maintenance_interval_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            weight_limit_enabled: true,
            max_weight_kb: DEFAULT_MAX_WEIGHT_KB,
            expiry_enabled: false,
            expiry_minutes: DEFAULT_EXPIRY_MINUTES,
            maintenance_interval_secs: 60,
        }
    }
}

impl CacheSection {
    fn validate(&self) -> Result<()> {
        if self.weight_limit_enabled && self.max_weight_kb == 0 {
            bail!("cache.max_weight_kb must be positive when the weight limit is enabled");
        }
        if self.expiry_enabled && self.expiry_minutes == 0 {
            bail!("cache.expiry_minutes must be positive when expiry is enabled");
        }
        if self.maintenance_interval_secs == 0 {
            bail!("cache.maintenance_interval_secs must be positive");
        }
        Ok(())
    }

    /// Runtime settings for the cache manager
    pub fn settings(&self) -> CacheSettings {
        CacheSettings {
            weight_limited: self.weight_limit_enabled,
            max_weight_kb: self.max_weight_kb,
            expiry: self
                .expiry_enabled
                .then(|| Duration::from_secs(self.expiry_minutes * 60)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSection {
    /// Cache fill percentage at or below which the capacity flag is cleared
    pub unset_percentage: f64,
    pub check_interval_secs: u64,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            unset_percentage: 75.0,
            check_interval_secs: 120,
        }
    }
}

impl CircuitBreakerSection {
    fn validate(&self) -> Result<()> {
        if !(self.unset_percentage > 0.0 && self.unset_percentage <= 100.0) {
            bail!(
                "circuit_breaker.unset_percentage must be in (0, 100], got {}",
                self.unset_percentage
            );
        }
        if self.check_interval_secs == 0 {
            bail!("circuit_breaker.check_interval_secs must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrainingSection {
    pub pool_size: usize,
    pub queue_depth: usize,
}

impl Default for TrainingSection {
    fn default() -> Self {
        Self {
            pool_size: 1,
            queue_depth: 1,
        }
    }
}

impl TrainingSection {
    fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            bail!("training.pool_size must be positive");
        }
        if self.queue_depth == 0 {
            bail!("training.queue_depth must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatcherSection {
    pub poll_interval_ms: u64,
}

impl Default for WatcherSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelStoreSection {
    pub root_path: String,
}

impl Default for ModelStoreSection {
    fn default() -> Self {
        Self {
            root_path: "./data/models".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}
