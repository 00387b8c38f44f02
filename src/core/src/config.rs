use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, StrataError};
use crate::log::LogConfig;
use crate::volume::OwnershipPolicy;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory for layers, images and volumes
    pub state_dir: PathBuf,

    /// Layer cache settings
    pub cache: CacheConfig,

    /// Build execution settings
    pub build: BuildSettings,

    /// Volume settings
    pub volumes: VolumeSettings,

    /// Logging
    pub log: LogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: dirs::home_dir()
                .map(|home| home.join(".strata"))
                .unwrap_or_else(|| PathBuf::from(".strata")),
            cache: CacheConfig::default(),
            build: BuildSettings::default(),
            volumes: VolumeSettings::default(),
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file. Missing keys take defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StrataError::ConfigError(format!(
                "failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: EngineConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `STRATA_*` environment variables.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = lookup("STRATA_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(capacity) = lookup("STRATA_CACHE_CAPACITY") {
            self.cache.capacity = capacity.parse().map_err(|_| {
                StrataError::ConfigError(format!("STRATA_CACHE_CAPACITY: invalid number '{}'", capacity))
            })?;
        }
        if let Some(timeout) = lookup("STRATA_RUN_TIMEOUT") {
            self.build.run_timeout_secs = timeout.parse().map_err(|_| {
                StrataError::ConfigError(format!("STRATA_RUN_TIMEOUT: invalid number '{}'", timeout))
            })?;
        }
        if let Some(format) = lookup("STRATA_LOG_FORMAT") {
            self.log.format = format.parse().map_err(StrataError::ConfigError)?;
        }
        self.validate()
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.cache.capacity == 0 {
            return Err(StrataError::ConfigError(
                "cache.capacity must be at least 1".to_string(),
            ));
        }
        if self.build.max_parallel_builds == 0 {
            return Err(StrataError::ConfigError(
                "build.max_parallel_builds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory holding content-addressed layer records.
    pub fn layers_dir(&self) -> PathBuf {
        self.state_dir.join("layers")
    }

    /// Directory holding image records and the tag index.
    pub fn images_dir(&self) -> PathBuf {
        self.state_dir.join("images")
    }

    /// Path of the volume registry file.
    pub fn volumes_file(&self) -> PathBuf {
        self.state_dir.join("volumes.json")
    }

    /// Directory holding volume data.
    pub fn volumes_dir(&self) -> PathBuf {
        self.state_dir.join("volumes")
    }
}

/// Layer cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of layers kept in memory before LRU eviction
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 4096 }
    }
}

/// Build execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    /// Deadline for a single RUN in seconds (0 = unlimited)
    pub run_timeout_secs: u64,

    /// Maximum number of builds running at once
    pub max_parallel_builds: usize,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            run_timeout_secs: 0,
            max_parallel_builds: 4,
        }
    }
}

impl BuildSettings {
    pub fn run_timeout(&self) -> Option<Duration> {
        match self.run_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Volume settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeSettings {
    /// Ownership reconciliation on attach
    pub ownership: OwnershipPolicy,
}
