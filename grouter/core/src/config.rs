//! Router Configuration
//!
//! Settings are resolved with the following priority (highest first):
//! 1. CLI flags ([`ConfigOverrides`])
//! 2. TOML configuration file
//! 3. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! source = "memcached-ascii::11300"
//! source_max_conns = 3
//! target = "memory"
//! target_queue_capacity = 5
//! target_workers = 1
//!
//! [workload]
//! ops_per_round = 100
//! report_every = 1000
//! bucket = "default"
//! key = "hello"
//!
//! [stats]
//! report_interval_ms = 1000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Structures
// =============================================================================

/// Default source specification: ascii memcached on every interface
pub const DEFAULT_SOURCE: &str = "memcached-ascii::11300";
/// Default target specification
pub const DEFAULT_TARGET: &str = "memory";

/// Top-level router settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Source specification, `KIND[:PARAMS]`
    pub source: String,
    /// Maximum simultaneously active source connections
    pub source_max_conns: usize,
    /// Target specification, `KIND[:PARAMS]`
    pub target: String,
    /// Routing queue capacity in batches
    pub target_queue_capacity: usize,
    /// Number of target tasks draining the queue
    pub target_workers: usize,
    /// Synthetic workload tuning
    pub workload: WorkloadConfig,
    /// Statistics reporting
    pub stats: StatsConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            source: DEFAULT_SOURCE.to_owned(),
            source_max_conns: 3,
            target: DEFAULT_TARGET.to_owned(),
            target_queue_capacity: 5,
            target_workers: 1,
            workload: WorkloadConfig::default(),
            stats: StatsConfig::default(),
        }
    }
}

/// `[workload]` section
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Worker count; `None` means one per `source_max_conns`
    pub workers: Option<usize>,
    /// Requests per submitted batch
    pub ops_per_round: usize,
    /// Report to the stats sink after this many operations
    pub report_every: u64,
    /// Bucket every request targets
    pub bucket: String,
    /// Key every GET asks for
    pub key: String,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            workers: None,
            ops_per_round: 100,
            report_every: 1000,
            bucket: "default".to_owned(),
            key: "hello".to_owned(),
        }
    }
}

/// `[stats]` section
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// How often the collector logs its totals
    pub report_interval_ms: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            report_interval_ms: 1000,
        }
    }
}

impl StatsConfig {
    /// Report interval as a [`Duration`]
    #[must_use]
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }
}

/// Values supplied on the command line; `None` keeps the file/default value
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    /// `--source`
    pub source: Option<String>,
    /// `--source-max-conns`
    pub source_max_conns: Option<usize>,
    /// `--target`
    pub target: Option<String>,
    /// `--target-chan-size`
    pub target_queue_capacity: Option<usize>,
    /// `--target-workers`
    pub target_workers: Option<usize>,
}

impl RouterConfig {
    /// Apply command-line overrides
    pub fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(source) = overrides.source {
            self.source = source;
        }
        if let Some(n) = overrides.source_max_conns {
            self.source_max_conns = n;
        }
        if let Some(target) = overrides.target {
            self.target = target;
        }
        if let Some(n) = overrides.target_queue_capacity {
            self.target_queue_capacity = n;
        }
        if let Some(n) = overrides.target_workers {
            self.target_workers = n;
        }
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// [`ConfigError::ValidationError`] naming the first bad setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("source_max_conns", self.source_max_conns as u64),
            ("target_queue_capacity", self.target_queue_capacity as u64),
            ("target_workers", self.target_workers as u64),
            ("workload.ops_per_round", self.workload.ops_per_round as u64),
            ("workload.report_every", self.workload.report_every),
            ("stats.report_interval_ms", self.stats.report_interval_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be at least 1"
                )));
            }
        }
        if self.workload.workers == Some(0) {
            return Err(ConfigError::ValidationError(
                "workload.workers must be at least 1".into(),
            ));
        }
        if self.source.is_empty() {
            return Err(ConfigError::ValidationError("source must not be empty".into()));
        }
        if self.target.is_empty() {
            return Err(ConfigError::ValidationError("target must not be empty".into()));
        }
        Ok(())
    }

    /// Number of workload workers to run
    #[must_use]
    pub fn workload_workers(&self) -> usize {
        self.workload.workers.unwrap_or(self.source_max_conns)
    }
}

// =============================================================================
// Loading
// =============================================================================

/// Parse a configuration file, or return defaults when `path` is `None`
///
/// # Errors
///
/// [`ConfigError::ReadError`] or [`ConfigError::ParseError`].
pub fn load_config_from_path(path: Option<&Path>) -> Result<RouterConfig, ConfigError> {
    let Some(path) = path else {
        return Ok(RouterConfig::default());
    };

    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&text)?)
}

/// Load the file (if any), apply overrides, and validate
///
/// # Errors
///
/// Any [`ConfigError`].
pub fn load_config(
    path: Option<&Path>,
    overrides: ConfigOverrides,
) -> Result<RouterConfig, ConfigError> {
    let mut config = load_config_from_path(path)?;
    config.apply(overrides);
    config.validate()?;
    Ok(config)
}
