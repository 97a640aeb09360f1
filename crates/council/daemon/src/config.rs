//! Configuration for councild

use council_types::{CouncilPolicy, RegistryConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Budgets, timeouts and voting rules
    #[serde(default)]
    pub policy: CouncilPolicy,

    /// Role table
    #[serde(default = "RegistryConfig::standard")]
    pub roles: RegistryConfig,

    /// Audit trail and snapshot locations
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            policy: CouncilPolicy::default(),
            roles: RegistryConfig::standard(),
            persistence: PersistenceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Persistence configuration. Without paths everything stays in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// JSON-lines audit file
    #[serde(default)]
    pub audit_path: Option<PathBuf>,

    /// Directory of per-workflow snapshots
    #[serde(default)]
    pub snapshot_dir: Option<PathBuf>,

    /// Scheduler ticks between periodic snapshots
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_ticks: u64,

    /// Closed workflows kept in memory for status queries (0 keeps all)
    #[serde(default = "default_archive_limit")]
    pub archive_limit: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            audit_path: None,
            snapshot_dir: None,
            snapshot_interval_ticks: default_snapshot_interval(),
            archive_limit: default_archive_limit(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_snapshot_interval() -> u64 {
    20
}

fn default_archive_limit() -> usize {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DaemonConfig {
    /// Defaults, then the optional file, then `COUNCIL_*` environment
    /// variables (`__` separates nested keys, e.g.
    /// `COUNCIL_POLICY__SCHEDULER__MAX_CONCURRENCY=4`)
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        // Add default configuration
        builder = builder.add_source(config::Config::try_from(&DaemonConfig::default())?);

        // Add file configuration if provided
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("COUNCIL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}
