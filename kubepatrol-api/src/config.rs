//! Configuration management for KubePatrol
//!
//! Settings are resolved in three layers:
//! 1. Environment variables (highest priority)
//! 2. Configuration file (TOML format)
//! 3. Default values (lowest priority)

use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct KubePatrolConfig {
    pub cluster: ClusterSettings,
    pub database: DatabaseConfig,
    pub inspection: InspectionSettings,
    pub webhook: WebhookSettings,
    pub logging: LoggingConfig,
}

/// Cluster discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// Kubeconfig path; every file in its directory is scanned
    pub kubeconfig: String,
    /// Register the cluster this process runs in
    pub in_cluster: bool,
    /// Seconds between registry rescans, 0 disables periodic rescans
    pub rescan_interval_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database URL (e.g., "sqlite:///var/lib/kubepatrol/kubepatrol.db")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
}

/// Inspection engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectionSettings {
    /// Rows per insert statement when persisting events and script results
    pub batch_size: usize,
    /// Upper bound on a single script execution
    pub script_timeout_secs: u64,
    /// Scheduler dispatch tick
    pub scheduler_tick_ms: u64,
}

/// Outbound webhook settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookSettings {
    pub timeout_seconds: u64,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            kubeconfig: "~/.kube/config".to_string(),
            in_cluster: false,
            rescan_interval_secs: 0,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:///var/lib/kubepatrol/kubepatrol.db".to_string(),
            max_connections: 10,
        }
    }
}

impl Default for InspectionSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            script_timeout_secs: 300,
            scheduler_tick_ms: 1000,
        }
    }
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self { timeout_seconds: 30 }
    }
}

impl ClusterSettings {
    /// Kubeconfig path with `~` and environment variables expanded
    pub fn kubeconfig_path(&self) -> PathBuf {
        match shellexpand::full(&self.kubeconfig) {
            Ok(expanded) => PathBuf::from(expanded.as_ref()),
            Err(e) => {
                tracing::warn!("Failed to expand kubeconfig path {}: {}", self.kubeconfig, e);
                PathBuf::from(shellexpand::tilde(&self.kubeconfig).as_ref())
            }
        }
    }
}

impl KubePatrolConfig {
    /// Load configuration from environment variables and optional config file
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(config_path) = Self::find_config_file() {
            match Self::load_from_file(&config_path) {
                Ok(file_config) => config = file_config,
                Err(e) => tracing::warn!("Ignoring config file: {}", e),
            }
        }

        config.apply_env_overrides();

        config
    }

    /// Load configuration from a specific file path
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e.to_string()))?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let paths = [
            std::env::var("KUBEPATROL_CONFIG").ok().map(PathBuf::from),
            Some(PathBuf::from("/etc/kubepatrol/config.toml")),
            Some(PathBuf::from("./kubepatrol.toml")),
        ];

        paths.into_iter().flatten().find(|p| p.exists())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // Cluster
        if let Some(path) = lookup("KUBEPATROL_KUBECONFIG") {
            self.cluster.kubeconfig = path;
        }
        if let Some(flag) = lookup("KUBEPATROL_IN_CLUSTER") {
            self.cluster.in_cluster = flag.parse().unwrap_or(self.cluster.in_cluster);
        }
        if let Some(secs) = lookup("KUBEPATROL_RESCAN_INTERVAL") {
            if let Ok(secs) = secs.parse() {
                self.cluster.rescan_interval_secs = secs;
            }
        }

        // Database
        if let Some(url) = lookup("KUBEPATROL_DATABASE_URL") {
            self.database.url = url;
        }
        if let Some(max) = lookup("KUBEPATROL_DATABASE_MAX_CONNECTIONS") {
            if let Ok(max) = max.parse() {
                self.database.max_connections = max;
            }
        }

        // Inspection
        if let Some(secs) = lookup("KUBEPATROL_SCRIPT_TIMEOUT") {
            if let Ok(secs) = secs.parse() {
                self.inspection.script_timeout_secs = secs;
            }
        }

        // Logging
        if let Some(level) = lookup("KUBEPATROL_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(path) = lookup("KUBEPATROL_LOG_DIR") {
            self.logging.file_path = Some(path);
        }
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.kubeconfig.trim().is_empty() && !self.cluster.in_cluster {
            return Err(ConfigError::Validation(
                "Either a kubeconfig path or in_cluster must be set".to_string(),
            ));
        }

        if self.database.url.is_empty() {
            return Err(ConfigError::Validation("Database URL cannot be empty".to_string()));
        }

        if self.inspection.batch_size == 0 {
            return Err(ConfigError::Validation("Batch size must be at least 1".to_string()));
        }

        if self.inspection.scheduler_tick_ms == 0 {
            return Err(ConfigError::Validation(
                "Scheduler tick must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0:?}: {1}")]
    FileRead(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Config validation failed: {0}")]
    Validation(String),
}
