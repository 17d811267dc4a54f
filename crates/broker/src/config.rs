//! Configuration module for the call broker
//!
//! Supports YAML configuration files with module-based organization

use std::time::Duration;

use cluster::PoolConfig;
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Backing store configuration
    #[serde(default)]
    pub store: StoreConfig,
    /// Call polling configuration
    #[serde(default)]
    pub calls: CallsConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Load configuration from YAML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_yaml(&content)
    }

    /// Load configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let yaml =
            serde_yaml::to_string(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;
        std::fs::write(path, yaml).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.addrs.is_empty() {
            return Err(ConfigError::Invalid(
                "store.addrs must list at least one node".to_string(),
            ));
        }
        if self.store.mode == StoreMode::Standalone && self.store.addrs.len() > 1 {
            return Err(ConfigError::Invalid(
                "standalone mode takes exactly one address".to_string(),
            ));
        }
        if self.calls.uris.iter().any(|u| u.is_empty()) {
            return Err(ConfigError::Invalid("empty call URI".to_string()));
        }
        Ok(())
    }
}

/// Deployment shape of the backing store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    #[default]
    Standalone,
    Cluster,
}

/// Backing store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub mode: StoreMode,
    /// Node address (standalone) or startup node addresses (cluster)
    #[serde(default = "default_store_addrs")]
    pub addrs: Vec<String>,
    #[serde(default)]
    pub pool: PoolConfig,
    /// Refresh the slot mapping in the background on MOVED replies
    #[serde(default)]
    pub refresh_on_moved: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            mode: StoreMode::default(),
            addrs: default_store_addrs(),
            pool: PoolConfig::default(),
            refresh_on_moved: false,
        }
    }
}

/// Call polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallsConfig {
    /// Service URIs to poll
    #[serde(default)]
    pub uris: Vec<String>,
    /// BRPOP timeout in whole seconds
    #[serde(default = "default_pop_timeout_secs")]
    pub pop_timeout_secs: u64,
    /// Output stream capacity
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
    /// Bound on concurrently processed calls (0 = unbounded)
    #[serde(default)]
    pub max_in_flight: usize,
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self {
            uris: Vec::new(),
            pop_timeout_secs: default_pop_timeout_secs(),
            stream_buffer: default_stream_buffer(),
            max_in_flight: 0,
        }
    }
}

impl CallsConfig {
    /// Get pop timeout as Duration
    pub fn pop_timeout(&self) -> Duration {
        Duration::from_secs(self.pop_timeout_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LogConfig {
    pub fn level(&self) -> Level {
        match self.level.as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }

    /// Install a global fmt subscriber at the configured level
    pub fn init_tracing(&self) -> Result<(), ConfigError> {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(self.level())
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| ConfigError::Invalid(format!("tracing already initialised: {}", e)))
    }
}

// Default value functions

fn default_store_addrs() -> Vec<String> {
    vec!["127.0.0.1:6379".to_string()]
}

fn default_pop_timeout_secs() -> u64 {
    1
}

fn default_stream_buffer() -> usize {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Serialize error: {0}")]
    SerializeError(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.store.mode, StoreMode::Standalone);
        assert_eq!(config.store.addrs, vec!["127.0.0.1:6379".to_string()]);
        assert_eq!(config.calls.pop_timeout(), Duration::from_secs(1));
        assert_eq!(config.calls.stream_buffer, 1);
        assert_eq!(config.log.level(), Level::INFO);
    }

    #[test]
    fn test_from_yaml_cluster() {
        let yaml = r#"
store:
  mode: cluster
  addrs: ["10.0.0.1:7000", "10.0.0.2:7000"]
  refresh_on_moved: true
  pool:
    max_idle_per_node: 2
calls:
  uris: ["svc.echo"]
  pop_timeout_secs: 3
log:
  level: debug
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.store.mode, StoreMode::Cluster);
        assert_eq!(config.store.addrs.len(), 2);
        assert!(config.store.refresh_on_moved);
        assert_eq!(config.store.pool.max_idle_per_node, 2);
        assert_eq!(config.store.pool.connect_timeout_ms, 1000);
        assert_eq!(config.calls.uris, vec!["svc.echo".to_string()]);
        assert_eq!(config.calls.pop_timeout_secs, 3);
        assert_eq!(config.calls.stream_buffer, 1);
        assert_eq!(config.log.level(), Level::DEBUG);
    }

    #[test]
    fn test_standalone_with_many_addrs_rejected() {
        let yaml = "store:\n  addrs: [\"a:1\", \"b:1\"]\n";
        assert!(matches!(
            Config::from_yaml(yaml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_bad_yaml() {
        assert!(matches!(
            Config::from_yaml("store: [unclosed"),
            Err(ConfigError::ParseError(_))
        ));
    }
}
