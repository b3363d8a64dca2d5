use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
    pub environment: Environment,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: String,
    /// Write-ahead log and snapshots on or off.
    pub persist: bool,
    /// Seconds between background snapshots that compact the WAL; 0 leaves
    /// compaction to shutdown.
    pub flush_interval_secs: u64,
}

impl StorageConfig {
    pub fn flush_interval(&self) -> Option<Duration> {
        (self.persist && self.flush_interval_secs > 0).then(|| Duration::from_secs(self.flush_interval_secs))
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            path: "./data".to_string(),
            persist: false,
            flush_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            host: "127.0.0.1".to_string(),
            port: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    /// Production never honours requests to suppress event publishing.
    pub fn allows_publish_suppression(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = fs::read_to_string(path)?;
    parse_config(&raw)
}

pub fn parse_config(raw: &str) -> Result<Config, ConfigError> {
    if raw.trim().is_empty() {
        return Ok(Config::default());
    }
    Ok(serde_yaml::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_fills_defaults() {
        let config = parse_config("api:\n  port: 8080\nenvironment: production\n").unwrap();
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.api.host, "127.0.0.1");
        assert_eq!(config.logging.level, "info");
        assert!(!config.storage.persist);
        assert_eq!(config.storage.flush_interval(), None);
        assert_eq!(config.environment, Environment::Production);
        assert!(!config.environment.allows_publish_suppression());
    }

    #[test]
    fn flush_interval_needs_persistence() {
        let config = parse_config("storage:\n  persist: true\n").unwrap();
        assert_eq!(config.storage.flush_interval(), Some(Duration::from_secs(300)));

        let config = parse_config("storage:\n  persist: true\n  flush_interval_secs: 0\n").unwrap();
        assert_eq!(config.storage.flush_interval(), None);
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.environment, Environment::Development);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(matches!(
            parse_config("storage: [not, a, map"),
            Err(ConfigError::Parse(_))
        ));
    }
}
