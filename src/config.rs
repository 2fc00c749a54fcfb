//! Configuration parsing for fleetd.toml files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::activator::ActivatorConfig;

/// Root configuration structure matching the fleetd.toml schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub activator: ActivatorSettings,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Address of the external entity store. Unset runs the in-process
    /// development store.
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivatorSettings {
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: i64,
    #[serde(default = "default_retire_interval_secs")]
    pub retire_interval_secs: u64,
    #[serde(default = "default_fixed_check_interval_secs")]
    pub fixed_check_interval_secs: u64,
    #[serde(default = "default_retire_write_timeout_secs")]
    pub retire_write_timeout_secs: u64,
}

fn default_max_pool_size() -> i64 {
    20
}

fn default_retire_interval_secs() -> u64 {
    20
}

fn default_fixed_check_interval_secs() -> u64 {
    30
}

fn default_retire_write_timeout_secs() -> u64 {
    5
}

impl Default for ActivatorSettings {
    fn default() -> Self {
        Self {
            max_pool_size: default_max_pool_size(),
            retire_interval_secs: default_retire_interval_secs(),
            fixed_check_interval_secs: default_fixed_check_interval_secs(),
            retire_write_timeout_secs: default_retire_write_timeout_secs(),
        }
    }
}

impl ActivatorSettings {
    pub fn to_activator_config(&self) -> ActivatorConfig {
        ActivatorConfig {
            max_pool_size: self.max_pool_size,
            retire_interval: Duration::from_secs(self.retire_interval_secs),
            fixed_check_interval: Duration::from_secs(self.fixed_check_interval_secs),
            retire_write_timeout: Duration::from_secs(self.retire_write_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Unix socket for the RPC surface. Unset uses the per-user default.
    pub socket_path: Option<PathBuf>,
}

impl Config {
    /// Load from an explicit path, else `fleetd.toml` in the working
    /// directory, else defaults.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let local = Path::new("fleetd.toml");
                if local.exists() {
                    Self::from_file(local)
                } else {
                    Ok(Config::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Config> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> Result<Config> {
        toml::from_str(contents).context("parsing config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let config = Config::from_str("").unwrap();
        assert_eq!(config.activator.max_pool_size, 20);
        assert_eq!(config.activator.retire_interval_secs, 20);
        assert_eq!(config.activator.fixed_check_interval_secs, 30);
        assert!(config.store.address.is_none());
        assert!(config.daemon.socket_path.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [store]
            address = "store.internal:9443"

            [activator]
            max_pool_size = 40
            retire_interval_secs = 10
            fixed_check_interval_secs = 15
            retire_write_timeout_secs = 3

            [daemon]
            socket_path = "/run/fleetd/daemon.sock"
        "#;
        let config = Config::from_str(toml).unwrap();
        assert_eq!(config.store.address.as_deref(), Some("store.internal:9443"));
        assert_eq!(config.activator.max_pool_size, 40);
        assert_eq!(
            config.daemon.socket_path,
            Some(PathBuf::from("/run/fleetd/daemon.sock"))
        );

        let activator = config.activator.to_activator_config();
        assert_eq!(activator.max_pool_size, 40);
        assert_eq!(activator.retire_interval, Duration::from_secs(10));
        assert_eq!(activator.retire_write_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let toml = r#"
            [activator]
            max_pool_size = 5
        "#;
        let config = Config::from_str(toml).unwrap();
        assert_eq!(config.activator.max_pool_size, 5);
        assert_eq!(config.activator.retire_interval_secs, 20);
    }
}
