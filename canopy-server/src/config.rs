//! Server configuration file
//!
//! One TOML file holds the cluster settings plus the process-level sections
//! (logging, metrics, admin API and backend handlers). Missing sections fall
//! back to their defaults.

use anyhow::{Context, Result};
use canopy_cluster::ClusterConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub handlers: HandlersConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Filter directive, overridden by RUST_LOG
    #[serde(default = "default_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Prometheus scrape listener; no exporter when unset
    #[serde(default)]
    pub metrics_addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_enabled")]
    pub enabled: bool,
    #[serde(default = "default_admin_bind")]
    pub bind_addr: String,
}

fn default_admin_enabled() -> bool {
    true
}

fn default_admin_bind() -> String {
    "127.0.0.1:9480".to_string()
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: default_admin_enabled(),
            bind_addr: default_admin_bind(),
        }
    }
}

/// Backend handlers to register; each is enabled by setting its base URL
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HandlersConfig {
    /// Upstream for the `http` proxy handler
    #[serde(default)]
    pub http_upstream: Option<String>,
    /// API base URL for the `rest` handler
    #[serde(default)]
    pub rest_base_url: Option<String>,
    /// Bearer token sent by the `rest` handler
    #[serde(default)]
    pub rest_token: Option<String>,
    #[serde(default = "default_handler_timeout")]
    pub timeout_ms: u64,
}

fn default_handler_timeout() -> u64 {
    30_000
}

impl Default for HandlersConfig {
    fn default() -> Self {
        Self {
            http_upstream: None,
            rest_base_url: None,
            rest_token: None,
            timeout_ms: default_handler_timeout(),
        }
    }
}

impl HandlersConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Load config from file path, or create default
    pub fn load_or_create(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let content = fs::read_to_string(config_path)
                .with_context(|| format!("reading {}", config_path.display()))?;
            let config: Config =
                toml::from_str(&content).with_context(|| format!("parsing {}", config_path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            // Try to save default config
            if let Some(parent) = config_path.parent() {
                let _ = fs::create_dir_all(parent);
            }
            let _ = config.save(config_path);
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [cluster]
            name = "edge-1"
            parent_addr = "10.0.0.1:9443"

            [handlers]
            http_upstream = "http://localhost:8080"
            "#,
        )
        .unwrap();

        assert_eq!(config.cluster.name, "edge-1");
        assert!(!config.cluster.is_root());
        assert_eq!(config.cluster.namespace, "default");
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert!(config.admin.enabled);
        assert!(config.observability.metrics_addr.is_none());
        assert_eq!(config.handlers.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_load_or_create_writes_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("canopy.toml");

        let created = Config::load_or_create(&path).unwrap();
        assert!(path.exists());

        let loaded = Config::load_or_create(&path).unwrap();
        assert_eq!(loaded.cluster.name, created.cluster.name);
        assert_eq!(loaded.admin.bind_addr, "127.0.0.1:9480");
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("canopy.toml");
        fs::write(&path, "[cluster\nname = ").unwrap();
        assert!(Config::load_or_create(&path).is_err());
    }
}
