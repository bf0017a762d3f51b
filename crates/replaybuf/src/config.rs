// Runtime configuration for the replay server
//
// Sources, highest priority first:
// 1. CLI flags (applied in main.rs)
// 2. Explicit --config path
// 3. Default config file locations (./replaybuf.toml, ./.replaybuf.toml)
// 4. Built-in defaults

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub server: ServerConfig,

    /// Tables hosted by this server. At least one is required to serve.
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// One hosted priority table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    pub name: String,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(default = "default_min_size_to_sample")]
    pub min_size_to_sample: usize,
    #[serde(default = "default_flexible_batch_size")]
    pub default_flexible_batch_size: i32,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_size() -> usize {
    1_000_000
}

fn default_min_size_to_sample() -> usize {
    1
}

fn default_flexible_batch_size() -> i32 {
    64
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            tables: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Try the default config locations, falling back to built-in defaults.
    pub fn load_or_default() -> Result<Self> {
        for candidate in ["./replaybuf.toml", "./.replaybuf.toml"] {
            let path = Path::new(candidate);
            if path.exists() {
                return Self::load_from_path(path);
            }
        }
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        if self.tables.is_empty() {
            anyhow::bail!(
                "no tables configured. Add at least one [[tables]] entry \
                (e.g. name = \"default\") to the config file."
            );
        }
        for table in &self.tables {
            if table.name.is_empty() {
                anyhow::bail!("table name must not be empty");
            }
            if table.max_size == 0 {
                anyhow::bail!("table {} has max_size 0", table.name);
            }
            if table.default_flexible_batch_size <= 0 {
                anyhow::bail!(
                    "table {} has non-positive default_flexible_batch_size",
                    table.name
                );
            }
        }
        Ok(())
    }
}
