//! Application configuration: optional JSON file, then command-line overrides.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use chainledger_core::ScannerConfig;
use chainledger_node::NodeConfig;

use crate::logging::LogConfig;

/// Database location understood by [`StorageConfig`] as "keep nothing".
pub const MEMORY_DATABASE: &str = ":memory:";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file path or URL, or `:memory:`.
    pub database: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: "./chainledger.db".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub node: NodeConfig,
    pub scanner: ScannerConfig,
    pub storage: StorageConfig,
    pub log: LogConfig,
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub rpc_url: Option<String>,
    pub database: Option<String>,
    pub confirmation_depth: Option<usize>,
    pub start_height: Option<u64>,
    pub log_level: Option<String>,
    pub log_json: bool,
}

impl AppConfig {
    /// Load `path` if given (defaults otherwise) and apply `overrides`.
    pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => AppConfig::default(),
        };
        config.apply(overrides);
        config
            .scanner
            .validate()
            .context("invalid scanner configuration")?;
        Ok(config)
    }

    fn apply(&mut self, o: &Overrides) {
        if let Some(url) = &o.rpc_url {
            self.node.rpc_url = url.clone();
        }
        if let Some(db) = &o.database {
            self.storage.database = db.clone();
        }
        if let Some(depth) = o.confirmation_depth {
            self.scanner.confirmation_depth = depth;
        }
        if let Some(height) = o.start_height {
            self.scanner.start_height = height;
        }
        if let Some(level) = &o.log_level {
            self.log.level = level.clone();
        }
        if o.log_json {
            self.log.json = true;
        }
    }
}
