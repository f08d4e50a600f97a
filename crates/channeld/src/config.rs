//! Configuration management for the channel daemon.
//!
//! One TOML file holds every section; a missing file is replaced by the
//! defaults, written back so operators have something to edit.

use anyhow::{Context, Result};
use channel_server::ServerConfig;
use channel_system::workers::ChatSettings;
use channel_system::{MasterSettings, WorkerSettings};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Host process: identity, master candidacy, heartbeat and load reports
    pub server: ServerConfig,
    /// Worker runtime: tick, ordering thresholds, commits, idle grace
    pub worker: WorkerSettings,
    /// Placement, load bias and readiness
    pub master: MasterSettings,
    /// Chat limits of the built-in `room` type
    pub chat: ChatSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file, creating a default one when the
    /// file does not exist.
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        self.server.validate()?;
        self.worker.validate()?;
        self.master.validate()?;

        if self.chat.history_size == 0 {
            return Err("chat.history_size must be greater than 0".to_string());
        }
        if self.chat.max_length == 0 {
            return Err("chat.max_length must be greater than 0".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }
}
