//! Genflight configuration management
//! Handles loading and saving the YAML config file

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::session::CoordinatorConfig;

/// Genflight configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP listener
    #[serde(default)]
    pub server: ServerConfig,

    /// Preemption and stream tuning
    #[serde(default)]
    pub coordinator: CoordinatorSettings,

    /// Credit ledger backend
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Generation engine backend
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9191
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr())
    }
}

/// Coordinator settings as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSettings {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,
    #[serde(default = "default_generation_cost")]
    pub generation_cost: u64,
    /// 0 disables the watchdog
    #[serde(default = "default_keepalive_timeout_ms")]
    pub keepalive_timeout_ms: u64,
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_stop_timeout_ms() -> u64 {
    5000
}

fn default_start_timeout_ms() -> u64 {
    30_000
}

fn default_generation_cost() -> u64 {
    1
}

fn default_keepalive_timeout_ms() -> u64 {
    300_000
}

fn default_stream_buffer() -> usize {
    64
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            start_timeout_ms: default_start_timeout_ms(),
            generation_cost: default_generation_cost(),
            keepalive_timeout_ms: default_keepalive_timeout_ms(),
            stream_buffer: default_stream_buffer(),
        }
    }
}

impl CoordinatorSettings {
    pub fn to_coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            stop_timeout: Duration::from_millis(self.stop_timeout_ms),
            start_timeout: Duration::from_millis(self.start_timeout_ms),
            generation_cost: self.generation_cost,
            keepalive_timeout: match self.keepalive_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            stream_buffer: self.stream_buffer.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    Memory,
    #[default]
    Sqlite,
}

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub kind: LedgerKind,
    #[serde(default = "default_db_path")]
    pub database_path: String,
    /// Balance given to owners seen for the first time
    #[serde(default)]
    pub initial_balance: u64,
}

fn default_db_path() -> String {
    "~/.genflight/ledger.db".to_string()
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            kind: LedgerKind::default(),
            database_path: default_db_path(),
            initial_balance: 0,
        }
    }
}

impl LedgerConfig {
    /// Resolve database path (expand ~)
    pub fn resolve_db_path(&self) -> Result<PathBuf> {
        expand_home(&self.database_path)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Echo,
    Http,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub kind: EngineKind,
    /// Upstream endpoint for the http engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Delay between echo engine chunks
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
}

fn default_chunk_delay_ms() -> u64 {
    50
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::default(),
            url: None,
            chunk_delay_ms: default_chunk_delay_ms(),
        }
    }
}

impl Config {
    /// Load config from the default location or specified path
    pub fn load(path: Option<&str>) -> Result<Self> {
        let config_path = Self::config_path(path)?;

        if !config_path.exists() {
            info!(
                "Config file not found, creating default at {:?}",
                config_path
            );
            let config = Config::default();
            config.save(path)?;
            return Ok(config);
        }

        let raw = fs::read_to_string(&config_path).context("Failed to read config file")?;
        let config = Self::from_yaml(&raw)?;

        debug!("Loaded config from {:?}", config_path);
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).context("Failed to parse config file")
    }

    /// Save config to the default location or specified path
    pub fn save(&self, path: Option<&str>) -> Result<()> {
        let config_path = Self::config_path(path)?;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_yaml::to_string(&self)?;
        fs::write(&config_path, content).context("Failed to write config file")?;

        info!("Saved config to {:?}", config_path);
        Ok(())
    }

    /// Get the config file path
    fn config_path(path: Option<&str>) -> Result<PathBuf> {
        // Check env override first
        if let Ok(env_path) = std::env::var("GENFLIGHT_CONFIG") {
            return Ok(PathBuf::from(env_path));
        }

        if let Some(p) = path {
            return Ok(PathBuf::from(p));
        }

        let home = dirs::home_dir().context("Cannot find home directory")?;
        Ok(home.join(".genflight").join("config.yml"))
    }
}

fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~") {
        Some(rest) => {
            let home = dirs::home_dir().context("Cannot find home directory")?;
            Ok(home.join(rest.trim_start_matches('/')))
        }
        None => Ok(PathBuf::from(path)),
    }
}
