//! # Config
//!
//! [`Settings`] is built once at startup and handed to everything that needs
//! it. [`ConfigStore`] persists the address of the paired cuff.
//!

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Duration;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::pairing::AgentTimeouts;

/// Environment variable overriding [`Settings::data_dir`]
pub const DATA_DIR_ENV: &str = "DATA_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not access config file: {0}")]
    Io(#[from] io::Error),
    #[error("config file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default)]
    pub file_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: false,
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            ansi_colors: default_true(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairingSettings {
    /// Control shell driven on Linux
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
    #[serde(default = "default_prompt_timeout")]
    pub prompt_timeout_secs: u64,
}

impl PairingSettings {
    pub fn timeouts(&self) -> AgentTimeouts {
        AgentTimeouts {
            ready: Duration::from_secs(self.ready_timeout_secs),
            prompt: Duration::from_secs(self.prompt_timeout_secs),
        }
    }
}

impl Default for PairingSettings {
    fn default() -> Self {
        Self {
            program: default_program(),
            ready_timeout_secs: default_ready_timeout(),
            prompt_timeout_secs: default_prompt_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Holds the stored config and the records file
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_config_file")]
    pub config_file: String,
    #[serde(default = "default_records_file")]
    pub records_file: String,

    // Connection
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_secs: u64,
    #[serde(default = "default_backoff")]
    pub backoff_secs: u64,
    #[serde(default = "default_liveness_interval")]
    pub liveness_interval_secs: u64,
    #[serde(default = "default_capture_window")]
    pub capture_window_secs: u64,

    #[serde(default)]
    pub pairing: PairingSettings,
    #[serde(default)]
    pub log: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            config_file: default_config_file(),
            records_file: default_records_file(),
            scan_timeout_secs: default_scan_timeout(),
            backoff_secs: default_backoff(),
            liveness_interval_secs: default_liveness_interval(),
            capture_window_secs: default_capture_window(),
            pairing: PairingSettings::default(),
            log: LogSettings::default(),
        }
    }
}

impl Settings {
    /// Defaults, with the data directory taken from `DATA_DIR` when set
    pub fn from_env() -> Settings {
        Settings::default().with_env()
    }

    /// Reads settings from a JSON file. Missing fields take their defaults
    /// and `DATA_DIR` still wins over the file.
    pub fn load(path: &Path) -> Result<Settings, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&contents)?;
        Ok(settings.with_env())
    }

    fn with_env(mut self) -> Settings {
        if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
            self.data_dir = PathBuf::from(dir);
        }
        self
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(&self.config_file)
    }

    pub fn records_path(&self) -> PathBuf {
        self.data_dir.join(&self.records_file)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    /// Wait between reconnection attempts
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs.max(1))
    }

    pub fn capture_window(&self) -> Duration {
        Duration::from_secs(self.capture_window_secs)
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "systole".to_string()
}
fn default_program() -> String {
    "bluetoothctl".to_string()
}
fn default_ready_timeout() -> u64 {
    5
}
fn default_prompt_timeout() -> u64 {
    30
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/appdata")
}
fn default_config_file() -> String {
    "config.json".to_string()
}
fn default_records_file() -> String {
    "records.csv".to_string()
}
fn default_scan_timeout() -> u64 {
    5
}
fn default_backoff() -> u64 {
    5
}
fn default_liveness_interval() -> u64 {
    2
}
fn default_capture_window() -> u64 {
    60
}

/// What the config file holds. Keys other than `device_address` are kept as
/// they are.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_address: Option<String>,
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

/// The config file holding the paired device address
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> ConfigStore {
        ConfigStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file reads as an empty config
    pub fn load(&self) -> Result<StoredConfig, ConfigError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(StoredConfig::default()),
            Err(e) => return Err(e.into()),
        };

        Ok(serde_json::from_str(&contents)?)
    }

    pub fn save(&self, config: &StoredConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(config)?;
        fs::write(&self.path, json)?;
        Ok(())
    }

    /// Store `address` as the paired device
    pub fn remember_device(&self, address: &str) -> Result<(), ConfigError> {
        let mut config = self.load()?;
        config.device_address = Some(address.to_string());
        self.save(&config)
    }
}
