use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Clone, Debug, Deserialize)]
pub struct AviaryConfig {
    pub data_dir: PathBuf,
    #[serde(default)]
    pub fleet: FleetConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FleetConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_max_awake")]
    pub max_awake_inboxes: usize,
    #[serde(default = "default_protection_window_ms")]
    pub eviction_protection_window_ms: u64,
    #[serde(default = "default_checker_interval_ms")]
    pub checker_interval_ms: u64,
    #[serde(default = "default_enabled")]
    pub spare_enabled: bool,
    #[serde(default = "default_invite_ttl_ms")]
    pub invite_ttl_ms: u64,
    #[serde(default = "default_conversation_ttl_ms")]
    pub conversation_ttl_ms: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            max_awake_inboxes: default_max_awake(),
            eviction_protection_window_ms: default_protection_window_ms(),
            checker_interval_ms: default_checker_interval_ms(),
            spare_enabled: default_enabled(),
            invite_ttl_ms: default_invite_ttl_ms(),
            conversation_ttl_ms: default_conversation_ttl_ms(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

fn default_namespace() -> String {
    "daemon".to_string()
}

fn default_max_awake() -> usize {
    25
}

fn default_protection_window_ms() -> u64 {
    10 * 60 * 1000
}

fn default_checker_interval_ms() -> u64 {
    60 * 1000
}

fn default_invite_ttl_ms() -> u64 {
    7 * 24 * 60 * 60 * 1000
}

fn default_conversation_ttl_ms() -> u64 {
    30 * 24 * 60 * 60 * 1000
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io")]
    Io,
    #[error("parse")]
    Parse,
}

pub fn load_config(path: &Path) -> Result<AviaryConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
    toml::from_str(&content).map_err(|_| ConfigError::Parse)
}
