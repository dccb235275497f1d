//! Configuration parsing for the daemon.
//!
//! Matches the `key=value` format of a coderunner config file.
//! Precedence: CLI flags > environment > `--config` file > defaults.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("missing required config value: {0}")]
    MissingRequired(String),
}

/// CoW cloning strategy for the workspace manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CowMethod {
    /// Probe in order: reflink, subvolume snapshot, hardlink tree, plain copy.
    #[default]
    Auto,
    Reflink,
    Subvolume,
    Hardlink,
    Copy,
}

impl CowMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Reflink => "reflink",
            Self::Subvolume => "subvolume",
            Self::Hardlink => "hardlink",
            Self::Copy => "copy",
        }
    }
}

/// Daemon configuration. Field names match the config file's keys.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    pub workspace_root: PathBuf,
    pub jobs_max_concurrent: u32,
    pub jobs_timeout_default_sec: u32,
    pub jobs_retention_hours: u32,
    /// HMAC signing key for bearer tokens. Empty until loaded; a blank
    /// value at startup is a fatal configuration error.
    pub auth_signing_key: String,
    pub auth_token_ttl_sec: u32,
    pub executor_binary: String,
    pub executor_env_allow: Vec<String>,
    pub index_binary: String,
    pub cow_method: CowMethod,
    pub bind_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("./coderunner-data"),
            jobs_max_concurrent: 5,
            jobs_timeout_default_sec: 600,
            jobs_retention_hours: 24,
            auth_signing_key: String::new(),
            auth_token_ttl_sec: 3600,
            executor_binary: "claude".to_string(),
            executor_env_allow: Vec::new(),
            index_binary: "coderunner-index".to_string(),
            cow_method: CowMethod::Auto,
            bind_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };
            let key = key.trim();
            let value = Self::unquote(value.trim());
            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single `key=value` override on top of environment/file layers.
    pub fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "workspace_root" => self.workspace_root = PathBuf::from(value),
            "jobs_max_concurrent" => self.jobs_max_concurrent = Self::parse_int(key, value)?,
            "jobs_timeout_default_sec" => {
                self.jobs_timeout_default_sec = Self::parse_int(key, value)?;
            }
            "jobs_retention_hours" => self.jobs_retention_hours = Self::parse_int(key, value)?,
            "auth_signing_key" => self.auth_signing_key = value.to_string(),
            "auth_token_ttl_sec" => self.auth_token_ttl_sec = Self::parse_int(key, value)?,
            "executor_binary" => self.executor_binary = value.to_string(),
            "executor_env_allow" => {
                self.executor_env_allow = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "index_binary" => self.index_binary = value.to_string(),
            "cow_method" => {
                self.cow_method = match value {
                    "auto" => CowMethod::Auto,
                    "reflink" => CowMethod::Reflink,
                    "subvolume" => CowMethod::Subvolume,
                    "hardlink" => CowMethod::Hardlink,
                    "copy" => CowMethod::Copy,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "cow_method must be one of auto/reflink/subvolume/hardlink/copy, got '{value}'"
                        )))
                    }
                };
            }
            "bind_addr" => self.bind_addr = value.to_string(),
            _ => {
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    #[allow(dead_code)]
    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Apply environment variable overrides. Called after `from_file`,
    /// before CLI flags, per the documented precedence order.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("CODERUNNER_SIGNING_KEY") {
            self.auth_signing_key = v;
        }
        if let Ok(v) = std::env::var("CODERUNNER_WORKSPACE_ROOT") {
            self.workspace_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CODERUNNER_MAX_CONCURRENT") {
            self.jobs_max_concurrent = Self::parse_int("jobs_max_concurrent", &v)?;
        }
        Ok(())
    }

    /// Fail fast on missing required configuration (non-zero exit on fatal
    /// startup error).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth_signing_key.trim().is_empty() {
            return Err(ConfigError::MissingRequired("auth_signing_key".to_string()));
        }
        if self.jobs_max_concurrent == 0 {
            return Err(ConfigError::InvalidInt {
                key: "jobs_max_concurrent".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}
