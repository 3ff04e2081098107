//! Configuration loader and validator for the handle watcher.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::probe::{ApiCredentials, ProxySettings};
use crate::queue::QueueOptions;

pub const TWITCH_CLIENT_ID_ENV: &str = "TWITCH_CLIENT_ID";
pub const TWITCH_CLIENT_SECRET_ENV: &str = "TWITCH_CLIENT_SECRET";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub queue: Queue,
    pub probe: Probe,
    #[serde(default)]
    pub twitch: ApiCredentials,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub sweep_interval_secs: u64,
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Queue {
    pub max_concurrent: usize,
    pub batch_size: usize,
    pub max_retries: u32,
    pub default_platform_limit: usize,
    #[serde(default)]
    pub platform_limits: HashMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Probe {
    pub timeout_ms: u64,
    #[serde(default)]
    pub proxy: Option<ProxySettings>,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/handles.db", self.app.data_dir))
    }

    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            max_concurrent: self.queue.max_concurrent,
            default_platform_limit: self.queue.default_platform_limit,
            platform_limits: self.queue.platform_limits.clone(),
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe.timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.app.sweep_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.app.cleanup_interval_secs)
    }

    /// Environment credentials take precedence over the file.
    pub fn apply_env(&mut self) {
        if let Ok(id) = std::env::var(TWITCH_CLIENT_ID_ENV) {
            self.twitch.client_id = id;
        }
        if let Ok(secret) = std::env::var(TWITCH_CLIENT_SECRET_ENV) {
            self.twitch.client_secret = secret;
        }
    }
}

/// Load configuration from a YAML file, apply environment overrides and validate.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    cfg.apply_env();
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance. Missing API credentials are allowed;
/// they only disable the platforms that need them.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.sweep_interval_secs == 0 {
        return Err(ConfigError::Invalid("app.sweep_interval_secs must be > 0"));
    }
    if cfg.app.cleanup_interval_secs == 0 {
        return Err(ConfigError::Invalid("app.cleanup_interval_secs must be > 0"));
    }

    if cfg.queue.max_concurrent == 0 {
        return Err(ConfigError::Invalid("queue.max_concurrent must be > 0"));
    }
    if cfg.queue.batch_size == 0 {
        return Err(ConfigError::Invalid("queue.batch_size must be > 0"));
    }
    if cfg.queue.default_platform_limit == 0 {
        return Err(ConfigError::Invalid("queue.default_platform_limit must be > 0"));
    }
    if cfg.queue.platform_limits.values().any(|limit| *limit == 0) {
        return Err(ConfigError::Invalid("queue.platform_limits entries must be > 0"));
    }

    if cfg.probe.timeout_ms == 0 {
        return Err(ConfigError::Invalid("probe.timeout_ms must be > 0"));
    }
    if let Some(proxy) = &cfg.probe.proxy {
        if proxy.host.trim().is_empty() {
            return Err(ConfigError::Invalid("probe.proxy.host must be non-empty"));
        }
        if proxy.port == 0 {
            return Err(ConfigError::Invalid("probe.proxy.port must be > 0"));
        }
    }

    Ok(())
}

/// Example configuration document.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  sweep_interval_secs: 300
  cleanup_interval_secs: 86400

queue:
  max_concurrent: 10
  batch_size: 10
  max_retries: 3
  default_platform_limit: 5
  platform_limits:
    twitch: 8

probe:
  timeout_ms: 7000
  proxy:
    host: "proxy.example.net"
    port: 7000
    username: "YOUR_PROXY_USER"
    password: "YOUR_PROXY_PASSWORD"

twitch:
  client_id: "YOUR_TWITCH_CLIENT_ID"
  client_secret: "YOUR_TWITCH_CLIENT_SECRET"
"#
}
