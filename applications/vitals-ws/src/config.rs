use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub upstream: Option<UpstreamConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `pretty` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Key shared by every device without an entry in `device_keys`
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub device_keys: HashMap<String, String>,

    #[serde(default = "default_auth_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            device_keys: HashMap::new(),
            timeout_secs: default_auth_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl AuthConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_auth_timeout_secs() -> u64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub history_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { history_size: 100 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub min: f64,
    pub max: f64,
}

impl Band {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Critical bands. A reading outside any of them raises an alert.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub heart_rate: Band,
    pub temperature: Band,
    pub spo2_min: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            heart_rate: Band {
                min: 40.0,
                max: 150.0,
            },
            temperature: Band {
                min: 35.0,
                max: 39.0,
            },
            spo2_min: 90.0,
        }
    }
}

/// Settings handed back to devices that ask for their configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub sampling_rate_ms: u64,
    pub max_retries: u32,
    pub request_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            sampling_rate_ms: 1000,
            max_retries: 3,
            request_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
    pub device_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

impl UpstreamConfig {
    pub fn new(url: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            device_id: device_id.into(),
            api_key: None,
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

fn default_max_reconnect_attempts() -> u32 {
    3
}

fn default_reconnect_base_delay_ms() -> u64 {
    1000
}

fn default_reconnect_max_delay_ms() -> u64 {
    10_000
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

impl Config {
    /// Load configuration from a YAML file with environment variable substitution
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        // Expand environment variables in the format $(VAR_NAME)
        let expanded = expand_env_vars(content);

        let config: Config = serde_yaml::from_str(&expanded)?;

        config.validate()?;

        Ok(config)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(AppError::Config("Server port cannot be 0".to_string()));
        }

        let has_shared_key = self
            .auth
            .api_key
            .as_ref()
            .map(|k| !k.is_empty())
            .unwrap_or(false);
        if !has_shared_key && self.auth.device_keys.is_empty() {
            return Err(AppError::Config(
                "Either auth.api_key or auth.device_keys must be provided".to_string(),
            ));
        }

        if let Some(key) = &self.auth.api_key {
            reject_placeholder("auth.api_key", key)?;
        }
        for (device_id, key) in &self.auth.device_keys {
            reject_placeholder(&format!("auth.device_keys.{}", device_id), key)?;
        }

        if self.auth.timeout_secs == 0 {
            return Err(AppError::Config(
                "auth.timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.auth.sweep_interval_secs == 0 {
            return Err(AppError::Config(
                "auth.sweep_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.storage.history_size == 0 {
            return Err(AppError::Config(
                "storage.history_size must be greater than 0".to_string(),
            ));
        }

        let t = &self.thresholds;
        if t.heart_rate.min > t.heart_rate.max || t.temperature.min > t.temperature.max {
            return Err(AppError::Config(
                "Threshold bands must have min <= max".to_string(),
            ));
        }

        if let Some(upstream) = &self.upstream {
            if upstream.url.is_empty() {
                return Err(AppError::Config("upstream.url cannot be empty".to_string()));
            }
            if upstream.device_id.is_empty() {
                return Err(AppError::Config(
                    "upstream.device_id cannot be empty".to_string(),
                ));
            }
            if let Some(key) = &upstream.api_key {
                reject_placeholder("upstream.api_key", key)?;
            }
            if upstream.heartbeat_interval_secs == 0 {
                return Err(AppError::Config(
                    "upstream.heartbeat_interval_secs must be greater than 0".to_string(),
                ));
            }
        }

        Ok(())
    }
}

const ENV_VAR_PATTERN: &str = r"\$\(([A-Z_][A-Z0-9_]*)\)";

/// A key still holding `$(VAR_NAME)` means the variable was never set.
fn reject_placeholder(field: &str, value: &str) -> Result<()> {
    let unexpanded = regex::Regex::new(ENV_VAR_PATTERN)
        .map(|re| re.is_match(value))
        .unwrap_or(false);
    if unexpanded {
        return Err(AppError::Config(format!(
            "{} references an unset environment variable: {}",
            field, value
        )));
    }
    Ok(())
}

/// Expand environment variables in the format $(VAR_NAME)
fn expand_env_vars(content: &str) -> String {
    let mut result = content.to_string();

    let re = match regex::Regex::new(ENV_VAR_PATTERN) {
        Ok(re) => re,
        Err(_) => return result,
    };

    for cap in re.captures_iter(content) {
        let full_match = &cap[0];
        let var_name = &cap[1];

        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(full_match, &value);
        }
    }

    result
}
