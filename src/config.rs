//! Configuration system for the broker connection core
//!
//! Settings are read from a TOML file. The `[broker]` section mirrors the
//! settings page of the host application and is re-read into a fresh
//! [`BrokerConfig`](crate::broker::BrokerConfig) on every connection attempt.

use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default keepalive interval in seconds
pub const DEFAULT_KEEPALIVE_SECS: u16 = 60;

/// Top level configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubConfig {
    pub broker: BrokerSettings,
    #[serde(default)]
    pub api: ApiSection,
    /// Topics registered with the `trigger` purpose when the hub starts
    #[serde(default)]
    pub subscriptions: Vec<String>,
}

/// Broker connection settings as entered by the user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSettings {
    /// Use `mqtts://` instead of `mqtt://`
    #[serde(default)]
    pub tls: bool,
    /// Broker host name or IP address
    pub host: String,
    /// Broker port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Accept self-signed certificates (disables certificate validation)
    #[serde(default)]
    pub self_signed: bool,
    /// Keepalive interval; non-numeric input falls back to 60 seconds
    #[serde(default = "default_keepalive", deserialize_with = "lenient_keepalive")]
    pub keepalive: u16,
    /// Use `client_id` instead of a generated `homey_xxxxxxxx` id
    #[serde(default)]
    pub custom_client_id: bool,
    #[serde(default)]
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Environment variable holding the password when `password` is not set
    pub password_env: Option<String>,
    #[serde(default)]
    pub use_last_will: bool,
    pub last_will_topic: Option<String>,
    pub last_will_message: Option<String>,
    /// Delay between automatic reconnect attempts of the transport
    #[serde(default = "default_reconnect_period")]
    pub reconnect_period_ms: u64,
}

/// HTTP API section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiSection {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_bind")]
    pub bind: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            bind: default_api_bind(),
            port: default_api_port(),
        }
    }
}

fn default_port() -> u16 {
    1883
}

fn default_keepalive() -> u16 {
    DEFAULT_KEEPALIVE_SECS
}

fn default_reconnect_period() -> u64 {
    1000
}

fn default_api_enabled() -> bool {
    true
}

fn default_api_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8080
}

#[derive(Deserialize)]
#[serde(untagged)]
enum KeepaliveInput {
    Number(i64),
    Float(f64),
    Text(String),
    Other(IgnoredAny),
}

/// Keepalive may arrive as anything from the settings page. Leading digits
/// count, fractions are truncated, everything else means the default.
fn lenient_keepalive<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    let parsed = match KeepaliveInput::deserialize(deserializer)? {
        KeepaliveInput::Number(n) => u16::try_from(n).ok(),
        KeepaliveInput::Float(f) if f.is_finite() => u16::try_from(f.trunc() as i64).ok(),
        KeepaliveInput::Float(_) | KeepaliveInput::Other(_) => None,
        KeepaliveInput::Text(s) => {
            let digits: String = s.trim().chars().take_while(char::is_ascii_digit).collect();
            digits.parse::<u16>().ok()
        }
    };
    Ok(parsed.unwrap_or(DEFAULT_KEEPALIVE_SECS))
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Missing broker host")]
    MissingHost,
    #[error("Invalid broker port: {0}")]
    InvalidPort(u16),
    #[error("Custom client id enabled but no client id given")]
    MissingClientId,
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("No configuration file found in: {0:?}")]
    NotFound(Vec<PathBuf>),
}

impl BrokerSettings {
    /// Minimal settings for a plain connection to `host:port`
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            tls: false,
            host: host.into(),
            port,
            self_signed: false,
            keepalive: DEFAULT_KEEPALIVE_SECS,
            custom_client_id: false,
            client_id: String::new(),
            username: None,
            password: None,
            password_env: None,
            use_last_will: false,
            last_will_topic: None,
            last_will_message: None,
            reconnect_period_ms: default_reconnect_period(),
        }
    }

    /// Check the settings that can be checked without connecting
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingHost);
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }
        if self.custom_client_id && self.client_id.trim().is_empty() {
            return Err(ConfigError::MissingClientId);
        }
        Ok(())
    }

    /// Password from the settings, falling back to the configured environment variable
    pub fn resolve_password(&self) -> Option<String> {
        self.password.clone().or_else(|| {
            self.password_env
                .as_ref()
                .and_then(|name| std::env::var(name).ok())
        })
    }
}

impl HubConfig {
    /// Default locations searched when no path is given
    pub const DEFAULT_PATHS: [&'static str; 2] = ["mqtthub.toml", "config/mqtthub.toml"];

    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: HubConfig = toml::from_str(content)?;
        config.broker.validate()?;
        Ok(config)
    }

    /// Load from the first existing default location
    pub fn load_default() -> Result<Self, ConfigError> {
        let candidates: Vec<PathBuf> = Self::DEFAULT_PATHS.iter().map(PathBuf::from).collect();
        match candidates.iter().find(|p| p.exists()) {
            Some(path) => Self::load_from_file(path),
            None => Err(ConfigError::NotFound(candidates)),
        }
    }

    /// Copy of the configuration safe to print
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.broker.password.is_some() {
            copy.broker.password = Some("***".to_string());
        }
        copy
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
subscriptions = ["home/livingroom/temp"]

[broker]
host = "localhost"
port = 1883
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}
