//! Connection options derived from settings
//!
//! A [`BrokerConfig`] is rebuilt from [`BrokerSettings`] for every connection
//! attempt, so a generated client id changes between attempts.

use crate::config::{BrokerSettings, ConfigError};
use url::Url;
use uuid::Uuid;

/// Prefix of generated client ids
pub const CLIENT_ID_PREFIX: &str = "homey_";
/// Last will payload used when none is configured
pub const DEFAULT_LAST_WILL_MESSAGE: &str = "client Offline";

/// Last will and testament published by the broker on unexpected disconnect.
/// Always qos 0 and retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWillConfig {
    pub topic: String,
    pub payload: String,
}

/// Immutable options for one connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub tls: bool,
    pub host: String,
    pub port: u16,
    /// Skip certificate validation
    pub accept_invalid_certs: bool,
    pub client_id: String,
    pub keepalive_secs: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub last_will: Option<LastWillConfig>,
    pub reconnect_period_ms: u64,
}

impl BrokerConfig {
    /// Derive connection options from the current settings
    pub fn from_settings(settings: &BrokerSettings) -> Result<Self, ConfigError> {
        settings.validate()?;

        let client_id = if settings.custom_client_id {
            settings.client_id.trim().to_string()
        } else {
            generate_client_id()
        };

        let last_will = settings.use_last_will.then(|| LastWillConfig {
            topic: non_empty(settings.last_will_topic.as_deref())
                .map(str::to_string)
                .unwrap_or_else(|| format!("{client_id}/status")),
            payload: non_empty(settings.last_will_message.as_deref())
                .unwrap_or(DEFAULT_LAST_WILL_MESSAGE)
                .to_string(),
        });

        let config = BrokerConfig {
            tls: settings.tls,
            host: settings.host.trim().to_string(),
            port: settings.port,
            accept_invalid_certs: settings.self_signed,
            client_id,
            keepalive_secs: settings.keepalive,
            username: settings.username.clone().filter(|u| !u.is_empty()),
            password: settings.resolve_password(),
            last_will,
            reconnect_period_ms: settings.reconnect_period_ms,
        };

        Url::parse(&config.broker_url())
            .map_err(|e| ConfigError::InvalidBrokerUrl(format!("{}: {e}", config.broker_url())))?;

        Ok(config)
    }

    pub fn scheme(&self) -> &'static str {
        if self.tls {
            "mqtts"
        } else {
            "mqtt"
        }
    }

    /// `mqtt[s]://host:port`
    pub fn broker_url(&self) -> String {
        format!("{}://{}:{}", self.scheme(), self.host, self.port)
    }
}

/// `homey_` followed by 8 random hex characters
pub fn generate_client_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{CLIENT_ID_PREFIX}{}", &hex[..8])
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}
