//! Configuration loading and validation tests
//!
//! Tests focus on what a loaded file turns into: validated settings and the
//! connection options derived from them.

use mqtthub::broker::BrokerConfig;
use mqtthub::config::{ConfigError, HubConfig};
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    write!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
subscriptions = ["home/+/temperature"]

[broker]
host = "broker.local"
port = 1883
username = "homey"
password = "secret"

[api]
port = 9090
"#,
    );

    let config = HubConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.broker.host, "broker.local");
    assert_eq!(config.broker.username.as_deref(), Some("homey"));
    assert_eq!(config.api.port, 9090);
    assert_eq!(config.api.bind, "127.0.0.1");
    assert_eq!(config.subscriptions, vec!["home/+/temperature"]);
}

#[test]
fn test_config_returns_error_when_broker_section_missing() {
    let temp_file = write_config("subscriptions = []\n");

    let result = HubConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_returns_error_for_empty_file() {
    let temp_file = NamedTempFile::new().unwrap();

    let result = HubConfig::load_from_file(temp_file.path());

    assert!(result.is_err());
}

#[test]
fn test_config_returns_error_for_missing_file() {
    let dir = tempfile::tempdir().unwrap();

    let result = HubConfig::load_from_file(&dir.path().join("absent.toml"));

    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_config_returns_error_for_empty_host() {
    let temp_file = write_config("[broker]\nhost = \"\"\n");

    let result = HubConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::MissingHost)));
}

#[test]
fn test_generated_client_id_format() {
    let config = HubConfig::from_toml("[broker]\nhost = \"broker.local\"\n").unwrap();

    let first = BrokerConfig::from_settings(&config.broker).unwrap();
    let second = BrokerConfig::from_settings(&config.broker).unwrap();

    for id in [&first.client_id, &second.client_id] {
        let suffix = id.strip_prefix("homey_").expect("generated ids carry the prefix");
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }
    assert_ne!(first.client_id, second.client_id, "every attempt gets a fresh id");
}

#[test]
fn test_custom_client_id_is_used_verbatim() {
    let config = HubConfig::from_toml(
        "[broker]\nhost = \"h\"\ncustom_client_id = true\nclient_id = \" kitchen-hub \"\n",
    )
    .unwrap();

    let options = BrokerConfig::from_settings(&config.broker).unwrap();

    assert_eq!(options.client_id, "kitchen-hub");
}

#[test]
fn test_tls_settings_produce_secure_url() {
    let config = HubConfig::from_toml(
        "[broker]\nhost = \"secure.local\"\nport = 8883\ntls = true\nself_signed = true\n",
    )
    .unwrap();

    let options = BrokerConfig::from_settings(&config.broker).unwrap();

    assert_eq!(options.broker_url(), "mqtts://secure.local:8883");
    assert!(options.accept_invalid_certs);
}

#[test]
fn test_last_will_defaults_when_enabled_without_details() {
    let config = HubConfig::from_toml(
        "[broker]\nhost = \"h\"\ncustom_client_id = true\nclient_id = \"hub\"\nuse_last_will = true\n",
    )
    .unwrap();

    let options = BrokerConfig::from_settings(&config.broker).unwrap();
    let will = options.last_will.expect("last will enabled");

    assert_eq!(will.topic, "hub/status");
    assert!(!will.payload.is_empty());
}

#[test]
fn test_last_will_absent_unless_enabled() {
    let config = HubConfig::from_toml(
        "[broker]\nhost = \"h\"\nlast_will_topic = \"x\"\nlast_will_message = \"y\"\n",
    )
    .unwrap();

    let options = BrokerConfig::from_settings(&config.broker).unwrap();

    assert!(options.last_will.is_none());
}

#[test]
fn test_empty_username_means_anonymous() {
    let config = HubConfig::from_toml("[broker]\nhost = \"h\"\nusername = \"\"\n").unwrap();

    let options = BrokerConfig::from_settings(&config.broker).unwrap();

    assert!(options.username.is_none());
}

#[test]
fn test_host_with_spaces_rejected_as_url() {
    let config = HubConfig::from_toml("[broker]\nhost = \"bad host\"\n").unwrap();

    let result = BrokerConfig::from_settings(&config.broker);

    assert!(matches!(result, Err(ConfigError::InvalidBrokerUrl(_))));
}
