//! mqtthub
//!
//! One shared, resilient connection to an MQTT broker for a home automation
//! host:
//! - a Topic Registry tracking which internal consumers want which topics
//! - a Send Queue buffering publishes until a connection exists
//! - a Connection Manager running the connection state machine, resubscribing
//!   and draining the queue on every (re)connect
//! - a rumqttc transport, a warp HTTP API and tracing-based observability
//!
//! # Quick Start
//!
//! ```rust
//! use mqtthub::broker::{ConnectionState, PublishOutcome, PublishRequest};
//! use mqtthub::config::BrokerSettings;
//! use mqtthub::testing::mock_manager;
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let (manager, _events, connector) = mock_manager(BrokerSettings::new("localhost", 1883));
//!
//! // Not connected yet: the message waits in the queue and a connect starts
//! let request = PublishRequest::new("home/lamp", json!({"state": "on"})).with_qos(1);
//! let outcome = manager.publish_request(request).await.unwrap();
//! assert_eq!(outcome, PublishOutcome::Queued);
//! assert_eq!(manager.state().await, ConnectionState::Connecting);
//! assert_eq!(connector.open_count(), 1);
//! # });
//! ```

pub mod api;
pub mod broker;
pub mod config;
pub mod error;
pub mod observability;
pub mod testing;
pub mod transport;

pub use broker::{
    BrokerConfig, BrokerEvent, ConnectionManager, ConnectionState, PublishRequest, Purpose,
    QueuedMessage,
};
pub use config::{BrokerSettings, ConfigError, HubConfig};
pub use error::{BrokerError, BrokerResult};
