//! rumqttc-backed transport
//!
//! Split the same way throughout:
//!
//! - [`connection`] - pure option building, TLS setup
//! - [`message_handler`] - pure event routing
//! - [`client`] - impure I/O: the client handle and the event pump
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtthub::broker::ConnectionManager;
//! use mqtthub::config::BrokerSettings;
//! use mqtthub::transport::mqtt::RumqttcConnector;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let settings = BrokerSettings::new("localhost", 1883);
//! let (manager, events) = ConnectionManager::new(settings, Arc::new(RumqttcConnector::new()));
//! tokio::spawn(manager.clone().run(events));
//! manager.connect().await;
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{RumqttcConnector, RumqttcTransport};
pub use connection::configure_mqtt_options;
pub use message_handler::{EventRoute, MessageHandler};
