//! Broker connection core
//!
//! - [`topics`] - Topic Registry, pure bookkeeping of who wants which topic
//! - [`send_queue`] - FIFO of messages waiting for a connection
//! - [`publish`] - strict parsing of publish requests
//! - [`options`] - per-attempt connection options
//! - [`state`] - pure connection state machine
//! - [`manager`] - the Connection Manager tying them together

pub mod manager;
pub mod options;
pub mod publish;
pub mod send_queue;
pub mod state;
pub mod topics;

pub use manager::{
    BrokerEvent, BrokerStatus, ConnectionManager, PublishOutcome, SubscribeOutcome, TopicStatus,
};
pub use options::{generate_client_id, BrokerConfig, LastWillConfig};
pub use publish::{PublishRequest, ValidationError};
pub use send_queue::{QueueError, QueuedMessage, SendQueue};
pub use state::{Availability, ConnectionState, ConnectionTracker, LinkEvent, Transition};
pub use topics::{CallerRef, Purpose, RemoveOutcome, Topic, TopicReference, TopicRegistry};
