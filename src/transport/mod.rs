//! Transport layer between the Connection Manager and the broker
//!
//! A [`Connector`] opens one [`Transport`] per connection attempt. The
//! transport reports what happens on the link through an [`EventSender`];
//! every event is tagged with the session it belongs to so that events from a
//! transport that was already replaced can be recognised and dropped.

use crate::broker::{BrokerConfig, QueuedMessage};
use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to open transport: {0}")]
    OpenFailed(String),

    #[error("{operation} on '{topic}' failed: {reason}")]
    RequestFailed {
        operation: &'static str,
        topic: String,
        reason: String,
    },

    #[error("Not connected to broker")]
    NotConnected,

    #[error("Transport session closed")]
    SessionClosed,
}

impl TransportError {
    pub fn request_failed(
        operation: &'static str,
        topic: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        Self::RequestFailed {
            operation,
            topic: topic.into(),
            reason: reason.to_string(),
        }
    }
}

/// A message delivered by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl InboundMessage {
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).to_string()
    }
}

/// What a transport reports about its link
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Reconnecting,
    Closed,
    Offline,
    Error(String),
    Message(InboundMessage),
    /// Outcome of an earlier wire subscribe
    SubscribeAck {
        topic: String,
        result: Result<(), String>,
    },
}

/// A transport event tagged with the session that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub session: u64,
    pub event: TransportEvent,
}

pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Handle given to a transport for reporting events
#[derive(Debug, Clone)]
pub struct EventSender {
    session: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSender {
    pub fn new(session: u64, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// Report an event. Returns false once the manager is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(SessionEvent {
                session: self.session,
                event,
            })
            .is_ok()
    }
}

/// An open link to the broker
///
/// Calls return once the request is handed to the client library, not when
/// the broker acknowledges it. Subscribe outcomes arrive later as
/// [`TransportEvent::SubscribeAck`].
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn publish(&self, message: &QueuedMessage) -> Result<(), TransportError>;

    /// Close the link. Pending requests may be dropped.
    async fn end(&self);
}

/// Opens transports
pub trait Connector: Send + Sync {
    /// Start connecting. Must return without waiting for the broker; the
    /// outcome is reported through `events`.
    fn open(
        &self,
        config: &BrokerConfig,
        events: EventSender,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_sender_tags_session() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = EventSender::new(7, tx);
        assert!(sender.emit(TransportEvent::Connected));

        let received = rx.try_recv().unwrap();
        assert_eq!(received.session, 7);
        assert_eq!(received.event, TransportEvent::Connected);
    }

    #[test]
    fn test_event_sender_reports_closed_channel() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = EventSender::new(1, tx);
        drop(rx);
        assert!(!sender.emit(TransportEvent::Closed));
    }

    #[test]
    fn test_request_failed_message() {
        let error = TransportError::request_failed("subscribe", "a/b", "channel full");
        assert_eq!(error.to_string(), "subscribe on 'a/b' failed: channel full");
    }
}
