//! Impure I/O around the rumqttc client
//!
//! [`RumqttcConnector`] opens a [`RumqttcTransport`] and spawns the task that
//! polls the rumqttc event loop. The pump translates events into
//! [`TransportEvent`]s and keeps retrying a lost link every
//! `reconnect_period_ms` until the transport is ended.

use super::connection::{configure_mqtt_options, REQUEST_CHANNEL_CAPACITY};
use super::message_handler::{EventRoute, MessageHandler};
use crate::broker::{BrokerConfig, QueuedMessage};
use crate::transport::{Connector, EventSender, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Qos used for wire subscriptions
const SUBSCRIBE_QOS: QoS = QoS::AtMostOnce;

/// Maps SUBACK packet ids back to topic names.
///
/// Topics wait in `queued` until the event loop reports the packet id it
/// assigned, in the order the subscribes were issued.
#[derive(Debug, Default)]
struct SubscribeTracker {
    queued: VecDeque<String>,
    in_flight: HashMap<u16, String>,
}

impl SubscribeTracker {
    fn on_sent(&mut self, packet_id: u16) {
        if let Some(topic) = self.queued.pop_front() {
            self.in_flight.insert(packet_id, topic);
        }
    }

    fn on_ack(&mut self, packet_id: u16) -> Option<String> {
        self.in_flight.remove(&packet_id)
    }

    /// Outstanding subscribes die with the link
    fn reset(&mut self) {
        self.queued.clear();
        self.in_flight.clear();
    }
}

/// Opens rumqttc connections
#[derive(Debug, Default, Clone)]
pub struct RumqttcConnector;

impl RumqttcConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for RumqttcConnector {
    fn open(
        &self,
        config: &BrokerConfig,
        events: EventSender,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::OpenFailed(format!("No async runtime: {e}")))?;

        let options = configure_mqtt_options(config);
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tracker = Arc::new(Mutex::new(SubscribeTracker::default()));

        info!(
            broker = %config.broker_url(),
            client_id = %config.client_id,
            session = events.session(),
            "Opening MQTT connection"
        );

        let pump = EventPump {
            event_loop,
            events,
            tracker: tracker.clone(),
            shutdown_rx,
            reconnect_period: Duration::from_millis(config.reconnect_period_ms),
        };
        let handle = runtime.spawn(pump.run());

        Ok(Box::new(RumqttcTransport {
            client,
            tracker,
            shutdown_tx,
            handle,
        }))
    }
}

/// One open rumqttc connection.
///
/// Requests use the client's non-blocking `try_*` calls: while the event loop
/// is reconnecting it stops reading the request channel, and a full channel
/// fails the request instead of suspending the caller.
pub struct RumqttcTransport {
    client: AsyncClient,
    tracker: Arc<Mutex<SubscribeTracker>>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[async_trait]
impl Transport for RumqttcTransport {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let mut tracker = self.tracker.lock().await;
        tracker.queued.push_back(topic.to_string());
        if let Err(e) = self.client.try_subscribe(topic, SUBSCRIBE_QOS) {
            tracker.queued.pop_back();
            return Err(TransportError::request_failed("subscribe", topic, e));
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client
            .try_unsubscribe(topic)
            .map_err(|e| TransportError::request_failed("unsubscribe", topic, e))
    }

    async fn publish(&self, message: &QueuedMessage) -> Result<(), TransportError> {
        self.client
            .try_publish(
                message.topic.as_str(),
                message.qos,
                message.retain,
                message.payload.clone(),
            )
            .map_err(|e| TransportError::request_failed("publish", &message.topic, e))
    }

    async fn end(&self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request not delivered: {}", e);
        }
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for RumqttcTransport {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
    }
}

struct EventPump {
    event_loop: EventLoop,
    events: EventSender,
    tracker: Arc<Mutex<SubscribeTracker>>,
    shutdown_rx: watch::Receiver<bool>,
    reconnect_period: Duration,
}

impl EventPump {
    async fn run(mut self) {
        let session = self.events.session();
        debug!(session, "MQTT event pump started");

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                }
                result = self.event_loop.poll() => {
                    let keep_going = match result {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            self.process_event_route(route).await
                        }
                        Err(e) => self.handle_connection_error(e.to_string()).await,
                    };
                    if !keep_going {
                        break;
                    }
                }
            }
        }

        debug!(session, "MQTT event pump stopped");
    }

    /// Returns false once nobody listens anymore
    async fn process_event_route(&mut self, route: EventRoute) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => self.events.emit(TransportEvent::Connected),
            EventRoute::MessageReceived(message) => {
                self.events.emit(TransportEvent::Message(message))
            }
            EventRoute::Disconnected => self.events.emit(TransportEvent::Offline),
            EventRoute::SubscribeSent { packet_id } => {
                self.tracker.lock().await.on_sent(packet_id);
                true
            }
            EventRoute::SubscriptionResult { packet_id, result } => {
                let topic = self.tracker.lock().await.on_ack(packet_id);
                match topic {
                    Some(topic) => self
                        .events
                        .emit(TransportEvent::SubscribeAck { topic, result }),
                    None => {
                        warn!(packet_id, "SUBACK for unknown packet id");
                        true
                    }
                }
            }
            EventRoute::Infrastructure => true,
        }
    }

    /// Report the failure, wait one reconnect period, then let the next
    /// poll reconnect. Returns false on shutdown.
    async fn handle_connection_error(&mut self, error: String) -> bool {
        self.tracker.lock().await.reset();

        if !self.events.emit(TransportEvent::Error(error)) {
            return false;
        }
        if !self.events.emit(TransportEvent::Closed) {
            return false;
        }

        if !self.interruptible_sleep().await {
            return false;
        }
        self.events.emit(TransportEvent::Reconnecting)
    }

    /// Returns false if shutdown was requested while sleeping
    async fn interruptible_sleep(&mut self) -> bool {
        tokio::select! {
            _ = self.shutdown_rx.changed() => !*self.shutdown_rx.borrow(),
            _ = tokio::time::sleep(self.reconnect_period) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_tracker_maps_in_order() {
        let mut tracker = SubscribeTracker::default();
        tracker.queued.push_back("a".to_string());
        tracker.queued.push_back("b".to_string());

        tracker.on_sent(1);
        tracker.on_sent(2);

        assert_eq!(tracker.on_ack(2).as_deref(), Some("b"));
        assert_eq!(tracker.on_ack(1).as_deref(), Some("a"));
        assert_eq!(tracker.on_ack(1), None);
    }

    #[test]
    fn test_subscribe_tracker_reset() {
        let mut tracker = SubscribeTracker::default();
        tracker.queued.push_back("a".to_string());
        tracker.on_sent(1);
        tracker.queued.push_back("b".to_string());

        tracker.reset();
        tracker.on_sent(2);
        assert_eq!(tracker.on_ack(1), None);
        assert_eq!(tracker.on_ack(2), None);
    }

    #[test]
    fn test_open_requires_runtime() {
        let settings = crate::config::BrokerSettings::new("localhost", 1883);
        let config = BrokerConfig::from_settings(&settings).unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let result = RumqttcConnector::new().open(&config, EventSender::new(1, tx));
        assert!(matches!(result, Err(TransportError::OpenFailed(_))));
    }

    #[tokio::test]
    async fn test_requests_fail_fast_while_broker_unreachable() {
        let mut settings = crate::config::BrokerSettings::new("127.0.0.1", 1);
        settings.reconnect_period_ms = 60_000;
        let config = BrokerConfig::from_settings(&settings).unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let transport = RumqttcConnector::new()
            .open(&config, EventSender::new(1, tx))
            .unwrap();
        let message = QueuedMessage {
            topic: "q".to_string(),
            payload: bytes::Bytes::from_static(b"x"),
            qos: QoS::AtLeastOnce,
            retain: false,
        };

        let rejected = tokio::time::timeout(Duration::from_secs(5), async {
            for _ in 0..(REQUEST_CHANNEL_CAPACITY * 2) {
                if transport.publish(&message).await.is_err() {
                    return true;
                }
            }
            false
        })
        .await
        .expect("publish must never wait for channel space");

        assert!(rejected, "a full request channel is reported as an error");
        transport.end().await;
    }

    #[tokio::test]
    async fn test_unreachable_broker_reports_error_then_closed() {
        // Port 1 on localhost refuses connections immediately
        let mut settings = crate::config::BrokerSettings::new("127.0.0.1", 1);
        settings.reconnect_period_ms = 10;
        let config = BrokerConfig::from_settings(&settings).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let transport = RumqttcConnector::new()
            .open(&config, EventSender::new(3, tx))
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.session, 3);
        assert!(matches!(first.event, TransportEvent::Error(_)));

        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.event, TransportEvent::Closed);

        transport.end().await;
    }
}
