//! Connection Manager
//!
//! Owns the single transport, the Topic Registry and the Send Queue. Every
//! public operation and every transport event runs under one async mutex, so
//! state, registry and queue are only ever mutated as a unit.
//!
//! Transport events arrive on the channel returned by
//! [`ConnectionManager::new`] and must be fed to [`ConnectionManager::run`]
//! (or to [`ConnectionManager::handle_event`] directly in tests).

use super::options::BrokerConfig;
use super::publish::{PublishRequest, ValidationError};
use super::send_queue::{QueuedMessage, SendQueue};
use super::state::{Availability, ConnectionState, ConnectionTracker, LinkEvent, Transition};
use super::topics::{CallerRef, Purpose, RemoveOutcome, TopicReference, TopicRegistry};
use crate::config::BrokerSettings;
use crate::error::{BrokerError, BrokerResult};
use crate::observability::metrics;
use crate::transport::{
    Connector, EventReceiver, EventSender, InboundMessage, SessionEvent, Transport,
    TransportError, TransportEvent,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

/// Buffered notifications per subscriber before the slowest one lags
const NOTIFICATION_CAPACITY: usize = 256;

/// Notifications fanned out to the host and any other observer
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    /// A message arrived on a subscribed topic
    Message(InboundMessage),
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// Broker availability changed in a way the user should hear about
    Availability(Availability),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishOutcome {
    /// Handed to the transport
    Sent,
    /// Waiting in the Send Queue for the next connect
    Queued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscribeOutcome {
    /// Wire subscribe issued
    Subscribed,
    /// Topic already subscribed or in flight; registry update only
    AlreadyActive,
    /// Not connected; the next connect subscribes it
    Deferred,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicStatus {
    pub name: String,
    pub registered: bool,
    pub pending: bool,
    pub references: Vec<TopicReference>,
}

/// Point-in-time view of the manager
#[derive(Debug, Clone, Serialize)]
pub struct BrokerStatus {
    pub state: ConnectionState,
    pub session: u64,
    pub queued: usize,
    pub connected_since: Option<DateTime<Utc>>,
    pub topics: Vec<TopicStatus>,
}

/// Run a transport request unless `disconnect()` asked to end the session.
/// A cancel raised before the request started counts too.
async fn interruptible<T>(
    cancel: &watch::Receiver<u64>,
    seen: u64,
    request: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    let mut cancel = cancel.clone();
    if *cancel.borrow_and_update() != seen {
        return Err(TransportError::SessionClosed);
    }
    tokio::select! {
        result = request => result,
        _ = cancel.changed() => Err(TransportError::SessionClosed),
    }
}

struct ManagerInner {
    tracker: ConnectionTracker,
    registry: TopicRegistry,
    queue: SendQueue,
    transport: Option<Box<dyn Transport>>,
    /// Id of the current transport; events from older ones are dropped
    session: u64,
    settings: BrokerSettings,
    connected_since: Option<DateTime<Utc>>,
    /// Disconnect generation raised outside the lock
    cancel: watch::Receiver<u64>,
    /// Generation last honoured by `disconnect_locked`
    cancel_seen: u64,
}

impl ManagerInner {
    fn new(settings: BrokerSettings, cancel: watch::Receiver<u64>) -> Self {
        Self {
            tracker: ConnectionTracker::new(),
            registry: TopicRegistry::new(),
            queue: SendQueue::new(),
            transport: None,
            session: 0,
            settings,
            connected_since: None,
            cancel,
            cancel_seen: 0,
        }
    }

    fn is_connected(&self) -> bool {
        self.tracker.state() == ConnectionState::Connected && self.transport.is_some()
    }

    /// Issue a wire subscribe and mark the topic in flight
    async fn wire_subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let Some(transport) = self.transport.as_ref() else {
            return Err(TransportError::NotConnected);
        };
        self.registry.mark_pending(topic);
        let result =
            interruptible(&self.cancel, self.cancel_seen, transport.subscribe(topic)).await;
        if result.is_err() {
            self.registry.clear_pending(topic);
        }
        result
    }

    /// A topic that never subscribed and has no other owner is dropped
    fn discard_failed_subscription(&mut self, topic: &str) {
        metrics().subscribe_failed();
        let Some(entry) = self.registry.get(topic) else {
            return;
        };
        if !entry.was_acknowledged() && entry.reference_count() <= 1 {
            self.registry.remove(topic);
            debug!(topic, "Removed topic that never subscribed");
        } else {
            self.registry.clear_pending(topic);
        }
    }

    /// Wire side of a reference removal
    async fn finish_removal(&mut self, topic: &str, outcome: RemoveOutcome) -> BrokerResult<()> {
        match outcome {
            RemoveOutcome::NotFound => {
                debug!(topic, "No matching reference to remove");
                Ok(())
            }
            RemoveOutcome::Remaining(remaining) => {
                debug!(topic, remaining, "Reference removed, topic still in use");
                Ok(())
            }
            RemoveOutcome::Emptied(entry) => {
                let wire_result = match self.transport.as_ref() {
                    Some(transport) if entry.is_active() && self.is_connected() => {
                        interruptible(&self.cancel, self.cancel_seen, transport.unsubscribe(topic))
                            .await
                    }
                    _ => Ok(()),
                };
                match wire_result {
                    Ok(()) => {
                        info!(topic, "Unsubscribed from topic");
                        Ok(())
                    }
                    Err(e) => {
                        error!(topic, error = %e, "Wire unsubscribe failed, topic forgotten anyway");
                        Err(e.into())
                    }
                }
            }
        }
    }

    /// Publish queued messages oldest first. A failed publish goes back to
    /// the head of the queue and stops the drain.
    async fn drain_queue(&mut self) {
        let Some(transport) = self.transport.as_ref() else {
            return;
        };
        let mut sent = 0usize;
        while let Ok(message) = self.queue.dequeue_oldest() {
            let result =
                interruptible(&self.cancel, self.cancel_seen, transport.publish(&message)).await;
            match result {
                Ok(()) => {
                    metrics().message_published();
                    debug!(topic = %message.topic, "Queued message sent");
                    sent += 1;
                }
                Err(e) => {
                    metrics().publish_failed();
                    warn!(
                        topic = %message.topic,
                        error = %e,
                        remaining = self.queue.len() + 1,
                        "Drain interrupted, keeping message at queue head"
                    );
                    self.queue.requeue_front(message);
                    break;
                }
            }
        }
        metrics().set_queue_depth(self.queue.len());
        if sent > 0 {
            info!(sent, "Send queue drained");
        }
    }
}

/// Single shared connection to the broker
pub struct ConnectionManager {
    inner: Mutex<ManagerInner>,
    connector: Arc<dyn Connector>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    notifications: broadcast::Sender<BrokerEvent>,
    /// Bumped by `disconnect()` before it waits for the lock, so transport
    /// calls in progress give up instead of holding it
    cancel: watch::Sender<u64>,
}

impl ConnectionManager {
    /// Create the manager and the receiver its transports report on
    pub fn new(
        settings: BrokerSettings,
        connector: Arc<dyn Connector>,
    ) -> (Arc<Self>, EventReceiver) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let (cancel, cancel_rx) = watch::channel(0u64);
        let manager = Arc::new(Self {
            inner: Mutex::new(ManagerInner::new(settings, cancel_rx)),
            connector,
            events_tx,
            notifications,
            cancel,
        });
        (manager, events_rx)
    }

    /// Process transport events for the lifetime of the process
    pub async fn run(self: Arc<Self>, mut events: EventReceiver) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        debug!("Transport event channel closed");
    }

    /// Observe inbound messages and connection changes
    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.notifications.subscribe()
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.tracker.state()
    }

    pub async fn settings(&self) -> BrokerSettings {
        self.inner.lock().await.settings.clone()
    }

    pub async fn status(&self) -> BrokerStatus {
        let inner = self.inner.lock().await;
        BrokerStatus {
            state: inner.tracker.state(),
            session: inner.session,
            queued: inner.queue.len(),
            connected_since: inner.connected_since,
            topics: inner
                .registry
                .iter_sorted()
                .into_iter()
                .map(|topic| TopicStatus {
                    name: topic.name().to_string(),
                    registered: topic.is_registered(),
                    pending: topic.is_pending(),
                    references: topic.sorted_references(),
                })
                .collect(),
        }
    }

    /// Start connecting unless a connection exists or is being established.
    /// Failures are logged, never returned.
    pub async fn connect(&self) {
        let mut guard = self.inner.lock().await;
        self.connect_locked(&mut guard);
    }

    fn connect_locked(&self, inner: &mut ManagerInner) {
        if inner.transport.is_some() || inner.tracker.is_connecting_or_connected() {
            debug!(state = %inner.tracker.state(), "Connect ignored, connection already active");
            return;
        }

        let config = match BrokerConfig::from_settings(&inner.settings) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "Cannot connect, broker settings are invalid");
                return;
            }
        };

        inner.session += 1;
        let span = crate::broker_span!(
            operation = "connect",
            session = inner.session,
            broker = %config.broker_url()
        );
        let _enter = span.enter();

        metrics().connection_attempt();
        let transition = inner.tracker.apply(LinkEvent::Opening);
        self.report_transition(&transition);
        info!(client_id = %config.client_id, "Connecting to broker");

        let events = EventSender::new(inner.session, self.events_tx.clone());
        match self.connector.open(&config, events) {
            Ok(transport) => inner.transport = Some(transport),
            Err(e) => {
                error!(error = %e, "Failed to open transport");
                metrics().connection_failed();
                let transition = inner.tracker.apply(LinkEvent::OpenFailed);
                self.report_transition(&transition);
            }
        }
    }

    /// End the transport and forget the session. Safe from any state, and
    /// does not wait behind a stalled transport call.
    pub async fn disconnect(&self) {
        self.cancel.send_modify(|generation| *generation = generation.wrapping_add(1));
        let mut guard = self.inner.lock().await;
        self.disconnect_locked(&mut guard).await;
    }

    async fn disconnect_locked(&self, inner: &mut ManagerInner) {
        inner.cancel_seen = *inner.cancel.borrow();
        if let Some(transport) = inner.transport.take() {
            transport.end().await;
            info!(session = inner.session, "Broker connection ended");
            inner.session += 1;
            metrics().connection_lost();
        }
        inner.registry.reset_wire_state();
        inner.connected_since = None;
        let transition = inner.tracker.apply(LinkEvent::Disconnect);
        self.report_transition(&transition);
    }

    /// Validate and publish a request from the API or a flow action
    pub async fn publish_request(&self, request: PublishRequest) -> BrokerResult<PublishOutcome> {
        let message = QueuedMessage::try_from(request).map_err(|e| {
            error!(error = %e, "Rejected publish request");
            e
        })?;
        self.publish(message).await
    }

    /// Publish now if connected, otherwise queue and trigger a connect.
    /// Messages never overtake the queue.
    pub async fn publish(&self, message: QueuedMessage) -> BrokerResult<PublishOutcome> {
        if message.topic.is_empty() {
            error!("Publish without topic rejected");
            return Err(ValidationError::MissingTopic.into());
        }

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        if inner.tracker.state() == ConnectionState::Connected && inner.queue.is_empty() {
            if let Some(transport) = inner.transport.as_ref() {
                let result =
                    interruptible(&inner.cancel, inner.cancel_seen, transport.publish(&message))
                        .await;
                return match result {
                    Ok(()) => {
                        metrics().message_published();
                        debug!(
                            topic = %message.topic,
                            qos = ?message.qos,
                            retain = message.retain,
                            bytes = message.payload.len(),
                            "Message published"
                        );
                        Ok(PublishOutcome::Sent)
                    }
                    Err(e) => {
                        metrics().publish_failed();
                        error!(topic = %message.topic, error = %e, "Publish failed");
                        Err(e.into())
                    }
                };
            }
        }

        if inner.tracker.state() == ConnectionState::Connecting {
            info!(topic = %message.topic, "Broker not available yet, queueing message");
        } else {
            info!(topic = %message.topic, "Broker not connected, queueing message");
        }
        inner.queue.enqueue(message);
        metrics().message_queued();
        metrics().set_queue_depth(inner.queue.len());
        self.connect_locked(inner);
        Ok(PublishOutcome::Queued)
    }

    /// Add a reference to `topic`, subscribing on the wire when this is the
    /// first interest in it.
    pub async fn subscribe(
        &self,
        topic: &str,
        purpose: Purpose,
        caller: impl Into<CallerRef>,
    ) -> BrokerResult<SubscribeOutcome> {
        if topic.is_empty() {
            return Err(ValidationError::MissingTopic.into());
        }
        let reference = TopicReference::new(purpose, caller);

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let added = inner.registry.add_reference(topic, reference);
        let active = inner.registry.get(topic).is_some_and(|t| t.is_active());
        if active {
            info!(topic, %purpose, added, "Already subscribed to topic");
            return Ok(SubscribeOutcome::AlreadyActive);
        }

        if !inner.is_connected() {
            debug!(topic, %purpose, "Subscription deferred until connected");
            self.connect_locked(inner);
            return Ok(SubscribeOutcome::Deferred);
        }

        match inner.wire_subscribe(topic).await {
            Ok(()) => {
                info!(topic, %purpose, "Subscribing to topic");
                Ok(SubscribeOutcome::Subscribed)
            }
            Err(e) => {
                error!(topic, error = %e, "Failed to subscribe to topic");
                inner.discard_failed_subscription(topic);
                Err(e.into())
            }
        }
    }

    /// Remove one `{purpose, caller}` reference. Protected purposes are
    /// refused without touching anything.
    pub async fn unsubscribe(
        &self,
        topic: &str,
        purpose: Purpose,
        caller: impl Into<CallerRef>,
    ) -> BrokerResult<()> {
        if purpose.is_protected() {
            warn!(topic, %purpose, "Refusing to remove protected reference");
            return Err(BrokerError::protected_reference(topic, purpose));
        }
        let reference = TopicReference::new(purpose, caller);

        let mut guard = self.inner.lock().await;
        let outcome = guard.registry.remove_reference(topic, &reference);
        guard.finish_removal(topic, outcome).await
    }

    /// Remove every reference `caller` holds on `topic`, refusing if any of
    /// them is protected
    pub async fn unsubscribe_reference(
        &self,
        topic: &str,
        caller: impl Into<CallerRef>,
    ) -> BrokerResult<()> {
        let caller = caller.into();
        let mut guard = self.inner.lock().await;

        if let Some(protected) = guard
            .registry
            .references_of(topic, &caller)
            .into_iter()
            .find(|r| r.purpose.is_protected())
        {
            warn!(topic, %caller, purpose = %protected.purpose, "Refusing to remove protected reference");
            return Err(BrokerError::protected_reference(topic, protected.purpose));
        }

        let outcome = guard.registry.remove_caller(topic, &caller);
        guard.finish_removal(topic, outcome).await
    }

    /// Drop everything `caller` holds, protected or not. Each distinct topic
    /// is processed once. Returns the number of topics touched.
    pub async fn unsubscribe_all_for_reference(&self, caller: impl Into<CallerRef>) -> usize {
        let caller = caller.into();
        let mut guard = self.inner.lock().await;

        let topics = guard.registry.topics_for_caller(&caller);
        for topic in &topics {
            let outcome = guard.registry.remove_caller(topic, &caller);
            if let Err(e) = guard.finish_removal(topic, outcome).await {
                warn!(topic = %topic, %caller, error = %e, "Cleanup continued after failure");
            }
        }
        info!(%caller, topics = topics.len(), "Removed all references of caller");
        topics.len()
    }

    /// Settings-change hook: unsubscribe every topic once, end the
    /// transport, then connect with the new settings. References are kept
    /// and resubscribed on the next connect.
    pub async fn apply_settings(&self, settings: BrokerSettings) -> BrokerResult<()> {
        BrokerConfig::from_settings(&settings)?;

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        if inner.is_connected() {
            if let Some(transport) = inner.transport.as_ref() {
                for topic in inner.registry.all_topic_names() {
                    let result = interruptible(
                        &inner.cancel,
                        inner.cancel_seen,
                        transport.unsubscribe(&topic),
                    )
                    .await;
                    if let Err(e) = result {
                        warn!(topic = %topic, error = %e, "Unsubscribe before settings change failed");
                    }
                }
            }
        }

        self.disconnect_locked(inner).await;
        inner.settings = settings;
        info!("Broker settings changed, reconnecting");
        self.connect_locked(inner);
        Ok(())
    }

    /// React to one transport event
    pub async fn handle_event(&self, event: SessionEvent) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        if event.session != inner.session {
            debug!(
                session = event.session,
                current = inner.session,
                "Ignoring event from ended session"
            );
            return;
        }

        match event.event {
            TransportEvent::Connected => self.on_connected(inner).await,
            TransportEvent::Reconnecting => {
                metrics().reconnect();
                info!("Reconnecting to broker");
                let transition = inner.tracker.apply(LinkEvent::Reconnecting);
                self.report_transition(&transition);
            }
            TransportEvent::Closed => self.on_link_down(inner, LinkEvent::Closed),
            TransportEvent::Offline => self.on_link_down(inner, LinkEvent::Offline),
            TransportEvent::Error(reason) => {
                let transition = inner.tracker.apply(LinkEvent::Error);
                if transition.repeated_error {
                    info!(error = %reason, state = %transition.to, "Broker still unreachable");
                } else {
                    error!(error = %reason, "Broker connection error");
                    metrics().connection_failed();
                }
                self.report_transition(&transition);
            }
            TransportEvent::Message(message) => {
                metrics().message_received();
                debug!(
                    topic = %message.topic,
                    bytes = message.payload.len(),
                    retain = message.retain,
                    "Message received"
                );
                let _ = self.notifications.send(BrokerEvent::Message(message));
            }
            TransportEvent::SubscribeAck {
                topic,
                result: Ok(()),
            } => {
                if inner.registry.mark_registered(&topic) {
                    info!(topic = %topic, "Subscribed to topic");
                } else {
                    debug!(topic = %topic, "Subscription acknowledged for forgotten topic");
                }
            }
            TransportEvent::SubscribeAck {
                topic,
                result: Err(reason),
            } => {
                error!(topic = %topic, reason = %reason, "Broker refused subscription");
                inner.discard_failed_subscription(&topic);
            }
        }
    }

    /// Resubscribe every known topic once, then drain the queue, all before
    /// the lock is released
    async fn on_connected(&self, inner: &mut ManagerInner) {
        let transition = inner.tracker.apply(LinkEvent::Connected);
        inner.connected_since = Some(Utc::now());
        metrics().connection_established();
        info!("Connected to broker");
        self.report_transition(&transition);

        inner.registry.reset_wire_state();
        for topic in inner.registry.all_topic_names() {
            if let Err(e) = inner.wire_subscribe(&topic).await {
                metrics().subscribe_failed();
                warn!(topic = %topic, error = %e, "Resubscribe failed, retrying on next connect");
            }
        }

        inner.drain_queue().await;
    }

    fn on_link_down(&self, inner: &mut ManagerInner, event: LinkEvent) {
        let transition = inner.tracker.apply(event);
        inner.registry.reset_wire_state();
        inner.connected_since = None;
        metrics().connection_lost();
        info!(event = ?event, "Broker link down");
        self.report_transition(&transition);
    }

    fn report_transition(&self, transition: &Transition) {
        if transition.changed() {
            debug!(from = %transition.from, to = %transition.to, "Connection state changed");
            metrics().set_connection_state(transition.to.as_str());
            let _ = self.notifications.send(BrokerEvent::StateChanged {
                from: transition.from,
                to: transition.to,
            });
        }
        if let Some(availability) = transition.availability {
            match availability {
                Availability::Online => warn!("Broker is online again"),
                Availability::Offline => warn!("Broker went offline"),
            }
            let _ = self
                .notifications
                .send(BrokerEvent::Availability(availability));
        }
    }
}
