//! Mock transport for testing
//!
//! [`MockConnector`] hands out [`MockTransport`]s that record every wire call
//! instead of talking to a broker. Tests drive the link by emitting
//! [`TransportEvent`]s through the connector.

use crate::broker::{BrokerConfig, QueuedMessage};
use crate::transport::{Connector, EventSender, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};

/// A call that reached the mock wire
#[derive(Debug, Clone, PartialEq)]
pub enum WireCall {
    Subscribe(String),
    Unsubscribe(String),
    Publish(QueuedMessage),
    End,
}

#[derive(Debug, Default)]
struct MockState {
    opened: Vec<BrokerConfig>,
    sender: Option<EventSender>,
    calls: Vec<WireCall>,
    fail_open: bool,
    fail_subscribe: bool,
    fail_unsubscribe: bool,
    fail_publish: bool,
}

/// Mock connector; clones share state
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.lock().fail_open = fail;
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.lock().fail_subscribe = fail;
    }

    pub fn set_fail_unsubscribe(&self, fail: bool) {
        self.lock().fail_unsubscribe = fail;
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.lock().fail_publish = fail;
    }

    /// Number of transports opened so far
    pub fn open_count(&self) -> usize {
        self.lock().opened.len()
    }

    pub fn opened_configs(&self) -> Vec<BrokerConfig> {
        self.lock().opened.clone()
    }

    /// Session of the most recently opened transport
    pub fn current_session(&self) -> Option<u64> {
        self.lock().sender.as_ref().map(EventSender::session)
    }

    /// Emit an event as the most recently opened transport
    pub fn emit(&self, event: TransportEvent) -> bool {
        let sender = self.lock().sender.clone();
        sender.is_some_and(|s| s.emit(event))
    }

    pub fn calls(&self) -> Vec<WireCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn subscribes(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                WireCall::Subscribe(topic) => Some(topic),
                _ => None,
            })
            .collect()
    }

    pub fn unsubscribes(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                WireCall::Unsubscribe(topic) => Some(topic),
                _ => None,
            })
            .collect()
    }

    pub fn published(&self) -> Vec<QueuedMessage> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                WireCall::Publish(message) => Some(message),
                _ => None,
            })
            .collect()
    }
}

impl Connector for MockConnector {
    fn open(
        &self,
        config: &BrokerConfig,
        events: EventSender,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let mut state = self.lock();
        if state.fail_open {
            return Err(TransportError::OpenFailed("mock open failure".to_string()));
        }
        state.opened.push(config.clone());
        state.sender = Some(events);
        Ok(Box::new(MockTransport {
            state: self.state.clone(),
        }))
    }
}

/// Transport handed out by [`MockConnector`]; successful calls are recorded
#[derive(Debug)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    fn record(&self, call: WireCall, fail: impl Fn(&MockState) -> bool) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if fail(&state) {
            let (operation, topic) = match &call {
                WireCall::Subscribe(t) => ("subscribe", t.clone()),
                WireCall::Unsubscribe(t) => ("unsubscribe", t.clone()),
                WireCall::Publish(m) => ("publish", m.topic.clone()),
                WireCall::End => ("end", String::new()),
            };
            return Err(TransportError::request_failed(operation, topic, "mock failure"));
        }
        state.calls.push(call);
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.record(WireCall::Subscribe(topic.to_string()), |s| s.fail_subscribe)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.record(WireCall::Unsubscribe(topic.to_string()), |s| {
            s.fail_unsubscribe
        })
    }

    async fn publish(&self, message: &QueuedMessage) -> Result<(), TransportError> {
        self.record(WireCall::Publish(message.clone()), |s| s.fail_publish)
    }

    async fn end(&self) {
        let _ = self.record(WireCall::End, |_| false);
    }
}
