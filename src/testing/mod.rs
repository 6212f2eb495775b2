//! Testing utilities
//!
//! Mock connector/transport plus helpers to drive a [`ConnectionManager`]
//! deterministically without a broker.

pub mod mocks;

pub use mocks::*;

use crate::broker::ConnectionManager;
use crate::config::BrokerSettings;
use crate::transport::EventReceiver;
use std::sync::Arc;

/// Manager wired to a fresh [`MockConnector`]
pub fn mock_manager(
    settings: BrokerSettings,
) -> (Arc<ConnectionManager>, EventReceiver, MockConnector) {
    let connector = MockConnector::new();
    let (manager, events) = ConnectionManager::new(settings, Arc::new(connector.clone()));
    (manager, events, connector)
}

/// Hand every event already emitted to the manager, in order.
/// Returns how many were processed.
pub async fn pump_events(manager: &ConnectionManager, events: &mut EventReceiver) -> usize {
    let mut processed = 0;
    while let Ok(event) = events.try_recv() {
        manager.handle_event(event).await;
        processed += 1;
    }
    processed
}
