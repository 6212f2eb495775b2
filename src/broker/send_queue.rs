//! FIFO buffer of outbound messages awaiting a connection

use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use std::collections::VecDeque;
use thiserror::Error;
use tracing::warn;

/// Queue length at which a warning is logged, and every multiple of it after
const GROWTH_WARNING_STEP: usize = 1000;

/// A normalized publish waiting for the transport
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Send queue is empty")]
    Empty,
}

/// Strict FIFO of [`QueuedMessage`], unbounded
#[derive(Debug, Default)]
pub struct SendQueue {
    messages: VecDeque<QueuedMessage>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, message: QueuedMessage) {
        self.messages.push_back(message);
        let len = self.messages.len();
        if len % GROWTH_WARNING_STEP == 0 {
            warn!(queued = len, "Send queue keeps growing while the broker is unavailable");
        }
    }

    pub fn dequeue_oldest(&mut self) -> Result<QueuedMessage, QueueError> {
        self.messages.pop_front().ok_or(QueueError::Empty)
    }

    /// Put a message back at the head after a failed drain attempt
    pub fn requeue_front(&mut self, message: QueuedMessage) {
        self.messages.push_front(message);
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(topic: &str) -> QueuedMessage {
        QueuedMessage {
            topic: topic.to_string(),
            payload: Bytes::from_static(b"x"),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = SendQueue::new();
        queue.enqueue(message("1"));
        queue.enqueue(message("2"));
        queue.enqueue(message("3"));
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.dequeue_oldest().unwrap().topic, "1");
        assert_eq!(queue.dequeue_oldest().unwrap().topic, "2");
        assert_eq!(queue.dequeue_oldest().unwrap().topic, "3");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_dequeue_empty_fails() {
        let mut queue = SendQueue::new();
        assert_eq!(queue.dequeue_oldest(), Err(QueueError::Empty));
    }

    #[test]
    fn test_requeue_front_keeps_order() {
        let mut queue = SendQueue::new();
        queue.enqueue(message("1"));
        queue.enqueue(message("2"));

        let first = queue.dequeue_oldest().unwrap();
        queue.requeue_front(first);

        assert_eq!(queue.dequeue_oldest().unwrap().topic, "1");
        assert_eq!(queue.dequeue_oldest().unwrap().topic, "2");
    }
}
