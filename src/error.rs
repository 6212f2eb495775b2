//! Error taxonomy for broker operations
//!
//! Each layer owns its own error enum; [`BrokerError`] is what the public
//! Connection Manager operations return.

use crate::broker::publish::ValidationError;
use crate::broker::send_queue::QueueError;
use crate::broker::topics::Purpose;
use crate::config::ConfigError;
use crate::transport::TransportError;
use thiserror::Error;

/// Errors surfaced by Connection Manager operations
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Send queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Reference with purpose '{purpose}' on topic '{topic}' cannot be removed")]
    ProtectedReference { topic: String, purpose: Purpose },
}

impl BrokerError {
    /// Create protected reference error
    pub fn protected_reference<S: Into<String>>(topic: S, purpose: Purpose) -> Self {
        Self::ProtectedReference {
            topic: topic.into(),
            purpose,
        }
    }

    /// Short machine-readable category, used by the HTTP API
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::Configuration(_) => "configuration_error",
            BrokerError::Transport(_) => "transport_error",
            BrokerError::Validation(_) => "validation_error",
            BrokerError::Queue(_) => "queue_error",
            BrokerError::ProtectedReference { .. } => "protected_reference",
        }
    }
}

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;
