//! Publish request boundary
//!
//! Requests arrive from flow actions and the HTTP API with loosely typed
//! fields. They are parsed strictly here, once, into a [`QueuedMessage`].

use super::send_queue::QueuedMessage;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Publish request as received from callers
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PublishRequest {
    #[serde(default)]
    pub topic: String,
    /// Plain string, or any structured value serialized to JSON text
    #[serde(default)]
    pub message: Value,
    /// `0|1|2` as number or numeric string
    #[serde(default)]
    pub qos: Option<Value>,
    /// Boolean, `"true"|"false"|"1"|"0"` or `1|0`
    #[serde(default)]
    pub retain: Option<Value>,
}

impl PublishRequest {
    pub fn new(topic: impl Into<String>, message: impl Into<Value>) -> Self {
        Self {
            topic: topic.into(),
            message: message.into(),
            qos: None,
            retain: None,
        }
    }

    pub fn with_qos(mut self, qos: impl Into<Value>) -> Self {
        self.qos = Some(qos.into());
        self
    }

    pub fn with_retain(mut self, retain: impl Into<Value>) -> Self {
        self.retain = Some(retain.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("No topic provided")]
    MissingTopic,
    #[error("Invalid qos '{0}', expected 0, 1 or 2")]
    InvalidQos(String),
    #[error("Invalid retain flag '{0}'")]
    InvalidRetain(String),
    #[error("Failed to serialize payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Parse a qos value; absent or null means 0
pub fn parse_qos(value: Option<&Value>) -> Result<QoS, ValidationError> {
    let level = match value {
        None | Some(Value::Null) => return Ok(QoS::AtMostOnce),
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        Some(_) => None,
    };
    match level {
        Some(0) => Ok(QoS::AtMostOnce),
        Some(1) => Ok(QoS::AtLeastOnce),
        Some(2) => Ok(QoS::ExactlyOnce),
        _ => Err(ValidationError::InvalidQos(display_value(value))),
    }
}

/// Parse a retain flag; absent or null means false
pub fn parse_retain(value: Option<&Value>) -> Result<bool, ValidationError> {
    match value {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::Number(n)) => match n.as_u64() {
            Some(1) => Ok(true),
            Some(0) => Ok(false),
            _ => Err(ValidationError::InvalidRetain(n.to_string())),
        },
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" | "" => Ok(false),
            _ => Err(ValidationError::InvalidRetain(s.clone())),
        },
        Some(other) => Err(ValidationError::InvalidRetain(other.to_string())),
    }
}

/// Plain strings go out verbatim, anything else as JSON text
pub fn serialize_payload(message: &Value) -> Result<Bytes, ValidationError> {
    match message {
        Value::String(s) => Ok(Bytes::from(s.clone())),
        Value::Null => Ok(Bytes::new()),
        other => Ok(Bytes::from(serde_json::to_string(other)?)),
    }
}

fn display_value(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(v) => v.to_string(),
        None => String::new(),
    }
}

impl TryFrom<PublishRequest> for QueuedMessage {
    type Error = ValidationError;

    fn try_from(request: PublishRequest) -> Result<Self, Self::Error> {
        if request.topic.trim().is_empty() {
            return Err(ValidationError::MissingTopic);
        }
        Ok(QueuedMessage {
            qos: parse_qos(request.qos.as_ref())?,
            retain: parse_retain(request.retain.as_ref())?,
            payload: serialize_payload(&request.message)?,
            topic: request.topic,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_structured_payload_serialized() {
        let request = PublishRequest::new("x/y", json!({"a": 1}))
            .with_qos("2")
            .with_retain("true");
        let message = QueuedMessage::try_from(request).unwrap();

        assert_eq!(message.topic, "x/y");
        assert_eq!(message.payload, Bytes::from_static(b"{\"a\":1}"));
        assert_eq!(message.qos, QoS::ExactlyOnce);
        assert!(message.retain);
    }

    #[test]
    fn test_plain_string_payload_verbatim() {
        let message = QueuedMessage::try_from(PublishRequest::new("t", "on")).unwrap();
        assert_eq!(message.payload, Bytes::from_static(b"on"));
        assert_eq!(message.qos, QoS::AtMostOnce);
        assert!(!message.retain);
    }

    #[test]
    fn test_numbers_and_bools_serialized_as_json() {
        assert_eq!(serialize_payload(&json!(21.5)).unwrap(), Bytes::from("21.5"));
        assert_eq!(serialize_payload(&json!(true)).unwrap(), Bytes::from("true"));
        assert_eq!(serialize_payload(&json!([1, 2])).unwrap(), Bytes::from("[1,2]"));
        assert!(serialize_payload(&Value::Null).unwrap().is_empty());
    }

    #[test]
    fn test_missing_topic_rejected() {
        let result = QueuedMessage::try_from(PublishRequest::new("", "x"));
        assert!(matches!(result, Err(ValidationError::MissingTopic)));

        let result = QueuedMessage::try_from(PublishRequest::new("   ", "x"));
        assert!(matches!(result, Err(ValidationError::MissingTopic)));
    }

    #[test]
    fn test_qos_accepted_spellings() {
        assert_eq!(parse_qos(None).unwrap(), QoS::AtMostOnce);
        assert_eq!(parse_qos(Some(&Value::Null)).unwrap(), QoS::AtMostOnce);
        assert_eq!(parse_qos(Some(&json!(1))).unwrap(), QoS::AtLeastOnce);
        assert_eq!(parse_qos(Some(&json!("2"))).unwrap(), QoS::ExactlyOnce);
        assert_eq!(parse_qos(Some(&json!(" 0 "))).unwrap(), QoS::AtMostOnce);
    }

    #[test]
    fn test_qos_malformed_rejected() {
        for bad in [json!(3), json!(-1), json!("high"), json!(1.5), json!(true), json!([1])] {
            assert!(
                matches!(parse_qos(Some(&bad)), Err(ValidationError::InvalidQos(_))),
                "qos {bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_retain_accepted_spellings() {
        let truthy = [json!(true), json!("1"), json!("true"), json!("TRUE"), json!(1)];
        for value in truthy {
            assert!(parse_retain(Some(&value)).unwrap(), "{value} should be true");
        }
        let falsy = [json!(false), json!("0"), json!("false"), json!(0), Value::Null];
        for value in falsy {
            assert!(!parse_retain(Some(&value)).unwrap(), "{value} should be false");
        }
        assert!(!parse_retain(None).unwrap());
    }

    #[test]
    fn test_retain_malformed_rejected() {
        for bad in [json!("yes"), json!(2), json!({"x": 1})] {
            assert!(matches!(
                parse_retain(Some(&bad)),
                Err(ValidationError::InvalidRetain(_))
            ));
        }
    }

    #[test]
    fn test_request_deserializes_from_api_json() {
        let request: PublishRequest = serde_json::from_value(json!({
            "topic": "home/lamp",
            "message": {"state": "on"},
            "qos": 1,
            "retain": "1"
        }))
        .unwrap();
        let message = QueuedMessage::try_from(request).unwrap();
        assert_eq!(message.qos, QoS::AtLeastOnce);
        assert!(message.retain);
        assert_eq!(message.payload, Bytes::from("{\"state\":\"on\"}"));
    }

    proptest! {
        #[test]
        fn qos_numeric_strings_match_numbers(level in 0u64..10) {
            let from_number = parse_qos(Some(&json!(level))).ok();
            let from_string = parse_qos(Some(&json!(level.to_string()))).ok();
            prop_assert_eq!(from_number, from_string);
            prop_assert_eq!(from_number.is_some(), level <= 2);
        }
    }
}
