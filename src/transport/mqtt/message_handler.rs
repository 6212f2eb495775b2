//! Pure routing of rumqttc events
//!
//! The event pump calls [`MessageHandler::route_mqtt_event`] for every event
//! and acts on the returned [`EventRoute`].

use crate::transport::InboundMessage;
use rumqttc::v5::mqttbytes::v5::{Packet, SubscribeReasonCode};
use rumqttc::v5::Event;
use rumqttc::Outgoing;

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Broker accepted the connection
    ConnectionAcknowledged,
    /// Message received on a subscribed topic
    MessageReceived(InboundMessage),
    /// Broker sent DISCONNECT
    Disconnected,
    /// A SUBSCRIBE left the client with this packet id
    SubscribeSent { packet_id: u16 },
    /// Broker answered a SUBSCRIBE
    SubscriptionResult {
        packet_id: u16,
        result: Result<(), String>,
    },
    /// Anything else (PingResp, PubAck, ...)
    Infrastructure,
}

pub struct MessageHandler;

impl MessageHandler {
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => EventRoute::ConnectionAcknowledged,
            Event::Incoming(Packet::Publish(publish)) => {
                EventRoute::MessageReceived(InboundMessage {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                    qos: publish.qos,
                    retain: publish.retain,
                })
            }
            Event::Incoming(Packet::Disconnect(_)) => EventRoute::Disconnected,
            Event::Incoming(Packet::SubAck(suback)) => EventRoute::SubscriptionResult {
                packet_id: suback.pkid,
                result: Self::validate_subscription_success(&suback.return_codes),
            },
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                EventRoute::SubscribeSent { packet_id: *pkid }
            }
            _ => EventRoute::Infrastructure,
        }
    }

    /// A SUBACK for a single filter succeeds only if every code granted a qos
    pub fn validate_subscription_success(codes: &[SubscribeReasonCode]) -> Result<(), String> {
        if codes.is_empty() {
            return Err("Empty SUBACK".to_string());
        }
        match codes
            .iter()
            .find(|code| !matches!(code, SubscribeReasonCode::Success(_)))
        {
            Some(code) => Err(format!("Subscription refused: {code:?}")),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rumqttc::v5::mqttbytes::v5::{
        ConnAck, ConnectReturnCode, Disconnect, DisconnectReasonCode, Publish, SubAck,
    };
    use rumqttc::v5::mqttbytes::QoS;

    #[test]
    fn test_route_connack() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged
        );
    }

    #[test]
    fn test_route_disconnect() {
        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: DisconnectReasonCode::NormalDisconnection,
            properties: None,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&disconnect),
            EventRoute::Disconnected
        );
    }

    #[test]
    fn test_route_publish() {
        let publish = Event::Incoming(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: Bytes::from("home/kitchen/temp"),
            pkid: 1,
            payload: Bytes::from("21.5"),
            properties: None,
        }));

        match MessageHandler::route_mqtt_event(&publish) {
            EventRoute::MessageReceived(message) => {
                assert_eq!(message.topic, "home/kitchen/temp");
                assert_eq!(message.payload_str(), "21.5");
                assert_eq!(message.qos, QoS::AtLeastOnce);
                assert!(message.retain);
            }
            other => panic!("Expected MessageReceived route, got {other:?}"),
        }
    }

    #[test]
    fn test_route_suback() {
        let suback = Event::Incoming(Packet::SubAck(SubAck {
            pkid: 4,
            return_codes: vec![SubscribeReasonCode::Success(QoS::AtMostOnce)],
            properties: None,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&suback),
            EventRoute::SubscriptionResult {
                packet_id: 4,
                result: Ok(())
            }
        );
    }

    #[test]
    fn test_route_outgoing_subscribe() {
        let event = Event::Outgoing(Outgoing::Subscribe(9));
        assert_eq!(
            MessageHandler::route_mqtt_event(&event),
            EventRoute::SubscribeSent { packet_id: 9 }
        );
        let ping = Event::Outgoing(Outgoing::PingReq);
        assert_eq!(
            MessageHandler::route_mqtt_event(&ping),
            EventRoute::Infrastructure
        );
    }

    #[test]
    fn test_validate_subscription_success() {
        assert!(MessageHandler::validate_subscription_success(&[
            SubscribeReasonCode::Success(QoS::ExactlyOnce)
        ])
        .is_ok());
        assert!(MessageHandler::validate_subscription_success(&[
            SubscribeReasonCode::NotAuthorized
        ])
        .is_err());
        assert!(MessageHandler::validate_subscription_success(&[]).is_err());
    }
}
