//! Pure event mapping and inbound routing
//!
//! Raw rumqttc events become [`TransportEvent`]s, and inbound publishes are
//! routed by topic to the config store or the command handler.

use super::connection::TopicBuilder;
use crate::transport::TransportEvent;
use rumqttc::{ConnectReturnCode, Event, Packet, QoS};
use tracing::debug;

/// Pure routing decisions for MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Map a rumqttc event to a transport event (pure function)
    pub fn route_mqtt_event(event: &Event) -> TransportEvent {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(ack) if ack.code == ConnectReturnCode::Success => {
                    TransportEvent::ConnAck
                }
                Packet::ConnAck(ack) => {
                    TransportEvent::Disconnected(format!("connection refused: {:?}", ack.code))
                }
                Packet::Publish(publish) => TransportEvent::Message {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                    qos: publish.qos,
                },
                Packet::Disconnect => {
                    TransportEvent::Disconnected("broker sent DISCONNECT".to_string())
                }
                other => TransportEvent::Other(format!("{other:?}")),
            },
            Event::Outgoing(outgoing) => TransportEvent::Other(format!("{outgoing:?}")),
        }
    }

    /// Decide where an inbound message goes (pure function)
    pub fn route_inbound(topic: &str, topics: &TopicBuilder) -> InboundRoute {
        if topic == topics.config() {
            return InboundRoute::Config;
        }

        let prefix = topics.commands_prefix();
        if let Some(subfolder) = topic.strip_prefix(&prefix) {
            let subfolder = (!subfolder.is_empty()).then(|| subfolder.to_string());
            return InboundRoute::Command { subfolder };
        }
        // Commands without a subfolder arrive on `/devices/{id}/commands`
        if topic == prefix.trim_end_matches('/') {
            return InboundRoute::Command { subfolder: None };
        }

        debug!("No route for inbound topic: {}", topic);
        InboundRoute::Unrouted
    }

    /// Subscriptions for a new session: config at QoS 1, commands at QoS 0
    pub fn build_subscriptions(topics: &TopicBuilder) -> Vec<(String, QoS)> {
        vec![
            (topics.config(), QoS::AtLeastOnce),
            (topics.commands_filter(), QoS::AtMostOnce),
        ]
    }
}

/// Destination of an inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum InboundRoute {
    /// Control delta for the config store
    Config,
    /// Opaque command, with the subfolder after `commands/` if any
    Command { subfolder: Option<String> },
    /// Not a topic this device handles
    Unrouted,
}
