//! Transport layer for broker sessions
//!
//! A [`Transport`] opens one authenticated session at a time and yields its
//! inbound events. Each successful `open` returns a [`Publisher`] bound to that
//! session (connection epoch); a publisher from a closed epoch fails instead of
//! silently writing into a newer one.

use crate::auth::AuthToken;
use rumqttc::QoS;

pub mod mqtt;

pub use mqtt::MqttError;

/// Session event as seen by the connection manager
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Broker accepted the credentials
    ConnAck,
    /// Message received on a subscribed topic
    Message {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
    },
    /// Broker closed the session
    Disconnected(String),
    /// Anything else (PingResp, SubAck, outgoing packets)
    Other(String),
}

/// Publish handle for one connection epoch
#[async_trait::async_trait]
pub trait Publisher: Clone + Send + Sync + 'static {
    /// Queue a message for delivery at the given QoS
    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), MqttError>;

    /// Subscribe the current session to a topic filter
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), MqttError>;
}

/// Session-oriented broker transport
#[async_trait::async_trait]
pub trait Transport: Send + 'static {
    type Publisher: Publisher;

    /// Open a fresh session authenticated with `token`, discarding any prior one
    async fn open(&mut self, token: &AuthToken) -> Result<Self::Publisher, MqttError>;

    /// Wait for the next event of the current session
    async fn poll(&mut self) -> Result<TransportEvent, MqttError>;

    /// Close the current session. Safe to call when nothing is open.
    async fn close(&mut self);
}
