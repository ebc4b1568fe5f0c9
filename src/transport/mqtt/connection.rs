//! Pure connection state management for the device session
//!
//! This module contains the connection state enum, the backoff policy,
//! broker option construction and topic naming.

use crate::auth::AuthToken;
use rumqttc::{MqttOptions, Transport as RumqttcTransport};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Default TLS port for the MQTT bridge
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// The broker ignores the username, but MQTT requires one alongside a password
pub const UNUSED_USERNAME: &str = "unused";

/// Connection state, owned by the connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Initial state - no session
    Disconnected,
    /// Session opened, waiting for the broker to accept the token
    Connecting,
    /// Authenticated and ready for publishing
    Connected,
    /// Transport failed, waiting out the backoff delay
    AwaitingBackoff,
    /// No further automatic retries
    Terminated,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Terminated)
    }

    pub fn can_publish(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::AwaitingBackoff => "awaiting_backoff",
            ConnectionState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Exponential reconnection backoff.
///
/// `current` never drops below `min` and is reset to `min` after every
/// successful connection. Once `current` exceeds `max` the policy is exhausted.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    current: Duration,
    min: Duration,
    max: Duration,
    attempt: u32,
}

impl BackoffPolicy {
    pub fn new(min: Duration, max: Duration) -> Self {
        let min = min.max(Duration::from_millis(1));
        Self {
            current: min,
            min,
            max: max.max(min),
            attempt: 0,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Number of backoff waits since the last successful connection
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.current > self.max
    }

    /// Delay to wait before the next reconnect, or `None` when giving up.
    ///
    /// The returned delay is `min(current + jitter, max)`; afterwards `current`
    /// doubles.
    pub fn next_delay(&mut self, jitter: Duration) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let delay = self.current.saturating_add(jitter).min(self.max);
        self.current = self.current.saturating_mul(2);
        self.attempt += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.current = self.min;
        self.attempt = 0;
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Broker rejected credentials: {0}")]
    AuthenticationRejected(String),
    #[error("No connection acknowledgement within {0:?}")]
    ConnAckTimeout(Duration),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Failed to read CA certificates from {path}")]
    CaCertificate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Not connected")]
    NotConnected,
}

/// Broker endpoint and TLS trust settings
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub ca_certs: PathBuf,
    pub keep_alive: Duration,
}

impl BrokerSettings {
    /// Parse an `mqtts://host[:port]` URL. Plain `mqtt://` is refused.
    pub fn parse(
        broker_url: &str,
        ca_certs: impl Into<PathBuf>,
        keep_alive_secs: u64,
    ) -> Result<Self, MqttError> {
        let url =
            Url::parse(broker_url).map_err(|_| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;

        if url.scheme() != "mqtts" {
            return Err(MqttError::InvalidBrokerUrl(format!(
                "{broker_url} (TLS is required, use mqtts://)"
            )));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;

        Ok(Self {
            host: host.to_string(),
            port: url.port().unwrap_or(DEFAULT_TLS_PORT),
            ca_certs: ca_certs.into(),
            keep_alive: Duration::from_secs(keep_alive_secs),
        })
    }
}

/// Build MQTT options for one session (pure function).
///
/// Every session gets a fresh token as password; the username is unused.
pub fn configure_mqtt_options(
    client_id: &str,
    settings: &BrokerSettings,
    ca: &[u8],
    token: &AuthToken,
) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(client_id, settings.host.clone(), settings.port);
    mqtt_options.set_credentials(UNUSED_USERNAME, token.as_password());
    mqtt_options.set_keep_alive(settings.keep_alive);
    mqtt_options.set_clean_session(true);

    // rustls negotiates TLS 1.2 or newer only
    mqtt_options.set_transport(RumqttcTransport::tls(ca.to_vec(), None, None));

    mqtt_options
}

/// Per-device channel names
#[derive(Debug, Clone, PartialEq)]
pub struct TopicBuilder {
    device_id: String,
    events_sub_topic: String,
}

impl TopicBuilder {
    pub fn new(device_id: impl Into<String>, events_sub_topic: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            events_sub_topic: events_sub_topic.into(),
        }
    }

    /// Telemetry channel: `/devices/{id}/{events_sub_topic}`
    pub fn events(&self) -> String {
        format!("/devices/{}/{}", self.device_id, self.events_sub_topic)
    }

    /// State report channel: `/devices/{id}/state`
    pub fn state(&self) -> String {
        format!("/devices/{}/state", self.device_id)
    }

    /// Control delta channel: `/devices/{id}/config`
    pub fn config(&self) -> String {
        format!("/devices/{}/config", self.device_id)
    }

    /// Command subscription filter: `/devices/{id}/commands/#`
    pub fn commands_filter(&self) -> String {
        format!("{}#", self.commands_prefix())
    }

    /// Prefix shared by all command topics
    pub fn commands_prefix(&self) -> String {
        format!("/devices/{}/commands/", self.device_id)
    }
}
