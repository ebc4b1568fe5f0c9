//! Impure I/O operations for the MQTT session
//!
//! Every `open` builds a brand new rumqttc client and event loop with a fresh
//! token as password. The old event loop is dropped, which closes its socket
//! and discards any in-flight state from the previous connection epoch.

use super::connection::{configure_mqtt_options, BrokerSettings, MqttError};
use super::message_handler::MessageHandler;
use crate::auth::AuthToken;
use crate::transport::{Publisher, Transport, TransportEvent};
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, Outgoing, QoS};
use std::time::Duration;
use tracing::{debug, info};

/// Request channel capacity between the client handle and the event loop
const REQUEST_CAPACITY: usize = 10;

/// Upper bound for flushing DISCONNECT on close
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Publish handle bound to one rumqttc session
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), MqttError> {
        self.client
            .publish(topic, qos, false, payload)
            .await
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), MqttError> {
        self.client
            .subscribe(topic, qos)
            .await
            .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))
    }
}

/// TLS MQTT transport for one device
pub struct MqttTransport {
    client_id: String,
    settings: BrokerSettings,
    ca: Vec<u8>,
    session: Option<(AsyncClient, EventLoop)>,
    acknowledged: bool,
}

impl MqttTransport {
    /// Reads the CA trust bundle once; a missing bundle is a startup error
    pub fn new(client_id: impl Into<String>, settings: BrokerSettings) -> Result<Self, MqttError> {
        let ca = std::fs::read(&settings.ca_certs).map_err(|source| MqttError::CaCertificate {
            path: settings.ca_certs.clone(),
            source,
        })?;

        let client_id = client_id.into();
        info!("Device client_id is '{}'", client_id);

        Ok(Self {
            client_id,
            settings,
            ca,
            session: None,
            acknowledged: false,
        })
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    fn map_connection_error(error: ConnectionError) -> MqttError {
        match error {
            ConnectionError::ConnectionRefused(code) => {
                MqttError::AuthenticationRejected(format!("{code:?}"))
            }
            other => MqttError::ConnectionFailed(other.to_string().into()),
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    type Publisher = MqttPublisher;

    async fn open(&mut self, token: &AuthToken) -> Result<Self::Publisher, MqttError> {
        self.close().await;

        let options = configure_mqtt_options(&self.client_id, &self.settings, &self.ca, token);
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        info!(
            host = %self.settings.host,
            port = self.settings.port,
            "Opening MQTT session"
        );

        self.session = Some((client.clone(), event_loop));
        self.acknowledged = false;
        Ok(MqttPublisher { client })
    }

    async fn poll(&mut self) -> Result<TransportEvent, MqttError> {
        let (_, event_loop) = self.session.as_mut().ok_or(MqttError::NotConnected)?;
        let event = match event_loop.poll().await {
            Ok(event) => event,
            Err(e) => {
                self.acknowledged = false;
                return Err(Self::map_connection_error(e));
            }
        };
        let mapped = MessageHandler::route_mqtt_event(&event);
        match mapped {
            TransportEvent::ConnAck => self.acknowledged = true,
            TransportEvent::Disconnected(_) => self.acknowledged = false,
            TransportEvent::Other(ref description) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", description);
            }
            _ => {}
        }
        Ok(mapped)
    }

    async fn close(&mut self) {
        let Some((client, mut event_loop)) = self.session.take() else {
            return;
        };

        // Only a session the broker accepted gets a DISCONNECT; polling an
        // unacknowledged loop would start a new connection attempt
        if std::mem::take(&mut self.acknowledged) {
            match client.try_disconnect() {
                Ok(()) => {
                    let flush = async {
                        loop {
                            match event_loop.poll().await {
                                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                                Ok(_) => continue,
                            }
                        }
                    };
                    if tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, flush).await.is_err() {
                        debug!(target: "mqtt_transport", "DISCONNECT flush timed out");
                    }
                }
                Err(e) => {
                    debug!(target: "mqtt_transport", "Disconnect request not queued: {}", e);
                }
            }
        }

        drop(event_loop);
        info!("MQTT session closed");
    }
}
