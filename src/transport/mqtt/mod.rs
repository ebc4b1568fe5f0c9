//! rumqttc-backed device session
//!
//! The module is split into focused sub-modules:
//!
//! - [`connection`] - Pure connection state, backoff policy, options and topics
//! - [`message_handler`] - Pure event mapping and inbound topic routing
//! - [`health_monitor`] - Pure state-machine transitions and reconnection decisions
//! - [`client`] - Impure I/O against the broker
//!
//! # Usage
//!
//! ```rust,no_run
//! use edge_telemetry::transport::mqtt::{BrokerSettings, MqttTransport};
//! use edge_telemetry::transport::Transport;
//! # use edge_telemetry::auth::{CredentialIssuer, DeviceIdentity, SigningAlgorithm};
//!
//! # tokio_test::block_on(async {
//! # let identity = DeviceIdentity {
//! #     project_id: "my-project".into(), location: "europe-west1".into(),
//! #     registry_id: "sensors".into(), device_id: "pump-7".into(),
//! #     private_key_file: "rsa_private.pem".into(), algorithm: SigningAlgorithm::Rs256,
//! # };
//! let settings = BrokerSettings::parse("mqtts://mqtt.googleapis.com:8883", "roots.pem", 60)?;
//! let mut transport = MqttTransport::new(identity.client_id(), settings)?;
//! let issuer = CredentialIssuer::new(identity, std::time::Duration::from_secs(1200))?;
//! let publisher = transport.open(&issuer.issue(chrono::Utc::now())?).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

// Re-export public types for convenience
pub use client::{MqttPublisher, MqttTransport};
pub use connection::{
    configure_mqtt_options, BackoffPolicy, BrokerSettings, ConnectionState, MqttError,
    TopicBuilder,
};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{InboundRoute, MessageHandler};
