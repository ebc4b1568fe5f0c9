//! Edge telemetry client
//!
//! Publishes device measurements to an MQTT broker over TLS, authenticating
//! with short-lived JWTs signed by the device key.
//!
//! # Overview
//!
//! - [`auth`]: device identity and JWT issuance (RS256 / ES256)
//! - [`state`]: device control flags updated by broker config deltas
//! - [`manager`]: connection state machine with jittered exponential backoff
//!   and token rotation
//! - [`publisher`]: the publish loop and payload formatting
//! - [`transport`]: the session abstraction and its rumqttc implementation
//!
//! # Quick Start
//!
//! ```rust
//! use edge_telemetry::publisher::{format_payload, PayloadOptions};
//! use edge_telemetry::source::Measurement;
//! use edge_telemetry::state::ConfigStateStore;
//!
//! let store = ConfigStateStore::default();
//! assert!(store.is_enabled());
//! store.apply_or_discard(br#"{"enabled": false}"#);
//! assert!(!store.is_enabled());
//!
//! let options = PayloadOptions {
//!     use_input_timestamp: true,
//!     ..PayloadOptions::default()
//! };
//! let payload = format_payload(
//!     &Measurement::new("2021-01-01 10:00:00", 21.5),
//!     &options,
//!     chrono::Utc::now(),
//! )
//! .unwrap();
//! assert_eq!(payload.timestamp, "2021-01-01T10:00:00");
//! ```

pub mod auth;
pub mod commands;
pub mod config;
pub mod error;
pub mod manager;
pub mod observability;
pub mod publisher;
pub mod source;
pub mod state;
pub mod testing;
pub mod transport;

pub use auth::{AuthToken, CredentialError, CredentialIssuer, DeviceIdentity, SigningAlgorithm};
pub use config::{ConfigError, TelemetryConfig};
pub use error::{TelemetryError, TelemetryResult};
pub use manager::{ConnectionError, ConnectionHandle, ConnectionManager, ConnectionSettings};
pub use publisher::{LoopOutcome, PublishLoop};
pub use state::{ConfigStateStore, DeviceState};
pub use transport::mqtt::{ConnectionState, MqttTransport};
