//! Configuration for the telemetry client
//!
//! A single TOML file, validated on load. Invalid values (including strftime
//! strings chrono cannot render) are configuration errors reported at
//! startup, never runtime panics.

use crate::auth::{DeviceIdentity, SigningAlgorithm};
use crate::manager::ConnectionSettings;
use crate::publisher::payload::{
    validate_format, PayloadOptions, DEFAULT_INPUT_TS_FORMAT, DEFAULT_OUTPUT_TS_FORMAT,
};
use crate::transport::mqtt::{BrokerSettings, TopicBuilder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Searched in order when no `--config` is given
pub const DEFAULT_CONFIG_PATHS: &[&str] = &["telemetry.toml", "config/telemetry.toml"];

/// rumqttc refuses keep-alive intervals below 5 seconds
const MIN_KEEP_ALIVE_SECS: u64 = 5;

/// The CONNECT packet carries keep-alive as 16-bit seconds
const MAX_KEEP_ALIVE_SECS: u64 = u16::MAX as u64;

/// Brokers reject device JWTs valid for more than a day
pub const MAX_TOKEN_VALIDITY_MINS: u64 = 24 * 60;

const MAX_CONNECT_TIMEOUT_SECS: u64 = 3600;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryConfig {
    pub device: DeviceSection,
    pub broker: BrokerSection,
    #[serde(default)]
    pub backoff: BackoffSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
    pub source: SourceSection,
}

/// Device coordinates and key material
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    pub project_id: String,
    pub location: String,
    pub registry_id: String,
    pub device_id: String,
    pub private_key_file: PathBuf,
    #[serde(default = "default_algorithm")]
    pub algorithm: SigningAlgorithm,
    /// CA trust bundle for the broker's TLS certificate
    pub ca_certs: PathBuf,
}

fn default_algorithm() -> SigningAlgorithm {
    SigningAlgorithm::Rs256
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// `mqtts://host[:port]`, port defaults to 8883
    pub url: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// How long a new session may take to be acknowledged
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffSection {
    pub min_secs: u64,
    pub max_secs: u64,
    /// Jitter is drawn from `[0, jitter_ms)`
    pub jitter_ms: u64,
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            min_secs: 1,
            max_secs: 32,
            jitter_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthSection {
    pub token_validity_mins: u64,
    /// Rotation happens this long before expiry
    pub rotation_margin_secs: u64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            token_validity_mins: 20,
            rotation_margin_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetrySection {
    pub events_sub_topic: String,
    pub publish_interval_secs: u64,
    pub use_input_timestamp: bool,
    pub input_ts_format: String,
    pub output_ts_format: String,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            events_sub_topic: "events".to_string(),
            publish_interval_secs: 60,
            use_input_timestamp: false,
            input_ts_format: DEFAULT_INPUT_TS_FORMAT.to_string(),
            output_ts_format: DEFAULT_OUTPUT_TS_FORMAT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceSection {
    /// `.csv` with a `timestamp,value` header, or `.jsonl`
    pub path: PathBuf,
    /// Replay the data set while publishing stays enabled
    #[serde(default)]
    pub repeat: bool,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to render TOML: {0}")]
    TomlRender(#[from] toml::ser::Error),
    #[error("No config file found (searched: {0})")]
    NotFound(String),
    #[error("Invalid {field} '{value}': must be non-empty and must not contain '/', '+' or '#'")]
    InvalidCoordinate { field: &'static str, value: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TelemetryConfig {
    /// Load and validate; relative paths are resolved against the file's directory
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&content)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    /// Parse and validate TOML without touching the filesystem
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: TelemetryConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn resolve_paths(&mut self, base: &Path) {
        for path in [
            &mut self.device.private_key_file,
            &mut self.device.ca_certs,
            &mut self.source.path,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_coordinate("project_id", &self.device.project_id)?;
        validate_coordinate("location", &self.device.location)?;
        validate_coordinate("registry_id", &self.device.registry_id)?;
        validate_coordinate("device_id", &self.device.device_id)?;
        validate_sub_topic(&self.telemetry.events_sub_topic)?;

        self.broker_settings()?;
        if !(MIN_KEEP_ALIVE_SECS..=MAX_KEEP_ALIVE_SECS).contains(&self.broker.keep_alive_secs) {
            return Err(ConfigError::InvalidConfig(format!(
                "broker.keep_alive_secs must be between {MIN_KEEP_ALIVE_SECS} and {MAX_KEEP_ALIVE_SECS}"
            )));
        }
        if !(1..=MAX_CONNECT_TIMEOUT_SECS).contains(&self.broker.connect_timeout_secs) {
            return Err(ConfigError::InvalidConfig(format!(
                "broker.connect_timeout_secs must be between 1 and {MAX_CONNECT_TIMEOUT_SECS}"
            )));
        }

        if self.backoff.min_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "backoff.min_secs must be at least 1".to_string(),
            ));
        }
        if self.backoff.max_secs < self.backoff.min_secs {
            return Err(ConfigError::InvalidConfig(format!(
                "backoff.max_secs ({}) must not be below backoff.min_secs ({})",
                self.backoff.max_secs, self.backoff.min_secs
            )));
        }

        if !(1..=MAX_TOKEN_VALIDITY_MINS).contains(&self.auth.token_validity_mins) {
            return Err(ConfigError::InvalidConfig(format!(
                "auth.token_validity_mins must be between 1 and {MAX_TOKEN_VALIDITY_MINS}"
            )));
        }
        if self.auth.rotation_margin_secs >= self.auth.token_validity_mins.saturating_mul(60) {
            return Err(ConfigError::InvalidConfig(format!(
                "auth.rotation_margin_secs ({}) must be shorter than the token validity ({} min)",
                self.auth.rotation_margin_secs, self.auth.token_validity_mins
            )));
        }

        if self.telemetry.publish_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "telemetry.publish_interval_secs must be at least 1".to_string(),
            ));
        }
        for (field, format) in [
            ("telemetry.input_ts_format", &self.telemetry.input_ts_format),
            ("telemetry.output_ts_format", &self.telemetry.output_ts_format),
        ] {
            validate_format(format)
                .map_err(|e| ConfigError::InvalidConfig(format!("{field}: {e}")))?;
        }

        Ok(())
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            project_id: self.device.project_id.clone(),
            location: self.device.location.clone(),
            registry_id: self.device.registry_id.clone(),
            device_id: self.device.device_id.clone(),
            private_key_file: self.device.private_key_file.clone(),
            algorithm: self.device.algorithm,
        }
    }

    pub fn broker_settings(&self) -> Result<BrokerSettings, ConfigError> {
        BrokerSettings::parse(
            &self.broker.url,
            self.device.ca_certs.clone(),
            self.broker.keep_alive_secs,
        )
        .map_err(|e| ConfigError::InvalidConfig(format!("broker.url: {e}")))
    }

    pub fn topics(&self) -> TopicBuilder {
        TopicBuilder::new(
            self.device.device_id.clone(),
            self.telemetry.events_sub_topic.clone(),
        )
    }

    pub fn token_validity(&self) -> Duration {
        Duration::from_secs(self.auth.token_validity_mins.saturating_mul(60))
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry.publish_interval_secs)
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            topics: self.topics(),
            min_backoff: Duration::from_secs(self.backoff.min_secs),
            max_backoff: Duration::from_secs(self.backoff.max_secs),
            max_jitter: Duration::from_millis(self.backoff.jitter_ms),
            rotation_margin: Duration::from_secs(self.auth.rotation_margin_secs),
            connack_timeout: Duration::from_secs(self.broker.connect_timeout_secs),
        }
    }

    pub fn payload_options(&self) -> PayloadOptions {
        PayloadOptions {
            use_input_timestamp: self.telemetry.use_input_timestamp,
            input_ts_format: self.telemetry.input_ts_format.clone(),
            output_ts_format: self.telemetry.output_ts_format.clone(),
        }
    }
}

/// Explicit path wins; otherwise the first existing default path
pub fn find_config_file(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    DEFAULT_CONFIG_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.is_file())
        .ok_or_else(|| ConfigError::NotFound(DEFAULT_CONFIG_PATHS.join(", ")))
}

fn validate_coordinate(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() || value.contains(['/', '+', '#']) {
        return Err(ConfigError::InvalidCoordinate {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Sub-folders are allowed (`events/raw`), wildcards and empty levels are not
fn validate_sub_topic(value: &str) -> Result<(), ConfigError> {
    if value.contains(['+', '#']) || value.split('/').any(|level| level.trim().is_empty()) {
        return Err(ConfigError::InvalidConfig(format!(
            "telemetry.events_sub_topic '{value}' must be a topic path without wildcards"
        )));
    }
    Ok(())
}
