//! Device-local state driven by inbound config messages
//!
//! [`ConfigStateStore`] is the only mutable state shared between the inbound
//! dispatch path and the publish loop. Writes happen under a lock and the
//! `enabled` flag is mirrored into an atomic, so the loop can check it without
//! ever waiting on a writer.

use crate::observability::metrics::metrics;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{info, warn};

/// Key of the flag that gates telemetry publishing
pub const ENABLED_KEY: &str = "enabled";

/// Malformed config payloads. Always recovered locally.
#[derive(Debug, Error)]
pub enum ConfigParseError {
    #[error("Config payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("Config payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),
    #[error("Config key 'enabled' must be a boolean, got {0}")]
    InvalidEnabled(Value),
}

/// Named control flags. Always contains a boolean `enabled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceState {
    flags: Map<String, Value>,
}

impl Default for DeviceState {
    fn default() -> Self {
        let mut flags = Map::new();
        flags.insert(ENABLED_KEY.to_string(), Value::Bool(true));
        Self { flags }
    }
}

impl DeviceState {
    pub fn enabled(&self) -> bool {
        self.flags
            .get(ENABLED_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.flags.get(key)
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    /// Last write wins per key
    fn merge(&mut self, delta: Map<String, Value>) {
        for (key, value) in delta {
            self.flags.insert(key, value);
        }
    }
}

/// Validate a raw config payload into a key/value delta (pure function)
pub fn parse_delta(raw: &[u8]) -> Result<Map<String, Value>, ConfigParseError> {
    let value: Value = serde_json::from_slice(raw)?;
    let delta = match value {
        Value::Object(map) => map,
        Value::Null => return Err(ConfigParseError::NotAnObject("null")),
        Value::Bool(_) => return Err(ConfigParseError::NotAnObject("boolean")),
        Value::Number(_) => return Err(ConfigParseError::NotAnObject("number")),
        Value::String(_) => return Err(ConfigParseError::NotAnObject("string")),
        Value::Array(_) => return Err(ConfigParseError::NotAnObject("array")),
    };

    if let Some(enabled) = delta.get(ENABLED_KEY) {
        if !enabled.is_boolean() {
            return Err(ConfigParseError::InvalidEnabled(enabled.clone()));
        }
    }

    Ok(delta)
}

/// Guarded store for [`DeviceState`]
#[derive(Debug)]
pub struct ConfigStateStore {
    state: RwLock<DeviceState>,
    enabled: AtomicBool,
}

impl Default for ConfigStateStore {
    fn default() -> Self {
        Self::new(DeviceState::default())
    }
}

impl ConfigStateStore {
    pub fn new(initial: DeviceState) -> Self {
        let enabled = initial.enabled();
        Self {
            state: RwLock::new(initial),
            enabled: AtomicBool::new(enabled),
        }
    }

    /// Merge an inbound config payload.
    ///
    /// Returns the full state snapshot to report back on the state channel.
    /// A malformed payload leaves the state untouched.
    pub fn apply_delta(&self, raw: &[u8]) -> Result<DeviceState, ConfigParseError> {
        let delta = match parse_delta(raw) {
            Ok(delta) => delta,
            Err(e) => {
                metrics().config_delta_rejected();
                return Err(e);
            }
        };

        let mut state = self.state.write();
        state.merge(delta);
        self.enabled.store(state.enabled(), Ordering::Release);
        metrics().config_delta_applied();

        info!(enabled = state.enabled(), keys = state.len(), "Applied config delta");
        Ok(state.clone())
    }

    /// Apply a delta at the dispatch boundary: errors are logged and swallowed
    pub fn apply_or_discard(&self, raw: &[u8]) -> Option<DeviceState> {
        match self.apply_delta(raw) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("Config message is incorrect, discarding: {}", e);
                None
            }
        }
    }

    /// Lock-free read of the publishing gate
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.read().get(key).cloned()
    }

    pub fn snapshot(&self) -> DeviceState {
        self.state.read().clone()
    }

    /// Serialized snapshot as published on the state channel
    pub fn snapshot_json(&self) -> Vec<u8> {
        serde_json::to_vec(&*self.state.read()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_default_state_is_enabled() {
        let store = ConfigStateStore::default();
        assert!(store.is_enabled());
        assert_eq!(store.snapshot_json(), br#"{"enabled":true}"#.to_vec());
    }

    #[test]
    fn test_delta_merges_last_write_wins() {
        let store = ConfigStateStore::default();
        store
            .apply_delta(br#"{"enabled": true, "mode": "fast", "rate": 1}"#)
            .unwrap();
        let snapshot = store.apply_delta(br#"{"rate": 5}"#).unwrap();

        assert_eq!(snapshot.get("mode"), Some(&json!("fast")));
        assert_eq!(snapshot.get("rate"), Some(&json!(5)));
        assert_eq!(store.get("rate"), Some(json!(5)));
        assert!(store.is_enabled());
    }

    #[test]
    fn test_disable_flag_is_visible_to_reader() {
        let store = ConfigStateStore::default();
        let snapshot = store.apply_delta(br#"{"enabled": false}"#).unwrap();
        assert!(!snapshot.enabled());
        assert!(!store.is_enabled());
    }

    #[test]
    fn test_malformed_payload_leaves_state_byte_identical() {
        let store = ConfigStateStore::default();
        store.apply_delta(br#"{"mode": "slow"}"#).unwrap();
        let before = store.snapshot_json();

        let payloads: [&[u8]; 6] = [
            b"\xff\xfe not json",
            b"",
            b"[1, 2, 3]",
            b"\"enabled\"",
            br#"{"enabled": "no"}"#,
            br#"{"enabled": false"#,
        ];
        for payload in payloads {
            assert!(store.apply_delta(payload).is_err());
            assert!(store.apply_or_discard(payload).is_none());
        }

        assert_eq!(store.snapshot_json(), before);
        assert!(store.is_enabled());
    }

    #[test]
    fn test_parse_delta_error_kinds() {
        assert!(matches!(
            parse_delta(b"not json"),
            Err(ConfigParseError::InvalidJson(_))
        ));
        assert!(matches!(
            parse_delta(b"null"),
            Err(ConfigParseError::NotAnObject("null"))
        ));
        assert!(matches!(
            parse_delta(br#"{"enabled": 0}"#),
            Err(ConfigParseError::InvalidEnabled(_))
        ));
        assert_eq!(parse_delta(b"{}").unwrap().len(), 0);
    }

    #[test]
    fn test_concurrent_reads_and_writes_stay_consistent() {
        let store = Arc::new(ConfigStateStore::default());
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    let payload = format!(r#"{{"enabled": {}, "seq": {}}}"#, i % 2 == 0, i);
                    store.apply_delta(payload.as_bytes()).unwrap();
                }
            })
        };

        for _ in 0..500 {
            let snapshot = store.snapshot();
            assert!(snapshot.get(ENABLED_KEY).map(Value::is_boolean).unwrap_or(false));
            let _ = store.is_enabled();
        }
        writer.join().unwrap();

        // Last delta had seq 499, enabled false
        assert!(!store.is_enabled());
        assert_eq!(store.get("seq"), Some(json!(499)));
    }
}
