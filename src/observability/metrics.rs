//! Thread-safe metrics collection
//!
//! Atomic counters for connection, publishing and inbound control activity.
//! A snapshot is logged when the client shuts down.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Lock-free metrics collector
pub struct MetricsCollector {
    mqtt_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    credential_rotations: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    config_deltas_applied: AtomicU64,
    config_deltas_rejected: AtomicU64,
    commands_received: AtomicU64,
    connection_start_time: AtomicU64,
    uptime_start: AtomicU64,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            mqtt_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            credential_rotations: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            config_deltas_applied: AtomicU64::new(0),
            config_deltas_rejected: AtomicU64::new(0),
            commands_received: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // MQTT metrics
    pub fn mqtt_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn mqtt_connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        self.mqtt_connected.store(false, Ordering::Relaxed);
    }

    pub fn credential_rotated(&self) {
        self.credential_rotations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Inbound control metrics
    pub fn config_delta_applied(&self) {
        self.config_deltas_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn config_delta_rejected(&self) {
        self.config_deltas_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_received(&self) {
        self.commands_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let connection_start = self.connection_start_time.load(Ordering::Relaxed);

        MetricsSnapshot {
            timestamp: now,
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            mqtt: MqttMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                credential_rotations: self.credential_rotations.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                connection_uptime_seconds: if connection_start > 0 {
                    Some(now.saturating_sub(connection_start))
                } else {
                    None
                },
            },
            control: ControlMetrics {
                config_deltas_applied: self.config_deltas_applied.load(Ordering::Relaxed),
                config_deltas_rejected: self.config_deltas_rejected.load(Ordering::Relaxed),
                commands_received: self.commands_received.load(Ordering::Relaxed),
            },
        }
    }
}

/// Complete metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub uptime_seconds: u64,
    pub mqtt: MqttMetrics,
    pub control: ControlMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub credential_rotations: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub connection_uptime_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlMetrics {
    pub config_deltas_applied: u64,
    pub config_deltas_rejected: u64,
    pub commands_received: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
