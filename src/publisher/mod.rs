//! The publish loop
//!
//! One sequential task: gate on `enabled`, draw a measurement, wait for a
//! Connected session, format, publish at QoS 1, sleep. The only suspension
//! points are the readiness wait, the source and the inter-publish sleep.

pub mod payload;

pub use payload::{format_payload, PayloadError, PayloadOptions, TelemetryPayload};

use crate::error::TelemetryError;
use crate::manager::{shutdown_signalled, ConnectionHandle};
use crate::observability::metrics::metrics;
use crate::source::MeasurementSource;
use crate::state::ConfigStateStore;
use crate::transport::Publisher;
use chrono::Utc;
use rumqttc::QoS;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

/// Why the loop returned without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// `enabled` was false at the top of an iteration
    Disabled,
    /// The measurement source has no more data
    SourceExhausted,
    /// External stop signal
    Cancelled,
}

/// Stop predicate checked at the top of every iteration
pub fn should_stop(enabled: bool, shutdown_requested: bool) -> bool {
    !enabled || shutdown_requested
}

pub struct PublishLoop<P, S> {
    connection: ConnectionHandle<P>,
    store: Arc<ConfigStateStore>,
    source: S,
    events_topic: String,
    options: PayloadOptions,
    interval: Duration,
    published: u64,
}

impl<P: Publisher, S: MeasurementSource> PublishLoop<P, S> {
    pub fn new(
        connection: ConnectionHandle<P>,
        store: Arc<ConfigStateStore>,
        source: S,
        events_topic: impl Into<String>,
        options: PayloadOptions,
        interval: Duration,
    ) -> Self {
        Self {
            connection,
            store,
            source,
            events_topic: events_topic.into(),
            options,
            interval,
            published: 0,
        }
    }

    /// Messages handed to the transport so far
    pub fn published(&self) -> u64 {
        self.published
    }

    /// Run until disabled, exhausted, cancelled or the connection terminates.
    ///
    /// A terminated connection is the only error; payload and publish
    /// failures are logged and the loop moves on.
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<LoopOutcome, TelemetryError> {
        info!(
            topic = %self.events_topic,
            interval_secs = self.interval.as_secs(),
            "Starting publish loop"
        );

        loop {
            let shutdown_requested = *shutdown.borrow();
            if should_stop(self.store.is_enabled(), shutdown_requested) {
                return Ok(if shutdown_requested {
                    LoopOutcome::Cancelled
                } else {
                    info!("Publishing disabled by device config, stopping");
                    LoopOutcome::Disabled
                });
            }

            let next = tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => return Ok(LoopOutcome::Cancelled),
                next = self.source.next_measurement() => next?,
            };
            let Some(measurement) = next else {
                info!("Measurement source exhausted after {} messages", self.published);
                return Ok(LoopOutcome::SourceExhausted);
            };

            let ready = tokio::select! {
                biased;
                _ = shutdown_signalled(&mut shutdown) => return Ok(LoopOutcome::Cancelled),
                ready = self.connection.await_ready() => ready,
            };
            let publisher = ready?;

            let body = match format_payload(&measurement, &self.options, Utc::now())
                .and_then(|payload| payload.to_json())
            {
                Ok(body) => body,
                Err(e) => {
                    warn!("Skipping measurement {:?}: {}", measurement, e);
                    continue;
                }
            };

            let sequence = self.published + 1;
            let epoch = self.connection.epoch();
            let span = crate::publish_span!(sequence, epoch);
            span.in_scope(|| info!("Publishing message: '{}'", String::from_utf8_lossy(&body)));
            let result = publisher
                .publish(&self.events_topic, QoS::AtLeastOnce, body)
                .instrument(span.clone())
                .await;
            span.in_scope(|| match result {
                Ok(()) => {
                    metrics().mqtt_message_published();
                    self.published = sequence;
                }
                Err(e) => {
                    metrics().mqtt_publish_failed();
                    warn!("Publish failed: {}", e);
                }
            });

            debug!("Sleeping {:?} before next measurement", self.interval);
            tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => return Ok(LoopOutcome::Cancelled),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}
