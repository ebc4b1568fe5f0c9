//! Connection manager: the session state machine
//!
//! A supervisor task owns the transport and drives
//! `Disconnected -> Connecting -> Connected -> AwaitingBackoff -> ... -> Terminated`.
//! Every transport callback is turned into a [`ConnectionEvent`] and applied
//! through [`HealthMonitor::determine_next_state`]; nothing else mutates the
//! state. The same task dispatches inbound messages, so config deltas and
//! commands are handled independently of the publish loop.
//!
//! Callers observe the state through a [`ConnectionHandle`]. `await_ready`
//! returns the publisher of the current connection epoch, or an error once the
//! manager has terminated.

use crate::auth::CredentialIssuer;
use crate::commands::CommandHandler;
use crate::error::redact_secrets;
use crate::observability::metrics::metrics;
use crate::state::ConfigStateStore;
use crate::transport::mqtt::{
    BackoffPolicy, ConnectionEvent, ConnectionState, HealthMonitor, InboundRoute, MessageHandler,
    ReconnectionDecision, TopicBuilder,
};
use crate::transport::{MqttError, Publisher, Transport, TransportEvent};
use chrono::Utc;
use rand::Rng;
use rumqttc::QoS;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout_at, Instant};
use tracing::{debug, error, info, warn, Instrument};

/// Why the manager stopped
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConnectionError {
    #[error("Exceeded maximum backoff time after {attempts} reconnection attempts (max backoff {max_backoff:?}), giving up")]
    GaveUp { attempts: u32, max_backoff: Duration },
    #[error("Could not issue credentials: {0}")]
    Credential(String),
    #[error("Connection manager shut down")]
    Shutdown,
}

/// Tunables for the session state machine
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub topics: TopicBuilder,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Jitter is drawn uniformly from `[0, max_jitter)`
    pub max_jitter: Duration,
    /// Rotate this long before the token expires
    pub rotation_margin: Duration,
    /// How long to wait for the broker to accept a new session
    pub connack_timeout: Duration,
}

impl ConnectionSettings {
    pub fn new(topics: TopicBuilder) -> Self {
        Self {
            topics,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(32),
            max_jitter: Duration::from_secs(1),
            rotation_margin: Duration::from_secs(60),
            connack_timeout: Duration::from_secs(30),
        }
    }
}

/// Snapshot broadcast to every [`ConnectionHandle`]
#[derive(Clone)]
pub struct SessionStatus<P> {
    pub state: ConnectionState,
    /// Incremented on every successful connection
    pub epoch: u64,
    publisher: Option<P>,
    termination: Option<ConnectionError>,
}

/// Read side of the connection state
#[derive(Clone)]
pub struct ConnectionHandle<P> {
    rx: watch::Receiver<SessionStatus<P>>,
}

impl<P: Publisher> ConnectionHandle<P> {
    pub fn state(&self) -> ConnectionState {
        self.rx.borrow().state
    }

    pub fn epoch(&self) -> u64 {
        self.rx.borrow().epoch
    }

    /// Set once the manager has terminated
    pub fn termination(&self) -> Option<ConnectionError> {
        self.rx.borrow().termination.clone()
    }

    /// Block until the session is Connected (returns its publisher) or
    /// Terminated (returns why).
    pub async fn await_ready(&mut self) -> Result<P, ConnectionError> {
        loop {
            {
                let status = self.rx.borrow_and_update();
                match status.state {
                    ConnectionState::Connected => {
                        if let Some(publisher) = &status.publisher {
                            return Ok(publisher.clone());
                        }
                    }
                    ConnectionState::Terminated => {
                        return Err(status
                            .termination
                            .clone()
                            .unwrap_or(ConnectionError::Shutdown));
                    }
                    _ => {}
                }
            }

            if self.rx.changed().await.is_err() {
                return Err(self.termination().unwrap_or(ConnectionError::Shutdown));
            }
        }
    }
}

/// Owns the supervisor task. Dropping the manager requests shutdown.
pub struct ConnectionManager<P> {
    handle: ConnectionHandle<P>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl<P: Publisher> ConnectionManager<P> {
    /// Spawn the supervisor and request the first connection
    pub fn start<T>(
        transport: T,
        issuer: Arc<CredentialIssuer>,
        store: Arc<ConfigStateStore>,
        commands: Arc<dyn CommandHandler>,
        settings: ConnectionSettings,
    ) -> Self
    where
        T: Transport<Publisher = P>,
    {
        let (status_tx, status_rx) = watch::channel(SessionStatus {
            state: ConnectionState::Disconnected,
            epoch: 0,
            publisher: None,
            termination: None,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let span = crate::mqtt_span!(client_id = %issuer.identity().client_id());
        let supervisor = Supervisor {
            transport,
            issuer,
            store,
            commands,
            backoff: BackoffPolicy::new(settings.min_backoff, settings.max_backoff),
            settings,
            state: ConnectionState::Disconnected,
            status_tx,
            shutdown_rx,
            publisher: None,
            epoch: 0,
            token_issued: Instant::now(),
            rotation_threshold: Duration::MAX,
            termination: None,
        };

        let task = tokio::spawn(supervisor.run().instrument(span));

        Self {
            handle: ConnectionHandle { rx: status_rx },
            shutdown_tx,
            task: Some(task),
        }
    }

    pub fn handle(&self) -> ConnectionHandle<P> {
        self.handle.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    /// Stop the supervisor and wait until the transport is closed
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Connection supervisor task failed: {}", e);
            }
        }
    }
}

impl<P> Drop for ConnectionManager<P> {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Resolves once shutdown is requested or the manager is gone
pub(crate) async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Upper jitter bound in whole milliseconds, saturating like [`BackoffPolicy`]
fn jitter_bound_ms(max_jitter: Duration) -> u64 {
    u64::try_from(max_jitter.as_millis()).unwrap_or(u64::MAX)
}

fn draw_jitter(max_jitter: Duration) -> Duration {
    let max_ms = jitter_bound_ms(max_jitter);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
}

struct Supervisor<T: Transport> {
    transport: T,
    issuer: Arc<CredentialIssuer>,
    store: Arc<ConfigStateStore>,
    commands: Arc<dyn CommandHandler>,
    settings: ConnectionSettings,
    backoff: BackoffPolicy,
    state: ConnectionState,
    status_tx: watch::Sender<SessionStatus<T::Publisher>>,
    shutdown_rx: watch::Receiver<bool>,
    publisher: Option<T::Publisher>,
    epoch: u64,
    token_issued: Instant,
    rotation_threshold: Duration,
    termination: Option<ConnectionError>,
}

enum ConnectedStep {
    Shutdown,
    RotationDue,
    Polled(Result<TransportEvent, MqttError>),
}

impl<T: Transport> Supervisor<T> {
    async fn run(mut self) {
        info!("Starting MQTT connection supervisor");
        self.apply(ConnectionEvent::ConnectRequested);

        while !self.state.is_terminal() {
            let event = match self.state {
                ConnectionState::Disconnected => ConnectionEvent::ConnectRequested,
                ConnectionState::Connecting => self.connect().await,
                ConnectionState::Connected => self.serve().await,
                ConnectionState::AwaitingBackoff => self.wait_backoff().await,
                ConnectionState::Terminated => break,
            };
            self.apply(event);
        }

        // Guaranteed release on every exit path
        self.transport.close().await;
        info!("MQTT connection supervisor stopped");
    }

    /// Apply one event through the pure transition function
    fn apply(&mut self, event: ConnectionEvent) {
        let from = self.state;
        let Some(to) = HealthMonitor::determine_next_state(from, &event) else {
            debug!("Ignoring {:?} in state {}", event, from);
            return;
        };
        HealthMonitor::log_state_transition(from, to, &event);

        match (from, to) {
            (_, ConnectionState::Connected) => {
                self.backoff.reset();
                metrics().mqtt_connection_established();
            }
            (ConnectionState::Connected, ConnectionState::Connecting) => {
                self.publisher = None;
                metrics().credential_rotated();
            }
            (ConnectionState::Connected, ConnectionState::AwaitingBackoff) => {
                self.publisher = None;
                metrics().mqtt_connection_lost();
            }
            (ConnectionState::Connecting, ConnectionState::AwaitingBackoff) => {
                self.publisher = None;
                metrics().mqtt_connection_failed();
            }
            _ => {}
        }

        if to == ConnectionState::Terminated {
            self.publisher = None;
            self.termination = Some(match event {
                ConnectionEvent::BackoffExhausted => ConnectionError::GaveUp {
                    attempts: self.backoff.attempt(),
                    max_backoff: self.backoff.max(),
                },
                ConnectionEvent::CredentialFailure(reason) => ConnectionError::Credential(reason),
                _ => ConnectionError::Shutdown,
            });
        }

        self.state = to;
        self.status_tx.send_replace(SessionStatus {
            state: to,
            epoch: self.epoch,
            publisher: self.publisher.clone(),
            termination: self.termination.clone(),
        });
    }

    /// Connecting: fresh token, new session, wait for ConnAck, subscribe
    async fn connect(&mut self) -> ConnectionEvent {
        if *self.shutdown_rx.borrow() {
            return ConnectionEvent::ShutdownRequested;
        }
        metrics().mqtt_connection_attempt();

        let token = match self.issuer.issue(Utc::now()) {
            Ok(token) => token,
            Err(e) => return ConnectionEvent::CredentialFailure(e.to_string()),
        };
        let issued = Instant::now();

        let opened = tokio::select! {
            _ = shutdown_signalled(&mut self.shutdown_rx) => return ConnectionEvent::ShutdownRequested,
            opened = self.transport.open(&token) => opened,
        };
        let publisher = match opened {
            Ok(publisher) => publisher,
            Err(e) => return ConnectionEvent::TransportError(redact_secrets(&e.to_string())),
        };

        let deadline = Instant::now() + self.settings.connack_timeout;
        loop {
            let polled = tokio::select! {
                _ = shutdown_signalled(&mut self.shutdown_rx) => return ConnectionEvent::ShutdownRequested,
                polled = timeout_at(deadline, self.transport.poll()) => polled,
            };
            match polled {
                Err(_) => {
                    return ConnectionEvent::TransportError(
                        MqttError::ConnAckTimeout(self.settings.connack_timeout).to_string(),
                    )
                }
                Ok(Ok(TransportEvent::ConnAck)) => break,
                Ok(Ok(TransportEvent::Disconnected(reason))) => {
                    warn!("Broker closed session before ConnAck: {}", reason);
                    return ConnectionEvent::BrokerDisconnect;
                }
                Ok(Ok(other)) => debug!("Event before ConnAck: {:?}", other),
                Ok(Err(e)) => {
                    return ConnectionEvent::TransportError(redact_secrets(&e.to_string()))
                }
            }
        }

        for (topic, qos) in MessageHandler::build_subscriptions(&self.settings.topics) {
            if let Err(e) = publisher.subscribe(&topic, qos).await {
                return ConnectionEvent::TransportError(format!("subscribe to {topic} failed: {e}"));
            }
        }

        self.token_issued = issued;
        self.rotation_threshold = token.rotate_after(self.settings.rotation_margin);
        self.epoch += 1;
        self.publisher = Some(publisher);
        info!(
            epoch = self.epoch,
            rotate_in_secs = self.rotation_threshold.as_secs(),
            "Session authenticated"
        );
        ConnectionEvent::AuthenticatedAck
    }

    /// Connected: dispatch inbound messages until failure, rotation or shutdown
    async fn serve(&mut self) -> ConnectionEvent {
        let rotate_at = self.token_issued + self.rotation_threshold;

        loop {
            let step = tokio::select! {
                biased;
                _ = shutdown_signalled(&mut self.shutdown_rx) => ConnectedStep::Shutdown,
                _ = sleep_until(rotate_at) => ConnectedStep::RotationDue,
                polled = self.transport.poll() => ConnectedStep::Polled(polled),
            };

            match step {
                ConnectedStep::Shutdown => return ConnectionEvent::ShutdownRequested,
                ConnectedStep::RotationDue => {
                    let age = self.token_issued.elapsed();
                    if HealthMonitor::should_rotate(age, self.rotation_threshold) {
                        info!("Refreshing token after {}s", age.as_secs());
                        self.transport.close().await;
                        return ConnectionEvent::TokenStale;
                    }
                }
                ConnectedStep::Polled(Ok(TransportEvent::Message {
                    topic,
                    payload,
                    qos,
                })) => self.dispatch(&topic, &payload, qos).await,
                ConnectedStep::Polled(Ok(TransportEvent::Disconnected(reason))) => {
                    warn!("on_disconnect: {}", reason);
                    return ConnectionEvent::BrokerDisconnect;
                }
                ConnectedStep::Polled(Ok(TransportEvent::ConnAck)) => {
                    debug!("Duplicate ConnAck ignored");
                }
                ConnectedStep::Polled(Ok(TransportEvent::Other(_))) => {}
                ConnectedStep::Polled(Err(e)) => {
                    return ConnectionEvent::TransportError(redact_secrets(&e.to_string()));
                }
            }
        }
    }

    /// AwaitingBackoff: close, then wait or give up
    async fn wait_backoff(&mut self) -> ConnectionEvent {
        self.transport.close().await;

        let jitter = draw_jitter(self.settings.max_jitter);
        let decision =
            HealthMonitor::decide_reconnection(&mut self.backoff, jitter, *self.shutdown_rx.borrow());

        match decision {
            ReconnectionDecision::Proceed { attempt, delay } => {
                info!(
                    attempt,
                    "Waiting for {:.3}s before reconnecting",
                    delay.as_secs_f64()
                );
                tokio::select! {
                    _ = shutdown_signalled(&mut self.shutdown_rx) => ConnectionEvent::ShutdownRequested,
                    _ = sleep(delay) => ConnectionEvent::DelayElapsed,
                }
            }
            ReconnectionDecision::GiveUp { last_delay } => {
                warn!(
                    next_delay_secs = last_delay.as_secs(),
                    max_backoff_secs = self.backoff.max().as_secs(),
                    "Exceeded maximum backoff time. Giving up."
                );
                ConnectionEvent::BackoffExhausted
            }
            ReconnectionDecision::AbortShutdownRequested => ConnectionEvent::ShutdownRequested,
        }
    }

    /// Route one inbound message. Never fails past this boundary.
    async fn dispatch(&mut self, topic: &str, payload: &[u8], qos: QoS) {
        match MessageHandler::route_inbound(topic, &self.settings.topics) {
            InboundRoute::Config => {
                info!(
                    "Received config message '{}' on topic '{}' with QoS {:?}",
                    String::from_utf8_lossy(payload),
                    topic,
                    qos
                );
                let Some(snapshot) = self.store.apply_or_discard(payload) else {
                    return;
                };
                let Some(publisher) = &self.publisher else {
                    return;
                };
                let body = match serde_json::to_vec(&snapshot) {
                    Ok(body) => body,
                    Err(e) => {
                        warn!("Failed to serialize device state: {}", e);
                        return;
                    }
                };
                match publisher
                    .publish(&self.settings.topics.state(), QoS::AtLeastOnce, body)
                    .await
                {
                    Ok(()) => metrics().mqtt_message_published(),
                    Err(e) => {
                        metrics().mqtt_publish_failed();
                        warn!("Failed to report device state: {}", e);
                    }
                }
            }
            InboundRoute::Command { subfolder } => {
                metrics().command_received();
                self.commands.handle_command(subfolder.as_deref(), payload);
            }
            InboundRoute::Unrouted => {
                info!(
                    "Received message '{}' on topic '{}' with QoS {:?}",
                    String::from_utf8_lossy(payload),
                    topic,
                    qos
                );
            }
        }
    }
}
