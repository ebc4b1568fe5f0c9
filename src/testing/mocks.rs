//! Mock implementations for testing
//!
//! [`MockTransport`] plays a broker: each `open` consumes one scripted
//! [`OpenOutcome`], accepted sessions yield a ConnAck, and tests inject inbound
//! messages or disconnects through a cloned handle. Everything the client
//! sends is recorded with the session epoch it was sent in.

use crate::auth::AuthToken;
use crate::commands::CommandHandler;
use crate::transport::{MqttError, Publisher, Transport, TransportEvent};
use async_trait::async_trait;
use rumqttc::QoS;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

/// What the mock broker does with the next `open`
#[derive(Debug, Clone, PartialEq)]
pub enum OpenOutcome {
    /// Session opens and is acknowledged
    Accept,
    /// `open` itself fails (network unreachable, TLS failure)
    RefuseOpen(String),
    /// Session opens but the broker rejects the credentials
    RejectAuth,
    /// Session opens and the broker never answers
    Silent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub epoch: u64,
}

#[derive(Debug)]
enum Pending {
    Event(TransportEvent),
    Reject,
}

#[derive(Debug, Default)]
struct BrokerState {
    script: VecDeque<OpenOutcome>,
    refuse_unscripted: bool,
    epoch: u64,
    session_open: bool,
    pending: VecDeque<Pending>,
    open_times: Vec<Instant>,
    closes: u32,
    tokens: Vec<String>,
    published: Vec<PublishedMessage>,
    subscriptions: Vec<(String, QoS, u64)>,
}

/// Scripted in-memory broker
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<BrokerState>>,
    inbound_tx: mpsc::UnboundedSender<TransportEvent>,
    inbound_rx: Arc<Mutex<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl MockTransport {
    /// Accepts every session
    pub fn new() -> Self {
        Self::with_state(BrokerState::default())
    }

    /// Consumes `outcomes` in order, then accepts
    pub fn with_script(outcomes: impl IntoIterator<Item = OpenOutcome>) -> Self {
        Self::with_state(BrokerState {
            script: outcomes.into_iter().collect(),
            ..Default::default()
        })
    }

    /// Broker is unreachable for good
    pub fn unreachable() -> Self {
        Self::with_state(BrokerState {
            refuse_unscripted: true,
            ..Default::default()
        })
    }

    fn with_state(state: BrokerState) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(state)),
            inbound_tx,
            inbound_rx: Arc::new(Mutex::new(inbound_rx)),
        }
    }

    /// Deliver a message on the current session
    pub fn inject_message(&self, topic: &str, payload: impl Into<Vec<u8>>, qos: QoS) {
        let _ = self.inbound_tx.send(TransportEvent::Message {
            topic: topic.to_string(),
            payload: payload.into(),
            qos,
        });
    }

    /// Simulate the broker dropping the session
    pub fn drop_connection(&self, reason: &str) {
        let _ = self.inbound_tx.send(TransportEvent::Disconnected(reason.to_string()));
    }

    pub async fn opens(&self) -> usize {
        self.state.lock().await.open_times.len()
    }

    /// `tokio::time::Instant` of every `open`, for paused-time assertions
    pub async fn open_times(&self) -> Vec<Instant> {
        self.state.lock().await.open_times.clone()
    }

    /// Sessions that were open and then closed
    pub async fn closes(&self) -> u32 {
        self.state.lock().await.closes
    }

    pub async fn is_session_open(&self) -> bool {
        self.state.lock().await.session_open
    }

    /// Passwords presented on each `open`
    pub async fn tokens(&self) -> Vec<String> {
        self.state.lock().await.tokens.clone()
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().await.published.clone()
    }

    pub async fn published_on(&self, topic: &str) -> Vec<PublishedMessage> {
        self.state
            .lock()
            .await
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub async fn subscriptions(&self) -> Vec<(String, QoS, u64)> {
        self.state.lock().await.subscriptions.clone()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Publisher = MockPublisher;

    async fn open(&mut self, token: &AuthToken) -> Result<Self::Publisher, MqttError> {
        let mut state = self.state.lock().await;
        if state.session_open {
            state.closes += 1;
        }
        state.session_open = false;
        state.pending.clear();
        state.open_times.push(Instant::now());
        state.tokens.push(token.as_password().to_string());

        let outcome = state.script.pop_front().unwrap_or_else(|| {
            if state.refuse_unscripted {
                OpenOutcome::RefuseOpen("broker unreachable".to_string())
            } else {
                OpenOutcome::Accept
            }
        });

        let first_poll = match outcome {
            OpenOutcome::RefuseOpen(reason) => {
                return Err(MqttError::ConnectionFailed(reason.into()))
            }
            OpenOutcome::Accept => Some(Pending::Event(TransportEvent::ConnAck)),
            OpenOutcome::RejectAuth => Some(Pending::Reject),
            OpenOutcome::Silent => None,
        };

        state.epoch += 1;
        state.session_open = true;
        state.pending.extend(first_poll);
        Ok(MockPublisher {
            state: Arc::clone(&self.state),
            epoch: state.epoch,
        })
    }

    async fn poll(&mut self) -> Result<TransportEvent, MqttError> {
        {
            let mut state = self.state.lock().await;
            if !state.session_open {
                return Err(MqttError::NotConnected);
            }
            match state.pending.pop_front() {
                Some(Pending::Event(event)) => return Ok(event),
                Some(Pending::Reject) => {
                    state.session_open = false;
                    return Err(MqttError::AuthenticationRejected(
                        "BadUserNamePassword".to_string(),
                    ));
                }
                None => {}
            }
        }

        let event = self.inbound_rx.lock().await.recv().await;
        match event {
            Some(TransportEvent::Disconnected(reason)) => {
                self.state.lock().await.session_open = false;
                Ok(TransportEvent::Disconnected(reason))
            }
            Some(event) => Ok(event),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        let mut state = self.state.lock().await;
        if state.session_open {
            state.session_open = false;
            state.closes += 1;
        }
        state.pending.clear();
    }
}

/// Publisher bound to one mock session
#[derive(Clone)]
pub struct MockPublisher {
    state: Arc<Mutex<BrokerState>>,
    epoch: u64,
}

impl MockPublisher {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), MqttError> {
        let mut state = self.state.lock().await;
        if !state.session_open || state.epoch != self.epoch {
            return Err(MqttError::NotConnected);
        }
        state.published.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
            epoch: self.epoch,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), MqttError> {
        let mut state = self.state.lock().await;
        if !state.session_open || state.epoch != self.epoch {
            return Err(MqttError::NotConnected);
        }
        state.subscriptions.push((topic.to_string(), qos, self.epoch));
        Ok(())
    }
}

/// Command handler that records what it receives
#[derive(Debug, Default)]
pub struct RecordingCommandHandler {
    received: parking_lot::Mutex<Vec<(Option<String>, Vec<u8>)>>,
}

impl RecordingCommandHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> Vec<(Option<String>, Vec<u8>)> {
        self.received.lock().clone()
    }
}

impl CommandHandler for RecordingCommandHandler {
    fn handle_command(&self, subfolder: Option<&str>, payload: &[u8]) {
        self.received
            .lock()
            .push((subfolder.map(str::to_string), payload.to_vec()));
    }
}
